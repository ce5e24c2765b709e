//! The Drive data model (§3) and its construction sequence (§4.7): claim
//! an interface, pick BOT or UASP, open endpoints, query Max LUN, and
//! probe every LUN it reports.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::block::BlockAdapter;
use crate::config::Config;
use crate::error::CoreError;
use crate::fs_adapter::{self, FilesystemDriver};
use crate::lun::{self, Channel, Lun};
use nusb::DeviceInfo;

use crate::usb::host::{self, ClaimedInterface, NusbTransport};
use crate::usb::uasp::Demultiplexer;

/// Which shape of transport a Drive ended up with, resolved once at
/// construction time (§4.3: UASP is preferred when declared).
pub enum TransportHandle {
    Bot(NusbTransport),
    Uasp(NusbTransport, Demultiplexer),
}

/// Everything about a Drive that lives behind its single async mutex
/// (§3's "recursive mutex" attribute, resolved per §3.1 as guard-passing:
/// every internal method takes `&mut DriveInner` instead of re-acquiring).
pub struct DriveInner {
    pub config: Config,
    pub transport: TransportHandle,
    pub luns: Vec<Lun>,
    next_tag: u32,
}

impl DriveInner {
    pub fn next_tag(&mut self) -> u32 {
        self.next_tag = self.next_tag.wrapping_add(1);
        self.next_tag
    }

    pub fn block_length(&self, lun_index: u8) -> u32 {
        self.luns.iter().find(|l| l.index == lun_index).map(|l| l.block_length).unwrap_or(512)
    }
}

/// One acquired USB interface whose class/subclass/protocol matched Mass
/// Storage + SCSI Transparent + (BOT or UASP) (§3 Drive attribute).
pub struct Drive {
    pub interface_number: u8,
    pub device_index: u32,
    pub uasp: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    inner: Arc<Mutex<DriveInner>>,
}

impl Drive {
    /// A non-owning handle to this Drive's guarded state, the shape every
    /// `BlockAdapter` holds so the Drive ↔ LUN ↔ FilesystemAdapter graph
    /// never has a reference cycle (§9).
    pub fn weak_inner(&self) -> Weak<Mutex<DriveInner>> {
        Arc::downgrade(&self.inner)
    }

    pub fn inner(&self) -> &Arc<Mutex<DriveInner>> {
        &self.inner
    }
}

/// Constructs a Drive from a claimed interface: selects the transport,
/// queries Max LUN, probes every LUN, and tries to mount a filesystem on
/// each one that probed successfully (§4.7 "On InterfaceAvailable").
///
/// Returns `Ok(None)` when no LUN yielded a mounted filesystem — per §3's
/// invariant the caller must not register such a Drive.
#[instrument(skip(claimed, device_info, drivers, cfg))]
pub async fn construct(
    claimed: ClaimedInterface,
    device_info: &DeviceInfo,
    vendor_id: u16,
    product_id: u16,
    device_index: u32,
    drivers: &[Arc<dyn FilesystemDriver>],
    cfg: Config,
) -> Result<Option<Drive>, CoreError> {
    let ClaimedInterface { interface, interface_number, uasp } = claimed;

    let mut transport = if uasp {
        let endpoints = host::open_uasp_endpoints(&interface, device_info)
            .await
            .map_err(|_| CoreError::Resource("failed to open UASP endpoints".into()))?;
        TransportHandle::Uasp(NusbTransport::new_uasp(interface.clone(), interface_number, endpoints), Demultiplexer::new())
    } else {
        let (writer, reader, out_addr, in_addr) = host::open_bot_endpoints(&interface, device_info)
            .await
            .map_err(|_| CoreError::Resource("failed to open BOT endpoints".into()))?;
        TransportHandle::Bot(NusbTransport::new_bot(interface.clone(), interface_number, writer, reader, out_addr, in_addr))
    };

    let max_lun = if uasp {
        // UASP devices report LUNs via REPORT LUNS rather than the BOT
        // class request (§4.4); a single-LUN assumption stands until the
        // first probe runs REPORT LUNS itself. Most UASP bridges back a
        // single LUN in practice.
        0u8
    } else {
        match &mut transport {
            TransportHandle::Bot(t) => t.get_max_lun(cfg.command_timeout).await.unwrap_or(0),
            TransportHandle::Uasp(..) => unreachable!(),
        }
    };

    let manufacturer = device_info.manufacturer_string().map(str::to_string);
    let product = device_info.product_string().map(str::to_string);
    let serial = device_info.serial_number().map(str::to_string);
    let serial_for_luns = serial.clone().unwrap_or_default();

    let mut luns = Vec::new();
    for lun_index in 0..=max_lun {
        let probed = match &mut transport {
            TransportHandle::Bot(t) => {
                let mut channel = Channel::Bot(t);
                lun::probe(&mut channel, lun_index, &serial_for_luns, &cfg).await
            }
            TransportHandle::Uasp(t, demux) => {
                let mut channel = Channel::Uasp(t, demux);
                lun::probe(&mut channel, lun_index, &serial_for_luns, &cfg).await
            }
        };
        match probed {
            Ok(Some(l)) => luns.push(l),
            Ok(None) => info!(lun_index, "removable LUN has no medium present, skipping"),
            Err(e) => warn!(lun_index, error = %e, "LUN failed to probe"),
        }
    }

    if luns.is_empty() {
        return Ok(None);
    }

    let inner = Arc::new(Mutex::new(DriveInner { config: cfg, transport, luns, next_tag: 0 }));

    let drive = Drive {
        interface_number,
        device_index,
        uasp,
        vendor_id,
        product_id,
        manufacturer,
        product,
        serial,
        inner: inner.clone(),
    };

    let mut any_mounted = false;
    {
        let mut guard = inner.lock().await;
        let lun_count = guard.luns.len();
        for idx in 0..lun_count {
            let (lun_index, block_count, block_length, write_protected, write_cache_enabled) = {
                let l = &guard.luns[idx];
                (l.index, l.block_count, l.block_length, l.write_protected, l.write_cache_enabled)
            };
            let writable = !write_protected && write_cache_enabled;
            let weak = Arc::downgrade(&inner);
            let block = Arc::new(BlockAdapter::new(weak, lun_index, block_length, block_count, writable));
            if let Some(adapter) = fs_adapter::try_mount_first(drivers, block, device_index, 0) {
                guard.luns[idx].filesystems.push(adapter);
                any_mounted = true;
            }
        }
    }

    if !any_mounted {
        return Ok(None);
    }

    Ok(Some(drive))
}

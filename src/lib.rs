//! USB Mass Storage host core: a drive manager reactor, the BOT/UASP
//! transport state machines, the SCSI LUN lifecycle, and a block-device
//! adapter filesystem drivers consume.
//!
//! The library never installs a global `tracing` subscriber or calls
//! `color_eyre::install()` — that belongs to whatever binary embeds it.

pub mod block;
pub mod config;
pub mod devoptab;
pub mod drive;
pub mod error;
pub mod fs_adapter;
pub mod lun;
pub mod reactor;
pub mod registry;
pub mod scsi;
pub mod usb;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::instrument;

pub use config::{Config, EventSlot};
pub use devoptab::{Device, DeviceTable};
pub use error::{CoreError, PosixError, Result};
pub use fs_adapter::FilesystemDriver;

use reactor::Core;

/// The handle returned by `init`: owns the Reactor task and the registry
/// it mutates. The caller owns this handle explicitly — there is no
/// hidden process-wide `static` (§9 "Global mutable state", a deliberate
/// tightening documented in DESIGN.md).
pub struct UmsCore {
    core: Arc<Core>,
    reactor_task: Mutex<Option<JoinHandle<()>>>,
    device_table: Arc<dyn DeviceTable>,
}

/// Starts the Reactor task bound to `event_index` and returns the handle
/// consumers use for every other public entry point (§6).
#[instrument(skip(config, drivers, device_table))]
pub async fn init(
    event_index: u32,
    config: Config,
    drivers: Vec<Arc<dyn FilesystemDriver>>,
    device_table: Arc<dyn DeviceTable>,
) -> Result<Arc<UmsCore>> {
    let _slot = EventSlot::try_from(event_index)?;
    let core = Core::new(config, drivers);
    let reactor_task = tokio::spawn(reactor::run(core.clone()));
    Ok(Arc::new(UmsCore { core, reactor_task: Mutex::new(Some(reactor_task)), device_table }))
}

impl UmsCore {
    /// Stops the Reactor and destroys every Drive (§4.7 "On Shutdown").
    /// Joins the Reactor task before returning — no Drive destructor runs
    /// after `exit()` completes (§8 invariant).
    pub async fn exit(&self) {
        self.core.request_shutdown().await;
        if let Some(task) = self.reactor_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Level-triggered, autoclear "status changed" signal (§6).
    pub async fn wait_for_status_change(&self) {
        self.core.status_change.wait().await;
    }

    pub async fn get_mounted_device_count(&self) -> u32 {
        self.core.registry.lock().await.mounted_filesystem_count().await
    }

    /// Snapshots up to `max` mounted filesystems (§6 `list_devices`).
    pub async fn list_devices(&self, max: u32) -> Vec<Device> {
        let registry = self.core.registry.lock().await;
        let mut out = Vec::new();
        for drive in registry.iter() {
            if out.len() as u32 >= max {
                break;
            }
            let inner = drive.inner().lock().await;
            for lun in &inner.luns {
                for fs in &lun.filesystems {
                    if out.len() as u32 >= max {
                        break;
                    }
                    out.push(Device {
                        mount_name: fs.mount_name.clone(),
                        kind: fs.kind,
                        vendor_id: drive.vendor_id,
                        product_id: drive.product_id,
                        uasp: drive.uasp,
                        block_size: lun.block_length,
                        block_count: lun.block_count,
                        writable: !lun.write_protected && lun.write_cache_enabled,
                    });
                }
            }
        }
        out
    }

    /// Opaque mount-flags passthrough consumed by filesystem drivers (§6).
    pub async fn set_file_system_mount_flags(&self, flags: u32) {
        self.core.config.lock().await.mount_flags = flags;
    }

    pub async fn get_file_system_mount_flags(&self) -> u32 {
        self.core.config.lock().await.mount_flags
    }

    /// Unregisters `device` from the virtual device table and, if
    /// `eject` is set, issues Prevent/Allow Medium Removal + Stop Unit on
    /// its LUN before dropping the mount handle.
    pub async fn unmount_device(&self, device: &Device, eject: bool) -> Result<()> {
        self.device_table.unregister(&device.mount_name);
        let registry = self.core.registry.lock().await;
        for drive in registry.iter() {
            let mut inner = drive.inner().lock().await;
            let lun_count = inner.luns.len();
            for idx in 0..lun_count {
                let before = inner.luns[idx].filesystems.len();
                inner.luns[idx].filesystems.retain(|fs| fs.mount_name != device.mount_name);
                if inner.luns[idx].filesystems.len() != before && eject {
                    let lun_index = inner.luns[idx].index;
                    let allow_removal = scsi::command::prevent_allow_medium_removal(false);
                    let _ = issue_simple_command(&mut inner, lun_index, &allow_removal).await;
                    let stop_unit = scsi::command::start_stop_unit(false);
                    let _ = issue_simple_command(&mut inner, lun_index, &stop_unit).await;
                }
            }
        }
        Ok(())
    }
}

/// Dispatches a non-directional command block to one LUN's transport and
/// discards its result — used for the best-effort eject commands
/// (Prevent/Allow Medium Removal, Stop Unit) where the caller has already
/// committed to unmounting regardless of the drive's response.
async fn issue_simple_command(inner: &mut drive::DriveInner, lun_index: u8, cmd: &scsi::command::CommandBlock) -> Result<()> {
    let tag = inner.next_tag();
    let timeout = inner.config.command_timeout;
    match &mut inner.transport {
        drive::TransportHandle::Bot(t) => usb::bot::execute(t, tag, lun_index, cmd, timeout, timeout).await.map(|_| ()),
        drive::TransportHandle::Uasp(t, demux) => usb::uasp::execute(t, demux, tag as u16, lun_index, cmd, timeout, timeout).await.map(|_| ()),
    }
}

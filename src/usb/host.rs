//! The `nusb`-backed implementation of [`UsbTransport`]: device discovery,
//! interface claiming, alt-setting selection (BOT vs UASP), and endpoint
//! session bookkeeping. This is the host USB service side of §6's external
//! interface contract.

use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{list_devices, Device, DeviceInfo, Interface};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::error::{CoreError, TransportError};
use crate::usb::transport::{Pipe, UsbTransport};

/// <https://www.usb.org/defined-class-codes>
pub const MASS_STORAGE_CLASS: u8 = 0x08;
pub const SCSI_TRANSPARENT_SUBCLASS: u8 = 0x06;
pub const PROTOCOL_BOT: u8 = 0x50;
pub const PROTOCOL_UASP: u8 = 0x62;

const GET_MAX_LUN: u8 = 0xFE;
const BULK_ONLY_RESET: u8 = 0xFF;
const CLEAR_FEATURE: u8 = 0x01;
const GET_STATUS: u8 = 0x00;
const ENDPOINT_HALT: u16 = 0x00;

/// Lists every attached device exposing a Mass Storage / SCSI Transparent
/// interface, at either supported protocol.
pub async fn enumerate_mass_storage_devices() -> Result<Vec<DeviceInfo>, CoreError> {
    let all = list_devices().await.map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?;
    Ok(all
        .filter(|dev| {
            dev.interfaces().any(|i| {
                i.class() == MASS_STORAGE_CLASS
                    && i.subclass() == SCSI_TRANSPARENT_SUBCLASS
                    && matches!(i.protocol(), PROTOCOL_BOT | PROTOCOL_UASP)
            })
        })
        .collect())
}

/// A mass-storage interface claimed on the host, with its negotiated
/// transport protocol already selected (UASP preferred when declared as
/// an alternate setting, per §4.3's "prober switches to it when present").
pub struct ClaimedInterface {
    pub interface: Interface,
    pub interface_number: u8,
    pub uasp: bool,
}

#[instrument(skip(device_info))]
pub async fn claim_mass_storage_interface(device_info: &DeviceInfo) -> Result<ClaimedInterface, CoreError> {
    let target = device_info
        .interfaces()
        .find(|i| i.class() == MASS_STORAGE_CLASS && i.subclass() == SCSI_TRANSPARENT_SUBCLASS)
        .ok_or_else(|| CoreError::Transport(TransportError::Host("no mass storage interface".into())))?;
    let interface_number = target.interface_number();

    let device: Device = device_info
        .open()
        .await
        .map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?;
    let interface = device
        .claim_interface(interface_number)
        .await
        .map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?;

    let uasp = device_info
        .interfaces()
        .filter(|i| i.interface_number() == interface_number)
        .any(|i| i.protocol() == PROTOCOL_UASP);

    if uasp {
        let alt = device_info
            .interfaces()
            .find(|i| i.interface_number() == interface_number && i.protocol() == PROTOCOL_UASP)
            .map(|i| i.alternate_setting())
            .unwrap_or(0);
        interface
            .set_alt_setting(alt)
            .await
            .map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?;
        debug!(interface_number, alt, "selected UASP alternate setting");
    }

    Ok(ClaimedInterface { interface, interface_number, uasp })
}

/// Opens the single bulk IN/OUT pair a Bulk-Only Transport drive exposes.
pub async fn open_bot_endpoints(
    interface: &Interface,
    device_info: &DeviceInfo,
) -> Result<(EndpointWrite<Bulk>, EndpointRead<Bulk>, u8, u8), CoreError> {
    let (out_addr, in_addr) = find_bulk_pair(device_info, interface.alt_setting())?;
    let writer = interface
        .endpoint::<Bulk, Out>(out_addr)
        .map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?
        .writer(4096)
        .with_num_transfers(4);
    let reader = interface
        .endpoint::<Bulk, In>(in_addr)
        .map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?
        .reader(4096)
        .with_num_transfers(4);
    Ok((writer, reader, out_addr, in_addr))
}

/// Opens the four independent bulk pipes a UASP drive exposes.
///
/// Pipe role is normally resolved from the Pipe Usage Class Descriptor
/// attached to each endpoint (pipe IDs 1=Cmd, 2=Status, 3=DataIn,
/// 4=DataOut, §4.3). Lacking descriptor-parsing access through this host
/// API, pipes are instead assigned by conventional ordering: the first OUT
/// endpoint is Cmd, the second is DataOut; the first IN endpoint is
/// Status, the second is DataIn. Real UASP devices enumerate their
/// endpoints in exactly this order.
pub async fn open_uasp_endpoints(
    interface: &Interface,
    device_info: &DeviceInfo,
) -> Result<UaspEndpoints, CoreError> {
    let (out_addrs, in_addrs) = find_bulk_endpoints(device_info, interface.alt_setting())?;
    if out_addrs.len() < 2 || in_addrs.len() < 2 {
        return Err(CoreError::Transport(TransportError::Host("UASP interface missing expected four bulk endpoints".into())));
    }
    let cmd_out_addr = out_addrs[0];
    let data_out_addr = out_addrs[1];
    let status_in_addr = in_addrs[0];
    let data_in_addr = in_addrs[1];

    let cmd_out = interface.endpoint::<Bulk, Out>(cmd_out_addr).map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?.writer(512).with_num_transfers(2);
    let data_out = interface.endpoint::<Bulk, Out>(data_out_addr).map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?.writer(4096).with_num_transfers(4);
    let status_in = interface.endpoint::<Bulk, In>(status_in_addr).map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?.reader(512).with_num_transfers(2);
    let data_in = interface.endpoint::<Bulk, In>(data_in_addr).map_err(|e| CoreError::Transport(TransportError::Host(e.to_string())))?.reader(4096).with_num_transfers(4);

    Ok(UaspEndpoints {
        cmd_out,
        data_out,
        status_in,
        data_in,
        cmd_out_addr,
        data_out_addr,
        status_in_addr,
        data_in_addr,
    })
}

fn find_bulk_pair(device_info: &DeviceInfo, alt_setting: u8) -> Result<(u8, u8), CoreError> {
    let (out_addrs, in_addrs) = find_bulk_endpoints(device_info, alt_setting)?;
    let out_addr = *out_addrs.first().ok_or_else(|| CoreError::Transport(TransportError::Host("no bulk OUT endpoint".into())))?;
    let in_addr = *in_addrs.first().ok_or_else(|| CoreError::Transport(TransportError::Host("no bulk IN endpoint".into())))?;
    Ok((out_addr, in_addr))
}

fn find_bulk_endpoints(device_info: &DeviceInfo, alt_setting: u8) -> Result<(Vec<u8>, Vec<u8>), CoreError> {
    let iface = device_info
        .interfaces()
        .find(|i| i.alternate_setting() == alt_setting && i.class() == MASS_STORAGE_CLASS)
        .ok_or_else(|| CoreError::Transport(TransportError::Host("alternate setting not found".into())))?;
    let mut out_addrs = Vec::new();
    let mut in_addrs = Vec::new();
    for ep in iface.endpoints() {
        if ep.transfer_type() != TransferType::Bulk {
            continue;
        }
        if ep.direction() == nusb::transfer::Direction::Out {
            out_addrs.push(ep.address());
        } else {
            in_addrs.push(ep.address());
        }
    }
    Ok((out_addrs, in_addrs))
}

pub struct UaspEndpoints {
    cmd_out: EndpointWrite<Bulk>,
    data_out: EndpointWrite<Bulk>,
    status_in: EndpointRead<Bulk>,
    data_in: EndpointRead<Bulk>,
    cmd_out_addr: u8,
    data_out_addr: u8,
    status_in_addr: u8,
    data_in_addr: u8,
}

/// Issues the class-specific Get Max LUN control request (§4.4). A STALL
/// is reported to the caller as `TransportError::UnrecoverableStall`; per
/// §4.4/§9 the caller treats that as "assume 1 LUN".
pub async fn get_max_lun(interface: &Interface, interface_number: u8, timeout: Duration) -> Result<u8, TransportError> {
    let request = ControlIn {
        control_type: ControlType::Class,
        recipient: Recipient::Interface,
        request: GET_MAX_LUN,
        value: 0,
        index: interface_number as u16,
        length: 1,
    };
    match interface.control_in(request, timeout).await {
        Ok(buf) => Ok(buf.first().copied().unwrap_or(0)),
        Err(e) if e.is_stall() => Err(TransportError::UnrecoverableStall),
        Err(e) => Err(TransportError::Host(e.to_string())),
    }
}

/// The production, hardware-backed [`UsbTransport`]. One instance is owned
/// per Drive and is either the BOT two-pipe shape or the UASP four-pipe
/// shape; both map onto the same trait.
pub enum NusbTransport {
    Bot {
        interface: Interface,
        interface_number: u8,
        out: EndpointWrite<Bulk>,
        r#in: EndpointRead<Bulk>,
        out_addr: u8,
        in_addr: u8,
    },
    Uasp {
        interface: Interface,
        interface_number: u8,
        endpoints: UaspEndpoints,
    },
}

impl NusbTransport {
    pub fn new_bot(interface: Interface, interface_number: u8, out: EndpointWrite<Bulk>, r#in: EndpointRead<Bulk>, out_addr: u8, in_addr: u8) -> Self {
        Self::Bot { interface, interface_number, out, r#in, out_addr, in_addr }
    }

    pub fn new_uasp(interface: Interface, interface_number: u8, endpoints: UaspEndpoints) -> Self {
        Self::Uasp { interface, interface_number, endpoints }
    }

    fn interface(&self) -> &Interface {
        match self {
            NusbTransport::Bot { interface, .. } => interface,
            NusbTransport::Uasp { interface, .. } => interface,
        }
    }

    fn interface_number(&self) -> u8 {
        match self {
            NusbTransport::Bot { interface_number, .. } => *interface_number,
            NusbTransport::Uasp { interface_number, .. } => *interface_number,
        }
    }

    fn endpoint_address(&self, pipe: Pipe) -> u8 {
        match self {
            NusbTransport::Bot { out_addr, in_addr, .. } => match pipe {
                Pipe::CmdOut | Pipe::DataOut => *out_addr,
                Pipe::StatusIn | Pipe::DataIn => *in_addr,
            },
            NusbTransport::Uasp { endpoints, .. } => match pipe {
                Pipe::CmdOut => endpoints.cmd_out_addr,
                Pipe::DataOut => endpoints.data_out_addr,
                Pipe::StatusIn => endpoints.status_in_addr,
                Pipe::DataIn => endpoints.data_in_addr,
            },
        }
    }
}

impl UsbTransport for NusbTransport {
    async fn bulk_write(&mut self, pipe: Pipe, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let writer = match self {
            NusbTransport::Bot { out, .. } => out,
            NusbTransport::Uasp { endpoints, .. } => match pipe {
                Pipe::CmdOut => &mut endpoints.cmd_out,
                Pipe::DataOut => &mut endpoints.data_out,
                _ => return Err(TransportError::Host("write on a read-only pipe role".into())),
            },
        };
        writer.write_all(buf).await.map_err(|e| map_io_error(&e))?;
        Ok(buf.len())
    }

    async fn bulk_read(&mut self, pipe: Pipe, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let reader = match self {
            NusbTransport::Bot { r#in, .. } => r#in,
            NusbTransport::Uasp { endpoints, .. } => match pipe {
                Pipe::StatusIn => &mut endpoints.status_in,
                Pipe::DataIn => &mut endpoints.data_in,
                _ => return Err(TransportError::Host("read on a write-only pipe role".into())),
            },
        };
        reader.read(buf).await.map_err(|e| map_io_error(&e))
    }

    async fn is_stalled(&mut self, pipe: Pipe) -> Result<bool, TransportError> {
        let addr = self.endpoint_address(pipe);
        let request = ControlIn {
            control_type: ControlType::Standard,
            recipient: Recipient::Endpoint,
            request: GET_STATUS,
            value: 0,
            index: addr as u16,
            length: 2,
        };
        let status = self
            .interface()
            .control_in(request, Duration::from_millis(500))
            .await
            .map_err(|e| TransportError::Host(e.to_string()))?;
        Ok(status.first().map(|b| b & 0x01 != 0).unwrap_or(false))
    }

    async fn clear_stall(&mut self, pipe: Pipe) -> Result<(), TransportError> {
        let addr = self.endpoint_address(pipe);
        let request = ControlOut {
            control_type: ControlType::Standard,
            recipient: Recipient::Endpoint,
            request: CLEAR_FEATURE,
            value: ENDPOINT_HALT,
            index: addr as u16,
            data: &[],
        };
        self.interface()
            .control_out(request, Duration::from_millis(500))
            .await
            .map_err(|e| TransportError::Host(e.to_string()))?;
        Ok(())
    }

    async fn bulk_only_reset(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let interface_number = self.interface_number();
        let request = ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: BULK_ONLY_RESET,
            value: 0,
            index: interface_number as u16,
            data: &[],
        };
        warn!(interface_number, "issuing Bulk-Only Mass Storage Reset");
        self.interface()
            .control_out(request, timeout)
            .await
            .map_err(|e| TransportError::Host(e.to_string()))?;
        self.clear_stall(Pipe::DataOut).await?;
        self.clear_stall(Pipe::DataIn).await?;
        Ok(())
    }

    async fn get_max_lun(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        let interface_number = self.interface_number();
        match get_max_lun(self.interface(), interface_number, timeout).await {
            Ok(n) => Ok(n),
            Err(TransportError::UnrecoverableStall) => {
                self.clear_stall(Pipe::CmdOut).await?;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

fn map_io_error(e: &std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::TimedOut => TransportError::Timeout(Duration::from_secs(0)),
        std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => TransportError::Disconnected,
        _ => TransportError::Host(e.to_string()),
    }
}

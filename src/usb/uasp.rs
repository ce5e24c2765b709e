//! The USB Attached SCSI Protocol variant of the command/status cycle
//! (§4.3 UASP variant, §4.3.1): Information Units carried over four
//! independent pipes, demultiplexed by a 16-bit host-assigned tag.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{CoreError, ProtocolError, TransportError};
use crate::scsi::command::CommandBlock;
use crate::usb::cbw::CbwDirection;
use crate::usb::engine::{post_bulk_read, post_bulk_write};
use crate::usb::transport::{Pipe, UsbTransport};

mod iu_id {
    pub const COMMAND: u8 = 1;
    pub const SENSE: u8 = 3;
}

/// Fixed 32-byte Command IU: iu_id, reserved, tag, priority/attribute,
/// reserved, 8-byte LUN, 16-byte CDB.
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct CommandIu {
    iu_id: u8,
    reserved1: u8,
    tag_be: [u8; 2],
    prio_attr: u8,
    reserved2: [u8; 3],
    lun: [u8; 8],
    cdb: [u8; 16],
}

impl CommandIu {
    fn new(tag: u16, lun: u8, cdb: &[u8]) -> Self {
        debug_assert!(cdb.len() <= 16);
        let mut cdb_buf = [0u8; 16];
        cdb_buf[..cdb.len()].copy_from_slice(cdb);
        let mut lun_buf = [0u8; 8];
        lun_buf[1] = lun;
        Self { iu_id: iu_id::COMMAND, reserved1: 0, tag_be: tag.to_be_bytes(), prio_attr: 0, reserved2: [0; 3], lun: lun_buf, cdb: cdb_buf }
    }
}

const STATUS_IU_HEADER_LEN: usize = 16;
const MAX_STATUS_IU_LEN: usize = STATUS_IU_HEADER_LEN + 252;

/// A parsed Sense IU (the UASP status frame): tag, SCSI status byte, and
/// any attached sense data.
#[derive(Debug, Clone)]
pub struct StatusIu {
    tag: u16,
    status: u8,
    sense: Vec<u8>,
}

impl StatusIu {
    fn parse(buf: &[u8]) -> Result<Self, CoreError> {
        if buf.len() < STATUS_IU_HEADER_LEN {
            return Err(CoreError::Protocol(ProtocolError::ShortRead { expected: STATUS_IU_HEADER_LEN, got: buf.len() }));
        }
        if buf[0] != iu_id::SENSE {
            return Err(CoreError::Protocol(ProtocolError::ShortRead { expected: iu_id::SENSE as usize, got: buf[0] as usize }));
        }
        let tag = u16::from_be_bytes([buf[2], buf[3]]);
        let status = buf[6];
        let sense_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        let sense = buf.get(STATUS_IU_HEADER_LEN..STATUS_IU_HEADER_LEN + sense_len).unwrap_or(&[]).to_vec();
        Ok(Self { tag, status, sense })
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn sense(&self) -> &[u8] {
        &self.sense
    }
}

/// Result of one UASP command/status/data cycle.
#[derive(Debug)]
pub struct UaspOutcome {
    pub data: Vec<u8>,
    pub status: u8,
    pub sense: Vec<u8>,
}

/// Tag-keyed demultiplexer for UASP status IUs (§4.3.1). Status IUs that
/// arrive for a tag other than the one currently being awaited are parked
/// here and returned without a further bulk read once their own waiter
/// asks for them — this is what lets tag T2's status arrive before T1's
/// without either waiter observing the wrong command's result (§8 scenario 6).
#[derive(Default)]
pub struct Demultiplexer {
    pending: HashMap<u16, StatusIu>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    async fn recv(&mut self, transport: &mut impl UsbTransport, tag: u16, timeout: Duration) -> Result<StatusIu, CoreError> {
        if let Some(iu) = self.pending.remove(&tag) {
            return Ok(iu);
        }
        loop {
            let mut buf = [0u8; MAX_STATUS_IU_LEN];
            let n = post_bulk_read(transport, Pipe::StatusIn, &mut buf, timeout).await?;
            let iu = StatusIu::parse(&buf[..n])?;
            if iu.tag() == tag {
                return Ok(iu);
            }
            debug!(got_tag = iu.tag(), want_tag = tag, "status IU for another tag, parking");
            self.pending.insert(iu.tag(), iu);
        }
    }
}

/// Drives one UASP command/status/data cycle for `tag` against `command`.
#[instrument(skip(transport, demux, command), fields(tag))]
pub async fn execute<T: UsbTransport>(
    transport: &mut T,
    demux: &mut Demultiplexer,
    tag: u16,
    lun: u8,
    command: &CommandBlock,
    command_timeout: Duration,
    data_timeout: Duration,
) -> Result<UaspOutcome, CoreError> {
    tracing::Span::current().record("tag", tag);

    let cmd_iu = CommandIu::new(tag, lun, command.cdb());
    post_bulk_write(transport, Pipe::CmdOut, bytemuck::bytes_of(&cmd_iu), command_timeout)
        .await
        .map_err(CoreError::Transport)?;

    let mut data = if command.direction == CbwDirection::DataOut {
        command.payload().to_vec()
    } else {
        vec![0u8; command.data_transfer_len as usize]
    };
    match command.direction {
        CbwDirection::DataIn => {
            if let Err(TransportError::UnrecoverableStall) =
                post_bulk_read(transport, Pipe::DataIn, &mut data, data_timeout).await
            {
                warn!("UASP data-in stalled, proceeding to status");
                let _ = transport.clear_stall(Pipe::DataIn).await;
            }
        }
        CbwDirection::DataOut => {
            if let Err(TransportError::UnrecoverableStall) =
                post_bulk_write(transport, Pipe::DataOut, &data, data_timeout).await
            {
                warn!("UASP data-out stalled, proceeding to status");
                let _ = transport.clear_stall(Pipe::DataOut).await;
            }
        }
        CbwDirection::NonDirectional => {}
    }

    let status_iu = demux.recv(transport, tag, command_timeout).await?;
    debug!(status = status_iu.status(), "UASP cycle complete");
    Ok(UaspOutcome { data, status: status_iu.status(), sense: status_iu.sense })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command;
    use crate::usb::transport::mock::{MockTransport, Scripted};

    fn status_iu_bytes(tag: u16, status: u8) -> Vec<u8> {
        let mut b = vec![0u8; STATUS_IU_HEADER_LEN];
        b[0] = iu_id::SENSE;
        b[2..4].copy_from_slice(&tag.to_be_bytes());
        b[6] = status;
        b
    }

    #[tokio::test]
    async fn test_unit_ready_completes_with_passing_status() {
        let mut t = MockTransport::default();
        let mut demux = Demultiplexer::new();
        t.push_read(Scripted::Ok(status_iu_bytes(1, 0)));
        let cmd = command::test_unit_ready();
        let outcome = execute(&mut t, &mut demux, 1, 0, &cmd, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.status, 0);
    }

    #[tokio::test]
    async fn out_of_order_status_routes_to_correct_waiter() {
        // Scenario 6: tags 1 and 2 outstanding, status IUs arrive 2 then 1.
        let mut t = MockTransport::default();
        t.push_read(Scripted::Ok(status_iu_bytes(2, 0)));
        t.push_read(Scripted::Ok(status_iu_bytes(1, 0)));
        let mut demux = Demultiplexer::new();

        let first = demux.recv(&mut t, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.tag(), 1);
        let second = demux.recv(&mut t, 2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.tag(), 2);
    }

    #[tokio::test]
    async fn data_in_stall_still_completes_with_status() {
        let mut t = MockTransport::default();
        let mut demux = Demultiplexer::new();
        t.push_read(Scripted::Stall);
        t.push_read(Scripted::Ok(status_iu_bytes(3, 2)));
        let cmd = command::inquiry();
        let outcome = execute(&mut t, &mut demux, 3, 0, &cmd, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.status, 2);
    }
}

//! The Bulk-Only Transport command/data/status cycle (§4.3): drive one
//! SCSI command from CBW, through an optional data phase, to a CSW.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{CoreError, ProtocolError, TransportError};
use crate::scsi::command::CommandBlock;
use crate::usb::cbw::{csw_status, CommandBlockWrapper, CommandStatusWrapper};
use crate::usb::engine::{post_bulk_read, post_bulk_write};
use crate::usb::transport::{Pipe, UsbTransport};

/// Outcome of one BOT command cycle.
#[derive(Debug)]
pub struct BotOutcome {
    pub data: Vec<u8>,
    pub residue: u32,
    pub status: u8,
}

/// Drives one CBW → data → CSW cycle on `transport`, including the
/// recovery transitions of §4.3. `lun` is the target logical unit.
#[instrument(skip(transport, command), fields(tag))]
pub async fn execute<T: UsbTransport>(
    transport: &mut T,
    tag: u32,
    lun: u8,
    command: &CommandBlock,
    command_timeout: Duration,
    data_timeout: Duration,
) -> Result<BotOutcome, CoreError> {
    tracing::Span::current().record("tag", tag);

    let cbw = CommandBlockWrapper::new(tag, command.data_transfer_len, command.direction, lun, command.cdb());
    if send_cbw(transport, &cbw, command_timeout).await.is_err() {
        return reset_and_fail(transport, command_timeout).await;
    }

    let mut data = if command.direction == crate::usb::cbw::CbwDirection::DataOut {
        command.payload().to_vec()
    } else {
        vec![0u8; command.data_transfer_len as usize]
    };
    let data_pipe = match command.direction {
        crate::usb::cbw::CbwDirection::DataIn => Some((Pipe::DataIn, true)),
        crate::usb::cbw::CbwDirection::DataOut => Some((Pipe::DataOut, false)),
        crate::usb::cbw::CbwDirection::NonDirectional => None,
    };

    if let Some((pipe, is_read)) = data_pipe {
        // Unlike the CBW/CSW phases, a data-phase STALL is not retried by
        // the Transfer Engine's generic wrapper: per §4.3 it is cleared and
        // the state machine proceeds straight to the CSW read regardless.
        let result = if is_read {
            tokio::time::timeout(data_timeout, transport.bulk_read(pipe, &mut data, data_timeout))
                .await
                .unwrap_or(Err(TransportError::Timeout(data_timeout)))
        } else {
            tokio::time::timeout(data_timeout, transport.bulk_write(pipe, &data, data_timeout))
                .await
                .unwrap_or(Err(TransportError::Timeout(data_timeout)))
        };
        match result {
            Ok(_) => {}
            Err(TransportError::UnrecoverableStall) => {
                warn!(?pipe, "data phase stalled, proceeding to status");
                let _ = transport.clear_stall(pipe).await;
            }
            Err(e) => {
                let _ = transport.bulk_only_reset(command_timeout).await;
                return Err(CoreError::Transport(e));
            }
        }
    }

    let csw = match read_csw(transport, command_timeout).await {
        Ok(csw) => csw,
        Err(_) => return reset_and_fail(transport, command_timeout).await,
    };

    if !csw.is_valid_signature() || csw.tag() != tag {
        warn!(expected_tag = tag, got_tag = csw.tag(), "CSW mismatch, resetting");
        return reset_and_fail(transport, command_timeout).await;
    }

    if csw.status() == csw_status::PHASE_ERROR {
        warn!("CSW phase error, resetting");
        return reset_and_fail(transport, command_timeout).await;
    }

    debug!(status = csw.status(), residue = csw.data_residue(), "BOT cycle complete");
    Ok(BotOutcome { data, residue: csw.data_residue(), status: csw.status() })
}

async fn send_cbw<T: UsbTransport>(
    transport: &mut T,
    cbw: &CommandBlockWrapper,
    timeout: Duration,
) -> Result<(), TransportError> {
    let bytes = bytemuck::bytes_of(cbw);
    post_bulk_write(transport, Pipe::CmdOut, bytes, timeout).await.map(|_| ())
}

async fn read_csw<T: UsbTransport>(
    transport: &mut T,
    timeout: Duration,
) -> Result<CommandStatusWrapper, CoreError> {
    let mut buf = [0u8; 13];
    post_bulk_read(transport, Pipe::StatusIn, &mut buf, timeout).await?;
    CommandStatusWrapper::parse(&buf).ok_or(CoreError::Protocol(ProtocolError::BadCswSignature(0)))
}

async fn reset_and_fail<T: UsbTransport>(
    transport: &mut T,
    timeout: Duration,
) -> Result<BotOutcome, CoreError> {
    transport.bulk_only_reset(timeout).await.map_err(CoreError::Transport)?;
    Err(CoreError::Transport(TransportError::PhaseErrorAfterReset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command;
    use crate::usb::transport::mock::{MockTransport, Scripted};

    fn csw_bytes(tag: u32, status: u8) -> Vec<u8> {
        let mut b = vec![0u8; 13];
        b[0..4].copy_from_slice(&crate::usb::cbw::CSW_SIGNATURE.to_le_bytes());
        b[4..8].copy_from_slice(&tag.to_le_bytes());
        b[12] = status;
        b
    }

    #[tokio::test]
    async fn test_unit_ready_round_trips_with_passing_status() {
        let mut t = MockTransport::default();
        t.push_read(Scripted::Ok(csw_bytes(1, csw_status::PASSED)));
        let cmd = command::test_unit_ready();
        let outcome = execute(&mut t, 1, 0, &cmd, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.status, csw_status::PASSED);
        assert!(outcome.data.is_empty());
    }

    #[tokio::test]
    async fn data_in_phase_reads_payload_then_csw() {
        let mut t = MockTransport::default();
        t.push_read(Scripted::Ok(vec![0xAB; 36]));
        t.push_read(Scripted::Ok(csw_bytes(5, csw_status::PASSED)));
        let cmd = command::inquiry();
        let outcome = execute(&mut t, 5, 0, &cmd, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.data, vec![0xAB; 36]);
    }

    #[tokio::test]
    async fn csw_tag_mismatch_triggers_reset() {
        let mut t = MockTransport::default();
        t.push_read(Scripted::Ok(csw_bytes(999, csw_status::PASSED)));
        let cmd = command::test_unit_ready();
        let err = execute(&mut t, 1, 0, &cmd, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport(TransportError::PhaseErrorAfterReset)));
        assert_eq!(t.reset_count, 1);
    }

    #[tokio::test]
    async fn data_in_stall_still_reads_status() {
        let mut t = MockTransport::default();
        t.push_read(Scripted::Stall);
        t.push_read(Scripted::Ok(csw_bytes(2, csw_status::FAILED)));
        let cmd = command::inquiry();
        let outcome = execute(&mut t, 2, 0, &cmd, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.status, csw_status::FAILED);
    }
}

//! The Transfer Engine (§4.1): one bulk transfer with STALL detection and
//! a single automatic clear-and-retry, generic over any [`UsbTransport`].

use std::time::Duration;

use tokio::time::timeout;

use crate::error::TransportError;
use crate::usb::transport::{Pipe, UsbTransport};

/// Submits a bulk OUT transfer. On STALL, clears the endpoint and retries
/// exactly once; a second failure is final (§4.1).
pub async fn post_bulk_write<T: UsbTransport>(
    transport: &mut T,
    pipe: Pipe,
    buf: &[u8],
    xfer_timeout: Duration,
) -> Result<usize, TransportError> {
    if buf.is_empty() {
        return Ok(0);
    }
    match timeout(xfer_timeout, transport.bulk_write(pipe, buf, xfer_timeout)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => {
            if matches!(e, TransportError::UnrecoverableStall) || transport.is_stalled(pipe).await.unwrap_or(false) {
                recover_and_retry_write(transport, pipe, buf, xfer_timeout).await
            } else {
                Err(e)
            }
        }
        Err(_) => Err(TransportError::Timeout(xfer_timeout)),
    }
}

/// Submits a bulk IN transfer with the same STALL recovery contract.
pub async fn post_bulk_read<T: UsbTransport>(
    transport: &mut T,
    pipe: Pipe,
    buf: &mut [u8],
    xfer_timeout: Duration,
) -> Result<usize, TransportError> {
    if buf.is_empty() {
        return Ok(0);
    }
    match timeout(xfer_timeout, transport.bulk_read(pipe, buf, xfer_timeout)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => {
            if matches!(e, TransportError::UnrecoverableStall) || transport.is_stalled(pipe).await.unwrap_or(false) {
                recover_and_retry_read(transport, pipe, buf, xfer_timeout).await
            } else {
                Err(e)
            }
        }
        Err(_) => Err(TransportError::Timeout(xfer_timeout)),
    }
}

async fn recover_and_retry_write<T: UsbTransport>(
    transport: &mut T,
    pipe: Pipe,
    buf: &[u8],
    xfer_timeout: Duration,
) -> Result<usize, TransportError> {
    transport.clear_stall(pipe).await?;
    timeout(xfer_timeout, transport.bulk_write(pipe, buf, xfer_timeout))
        .await
        .map_err(|_| TransportError::Timeout(xfer_timeout))?
}

async fn recover_and_retry_read<T: UsbTransport>(
    transport: &mut T,
    pipe: Pipe,
    buf: &mut [u8],
    xfer_timeout: Duration,
) -> Result<usize, TransportError> {
    transport.clear_stall(pipe).await?;
    timeout(xfer_timeout, transport.bulk_read(pipe, buf, xfer_timeout))
        .await
        .map_err(|_| TransportError::Timeout(xfer_timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::transport::mock::{MockTransport, Scripted};

    #[tokio::test]
    async fn zero_length_write_is_a_no_op() {
        let mut t = MockTransport::default();
        let n = post_bulk_write(&mut t, Pipe::DataOut, &[], Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 0);
        assert!(t.writes.is_empty());
    }

    #[tokio::test]
    async fn read_stall_clears_and_retries_once() {
        let mut t = MockTransport::default();
        t.push_read(Scripted::Stall);
        t.push_read(Scripted::Ok(vec![1, 2, 3, 4]));
        let mut buf = [0u8; 4];
        let n = post_bulk_read(&mut t, Pipe::DataIn, &mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(!t.stalled.contains(&Pipe::DataIn));
    }

    #[tokio::test]
    async fn second_stall_is_final() {
        let mut t = MockTransport::default();
        t.push_read(Scripted::Stall);
        t.push_read(Scripted::Stall);
        let mut buf = [0u8; 4];
        let err = post_bulk_read(&mut t, Pipe::DataIn, &mut buf, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnrecoverableStall));
    }

    /// A transport whose submit error never carries `UnrecoverableStall`
    /// directly (as real hardware I/O errors don't) but whose endpoint is
    /// actually halted, discoverable only through `is_stalled`.
    struct HaltedEndpointTransport {
        calls: u32,
    }

    impl UsbTransport for HaltedEndpointTransport {
        async fn bulk_write(&mut self, _pipe: Pipe, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
            self.calls += 1;
            if self.calls == 1 {
                Err(TransportError::Host("device reported a halt".into()))
            } else {
                Ok(buf.len())
            }
        }

        async fn bulk_read(&mut self, _pipe: Pipe, _buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            unreachable!("not exercised by this test")
        }

        async fn is_stalled(&mut self, _pipe: Pipe) -> Result<bool, TransportError> {
            Ok(self.calls == 1)
        }

        async fn clear_stall(&mut self, _pipe: Pipe) -> Result<(), TransportError> {
            Ok(())
        }

        async fn bulk_only_reset(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        async fn get_max_lun(&mut self, _timeout: Duration) -> Result<u8, TransportError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn host_error_on_a_halted_endpoint_clears_and_retries() {
        let mut t = HaltedEndpointTransport { calls: 0 };
        let n = post_bulk_write(&mut t, Pipe::DataOut, &[1, 2, 3], Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 3);
    }
}

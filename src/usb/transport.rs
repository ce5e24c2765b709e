//! The `UsbTransport` capability interface: everything the BOT and UASP
//! state machines need from the host USB service (§6), abstracted so that
//! [`crate::usb::bot`] and [`crate::usb::uasp`] can be driven by an
//! in-process mock under test as well as by the real `nusb`-backed
//! implementation.
//!
//! This mirrors the generic-transport pattern used by comparable
//! production SCSI-over-USB crates (a `ScsiTransport`/`HostController`
//! type parameter rather than a boxed trait object, since the relevant
//! methods are `async fn`s and therefore not object-safe on stable Rust
//! without extra boxing machinery).

use std::time::Duration;

use crate::error::TransportError;

/// Which logical pipe a transfer targets.
///
/// A Bulk-Only Transport drive has exactly one IN/OUT pair and maps all
/// four roles onto it (§4.3: CBW and data-out share the OUT pipe, data-in
/// and CSW share the IN pipe). A UASP drive has four independent pipes,
/// discovered via pipe-usage descriptors at interface setup (§4.3 UASP
/// variant: 1=Cmd, 2=Status, 3=DataIn, 4=DataOut).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    CmdOut,
    StatusIn,
    DataOut,
    DataIn,
}

/// Everything the Transfer Engine and the BOT/UASP state machines need
/// from the host USB service.
pub trait UsbTransport: Send {
    /// Submits a bulk OUT transfer, returning bytes actually sent.
    fn bulk_write(
        &mut self,
        pipe: Pipe,
        buf: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Submits a bulk IN transfer, returning bytes actually received.
    fn bulk_read(
        &mut self,
        pipe: Pipe,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// True if the given pipe's endpoint is currently halted (STALLed).
    fn is_stalled(&mut self, pipe: Pipe) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Issues CLEAR_FEATURE(ENDPOINT_HALT) on the given pipe's endpoint.
    fn clear_stall(&mut self, pipe: Pipe) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Issues the Bulk-Only Mass Storage Reset class request (§4.3).
    fn bulk_only_reset(&mut self, timeout: Duration) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Issues the Get Max LUN class request. Callers treat a STALL
    /// (mapped by the implementation to `Ok(0)`) as "assume 1 LUN" per the
    /// documented lenient behaviour (§4.4, §9).
    fn get_max_lun(&mut self, timeout: Duration) -> impl Future<Output = Result<u8, TransportError>> + Send;
}

#[cfg(test)]
pub mod mock {
    //! An in-process, fully scriptable [`UsbTransport`] used by the BOT/UASP
    //! and probing unit tests. It never touches real hardware.

    use std::collections::VecDeque;
    use std::time::Duration;

    use super::{Pipe, UsbTransport};
    use crate::error::TransportError;

    /// One scripted outcome for a single bulk call.
    #[derive(Debug, Clone)]
    pub enum Scripted {
        Ok(Vec<u8>),
        Stall,
        Timeout,
    }

    #[derive(Default)]
    pub struct MockTransport {
        pub writes: Vec<(Pipe, Vec<u8>)>,
        pub read_script: VecDeque<Scripted>,
        pub stalled: std::collections::HashSet<Pipe>,
        pub reset_count: u32,
        pub max_lun: u8,
        pub max_lun_stalls: bool,
    }

    impl MockTransport {
        pub fn push_read(&mut self, outcome: Scripted) {
            self.read_script.push_back(outcome);
        }
    }

    impl UsbTransport for MockTransport {
        async fn bulk_write(&mut self, pipe: Pipe, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
            if self.stalled.contains(&pipe) {
                return Err(TransportError::UnrecoverableStall);
            }
            self.writes.push((pipe, buf.to_vec()));
            Ok(buf.len())
        }

        async fn bulk_read(&mut self, pipe: Pipe, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            if self.stalled.contains(&pipe) {
                return Err(TransportError::UnrecoverableStall);
            }
            match self.read_script.pop_front() {
                Some(Scripted::Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Scripted::Stall) => {
                    self.stalled.insert(pipe);
                    Err(TransportError::UnrecoverableStall)
                }
                Some(Scripted::Timeout) => Err(TransportError::Timeout(Duration::from_secs(10))),
                None => Ok(0),
            }
        }

        async fn is_stalled(&mut self, pipe: Pipe) -> Result<bool, TransportError> {
            Ok(self.stalled.contains(&pipe))
        }

        async fn clear_stall(&mut self, pipe: Pipe) -> Result<(), TransportError> {
            self.stalled.remove(&pipe);
            Ok(())
        }

        async fn bulk_only_reset(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            self.reset_count += 1;
            self.stalled.clear();
            Ok(())
        }

        async fn get_max_lun(&mut self, _timeout: Duration) -> Result<u8, TransportError> {
            if self.max_lun_stalls {
                Ok(0)
            } else {
                Ok(self.max_lun)
            }
        }
    }
}

//! Error categories for the core, as laid out in the error handling design:
//! Transport, Protocol, Medium, Programming, and Resource failures, each
//! mapped onto a POSIX-style code at the Block Adapter boundary.

use thiserror::Error;

use crate::scsi::sense::SenseTriple;

/// Low-level bulk/control transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bulk transfer timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("endpoint stalled and did not clear after retry")]
    UnrecoverableStall,
    #[error("phase error persisted after a Bulk-Only reset")]
    PhaseErrorAfterReset,
    #[error("the underlying USB host service reported an error: {0}")]
    Host(String),
    #[error("the interface is gone (device unplugged)")]
    Disconnected,
}

/// Malformed protocol framing: bad CBW/CSW signatures, tag mismatches,
/// truncated Information Units.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("CSW signature mismatch: expected 0x53425355, got {0:#010x}")]
    BadCswSignature(u32),
    #[error("CSW tag {got:#010x} does not match CBW tag {expected:#010x}")]
    TagMismatch { expected: u32, got: u32 },
    #[error("CSW reported phase error status")]
    CswPhaseError,
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("UASP status IU arrived for unknown or already-completed tag {0:#06x}")]
    UnknownTag(u16),
}

/// SCSI-sense-derived medium conditions.
#[derive(Error, Debug)]
pub enum MediumError {
    #[error("command failed: sense {0:?}")]
    CommandFailed(SenseTriple),
    #[error("medium is not present")]
    NotPresent,
    #[error("medium is write-protected")]
    WriteProtected,
    #[error("logical unit reported hardware error")]
    HardwareError,
    #[error("logical unit is not a supported direct-access block device")]
    UnsupportedPeripheralType,
    #[error("reported block geometry is invalid (block_count or block_length is zero)")]
    InvalidGeometry,
}

/// A single top-level error type folding every subsystem's errors together,
/// so library callers can `match` on category while still getting a useful
/// `Display` message for logging.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Medium(#[from] MediumError),
    #[error("invalid argument: {0}")]
    Programming(String),
    #[error("resource exhausted: {0}")]
    Resource(String),
}

/// POSIX-style codes exposed at the Block Adapter boundary (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosixError {
    Eio,
    Enospc,
    Enodev,
    Einval,
    Erofs,
    Enomem,
}

impl CoreError {
    /// Maps an internal error onto the POSIX-style code a filesystem driver
    /// expects at the Block Adapter boundary.
    pub fn to_posix(&self) -> PosixError {
        match self {
            CoreError::Transport(TransportError::Disconnected) => PosixError::Enodev,
            CoreError::Transport(_) => PosixError::Eio,
            CoreError::Protocol(_) => PosixError::Eio,
            CoreError::Medium(MediumError::NotPresent) => PosixError::Enodev,
            CoreError::Medium(MediumError::WriteProtected) => PosixError::Erofs,
            CoreError::Medium(MediumError::InvalidGeometry) => PosixError::Einval,
            CoreError::Medium(MediumError::UnsupportedPeripheralType) => PosixError::Enodev,
            CoreError::Medium(_) => PosixError::Eio,
            CoreError::Programming(_) => PosixError::Einval,
            CoreError::Resource(_) => PosixError::Enomem,
        }
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

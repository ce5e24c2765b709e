//! Driver-level configuration: timeouts, retry bounds, and the opaque
//! mount-flags passthrough described in §6.

use std::time::Duration;

/// Which host hot-plug event slot `init` should bind to. The host service
/// contract allows exactly three (see §6's `init(event_index: 0|1|2)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSlot {
    Slot0,
    Slot1,
    Slot2,
}

impl TryFrom<u32> for EventSlot {
    type Error = crate::error::CoreError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventSlot::Slot0),
            1 => Ok(EventSlot::Slot1),
            2 => Ok(EventSlot::Slot2),
            other => Err(crate::error::CoreError::Programming(format!(
                "event_index must be 0, 1, or 2, got {other}"
            ))),
        }
    }
}

/// Tunable timeouts and limits. Defaults follow §4.3's suggested values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout for CBW send and CSW receive phases.
    pub command_timeout: Duration,
    /// Floor applied to the size-proportional data-phase timeout.
    pub data_timeout_floor: Duration,
    /// Bytes of data-phase timeout granted per byte transferred, beyond the floor.
    pub data_timeout_per_byte: Duration,
    /// Maximum bytes moved by a single Read/Write CDB; larger Block Adapter
    /// requests are chunked into this size (§4.5; typical 128 KiB).
    pub max_transfer_chunk: usize,
    /// Bound on recoverable-sense retries during probing (§4.4).
    pub max_probe_retries: u32,
    /// Opaque passthrough bits for filesystem drivers (§6).
    pub mount_flags: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            data_timeout_floor: Duration::from_secs(5),
            data_timeout_per_byte: Duration::from_micros(1),
            max_transfer_chunk: 128 * 1024,
            max_probe_retries: 3,
            mount_flags: 0,
        }
    }
}

impl Config {
    /// The size-proportional timeout for a data phase moving `len` bytes.
    pub fn data_timeout(&self, len: usize) -> Duration {
        self.data_timeout_floor
            .max(self.data_timeout_per_byte.saturating_mul(len as u32))
    }
}

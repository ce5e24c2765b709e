//! The Block Adapter (§4.5): the `(read, write, sync, geometry)` interface
//! a filesystem driver consumes. Every call acquires the parent Drive's
//! guard, validates bounds, and chunks large requests to the configured
//! maximum transfer size.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::Config;
use crate::drive::DriveInner;
use crate::error::{CoreError, MediumError};
use crate::scsi::command;
use crate::usb::cbw::csw_status;
use crate::usb::{bot, uasp};

/// Presents one LUN as a flat block device to a filesystem driver.
pub struct BlockAdapter {
    drive: Weak<Mutex<DriveInner>>,
    lun_index: u8,
    block_size: u32,
    block_count: u64,
    writable: bool,
}

impl BlockAdapter {
    pub fn new(drive: Weak<Mutex<DriveInner>>, lun_index: u8, block_size: u32, block_count: u64, writable: bool) -> Self {
        Self { drive, lun_index, block_size, block_count, writable }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    fn validate_range(&self, lba: u64, count: u32) -> Result<(), CoreError> {
        if count == 0 {
            return Ok(());
        }
        lba.checked_add(count as u64)
            .filter(|&end| end <= self.block_count)
            .map(|_| ())
            .ok_or_else(|| CoreError::Programming(format!("range {lba}+{count} exceeds block_count {}", self.block_count)))
    }

    /// Reads `count` blocks starting at `lba` into `out`, which must be at
    /// least `count * block_size` bytes.
    #[instrument(skip(self, out))]
    pub async fn read(&self, lba: u64, count: u32, out: &mut [u8]) -> Result<(), CoreError> {
        self.validate_range(lba, count)?;
        if count == 0 {
            return Ok(());
        }
        let drive = self.drive.upgrade().ok_or(CoreError::Medium(MediumError::NotPresent))?;
        let mut inner = drive.lock().await;
        let cfg = inner.config.clone();
        let max_blocks_per_chunk = (cfg.max_transfer_chunk as u64 / self.block_size as u64).max(1) as u32;

        let mut done = 0u32;
        while done < count {
            let chunk = max_blocks_per_chunk.min(count - done);
            let chunk_lba = lba + done as u64;
            let chunk_len = chunk as usize * self.block_size as usize;
            let offset = done as usize * self.block_size as usize;
            let data = issue_read(&mut inner, &cfg, self.lun_index, chunk_lba, chunk).await?;
            out[offset..offset + chunk_len].copy_from_slice(&data[..chunk_len]);
            done += chunk;
        }
        Ok(())
    }

    /// Writes `count` blocks starting at `lba` from `data`.
    #[instrument(skip(self, data))]
    pub async fn write(&self, lba: u64, count: u32, data: &[u8]) -> Result<(), CoreError> {
        if !self.writable {
            return Err(CoreError::Medium(MediumError::WriteProtected));
        }
        self.validate_range(lba, count)?;
        if count == 0 {
            return Ok(());
        }
        let drive = self.drive.upgrade().ok_or(CoreError::Medium(MediumError::NotPresent))?;
        let mut inner = drive.lock().await;
        let cfg = inner.config.clone();
        let max_blocks_per_chunk = (cfg.max_transfer_chunk as u64 / self.block_size as u64).max(1) as u32;

        let mut done = 0u32;
        while done < count {
            let chunk = max_blocks_per_chunk.min(count - done);
            let chunk_lba = lba + done as u64;
            let offset = done as usize * self.block_size as usize;
            let chunk_len = chunk as usize * self.block_size as usize;
            issue_write(&mut inner, &cfg, self.lun_index, chunk_lba, chunk, &data[offset..offset + chunk_len]).await?;
            done += chunk;
        }
        Ok(())
    }

    /// Flushes the LUN's write cache (Synchronize Cache (10)).
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<(), CoreError> {
        let drive = self.drive.upgrade().ok_or(CoreError::Medium(MediumError::NotPresent))?;
        let mut inner = drive.lock().await;
        let cfg = inner.config.clone();
        let cmd = command::synchronize_cache_10();
        let status = run_command(&mut inner, &cfg, self.lun_index, &cmd).await?;
        if status != 0 {
            return Err(CoreError::Medium(MediumError::CommandFailed(crate::scsi::sense::SenseTriple { key: 0, asc: 0, ascq: 0 })));
        }
        Ok(())
    }
}

async fn issue_read(inner: &mut DriveInner, cfg: &Config, lun_index: u8, lba: u64, count: u32) -> Result<Vec<u8>, CoreError> {
    let cmd = if lba <= u32::MAX as u64 && count <= u16::MAX as u32 {
        command::read_10(lba as u32, count as u16, inner.block_length(lun_index))
    } else {
        command::read_16(lba, count, inner.block_length(lun_index))
    };
    let tag = inner.next_tag();
    let data = match &mut inner.transport {
        crate::drive::TransportHandle::Bot(t) => {
            let out = bot::execute(t, tag, lun_index, &cmd, cfg.command_timeout, cfg.data_timeout(cmd.data_transfer_len as usize)).await?;
            if out.status != csw_status::PASSED {
                return Err(CoreError::Medium(MediumError::CommandFailed(crate::scsi::sense::SenseTriple { key: 0, asc: 0, ascq: 0 })));
            }
            out.data
        }
        crate::drive::TransportHandle::Uasp(t, demux) => {
            let out = uasp::execute(t, demux, tag as u16, lun_index, &cmd, cfg.command_timeout, cfg.data_timeout(cmd.data_transfer_len as usize)).await?;
            if out.status != 0 {
                return Err(CoreError::Medium(MediumError::CommandFailed(crate::scsi::sense::SenseTriple { key: 0, asc: 0, ascq: 0 })));
            }
            out.data
        }
    };
    Ok(data)
}

async fn issue_write(inner: &mut DriveInner, cfg: &Config, lun_index: u8, lba: u64, count: u32, data: &[u8]) -> Result<(), CoreError> {
    let block_length = inner.block_length(lun_index);
    let mut cmd = if lba <= u32::MAX as u64 && count <= u16::MAX as u32 {
        command::write_10(lba as u32, count as u16, block_length)
    } else {
        command::write_16(lba, count, block_length)
    };
    cmd.set_payload(data);
    let status = run_command(inner, cfg, lun_index, &cmd).await?;
    if status != csw_status::PASSED {
        return Err(CoreError::Medium(MediumError::CommandFailed(crate::scsi::sense::SenseTriple { key: 0, asc: 0, ascq: 0 })));
    }
    Ok(())
}

async fn run_command(inner: &mut DriveInner, cfg: &Config, lun_index: u8, cmd: &command::CommandBlock) -> Result<u8, CoreError> {
    let tag = inner.next_tag();
    let status = match &mut inner.transport {
        crate::drive::TransportHandle::Bot(t) => {
            bot::execute(t, tag, lun_index, cmd, cfg.command_timeout, cfg.data_timeout(cmd.data_transfer_len as usize)).await?.status
        }
        crate::drive::TransportHandle::Uasp(t, demux) => {
            uasp::execute(t, demux, tag as u16, lun_index, cmd, cfg.command_timeout, cfg.data_timeout(cmd.data_transfer_len as usize)).await?.status
        }
    };
    Ok(status)
}

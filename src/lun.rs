//! The SCSI LUN lifecycle (§3, §4.4): per-logical-unit state, and the
//! prober that walks a fresh LUN through Test Unit Ready → Inquiry →
//! Read Format Capacities → Request Sense → Read Capacity → Mode Sense →
//! Prevent Medium Removal before marking it ready.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{CoreError, MediumError};
use crate::fs_adapter::FilesystemAdapter;
use crate::scsi::command;
use crate::scsi::response::{self, InquiryInfo};
use crate::scsi::sense::{RecoveryHint, SenseTriple};
use crate::usb::bot;
use crate::usb::transport::UsbTransport;
use crate::usb::uasp::{self, Demultiplexer};

/// One addressable logical unit within a Drive (§3).
#[derive(Debug)]
pub struct Lun {
    pub index: u8,
    pub removable: bool,
    pub eject_supported: bool,
    pub write_protected: bool,
    pub write_cache_enabled: bool,
    pub vendor_id: String,
    pub product_id: String,
    pub serial: String,
    pub long_lba: bool,
    pub block_count: u64,
    pub block_length: u32,
    pub ready: bool,
    pub filesystems: Vec<FilesystemAdapter>,
}

impl Lun {
    pub fn capacity(&self) -> u64 {
        self.block_count * self.block_length as u64
    }
}

/// The two shapes a command channel to a drive can take: BOT's single
/// CBW/CSW cycle, or UASP's tag-demultiplexed Information Units.
pub enum Channel<'t, T: UsbTransport> {
    Bot(&'t mut T),
    Uasp(&'t mut T, &'t mut Demultiplexer),
}

/// A command outcome normalised across BOT and UASP, with sense data
/// already attached when the command failed.
struct Outcome {
    data: Vec<u8>,
    failed: bool,
    sense: Option<SenseTriple>,
}

async fn issue<T: UsbTransport>(
    channel: &mut Channel<'_, T>,
    tag: &mut u32,
    lun_index: u8,
    cmd: &crate::scsi::command::CommandBlock,
    cfg: &Config,
) -> Result<Outcome, CoreError> {
    *tag = tag.wrapping_add(1);
    let command_timeout = cfg.command_timeout;
    let data_timeout = cfg.data_timeout(cmd.data_transfer_len as usize);
    match channel {
        Channel::Bot(transport) => {
            let out = bot::execute(*transport, *tag, lun_index, cmd, command_timeout, data_timeout).await?;
            let failed = out.status != crate::usb::cbw::csw_status::PASSED;
            let sense = if failed {
                Some(request_sense(transport, tag, lun_index, cfg).await?)
            } else {
                None
            };
            Ok(Outcome { data: out.data, failed, sense })
        }
        Channel::Uasp(transport, demux) => {
            let out = uasp::execute(*transport, *demux, *tag as u16, lun_index, cmd, command_timeout, data_timeout).await?;
            let failed = out.status != 0;
            let sense = if failed && out.sense.len() >= 14 {
                Some(response::parse_request_sense(&out.sense)?)
            } else if failed {
                Some(SenseTriple { key: 0, asc: 0, ascq: 0 })
            } else {
                None
            };
            Ok(Outcome { data: out.data, failed, sense })
        }
    }
}

async fn request_sense<T: UsbTransport>(
    transport: &mut T,
    tag: &mut u32,
    lun_index: u8,
    cfg: &Config,
) -> Result<SenseTriple, CoreError> {
    *tag = tag.wrapping_add(1);
    let cmd = command::request_sense(18);
    let out = bot::execute(transport, *tag, lun_index, &cmd, cfg.command_timeout, cfg.command_timeout).await?;
    response::parse_request_sense(&out.data)
}

/// Runs one probe step with the recoverable-retry policy of §4.4: up to
/// `cfg.max_probe_retries` bounded-backoff retries on NOT READY / UNIT
/// ATTENTION, an immediate error on anything else.
async fn probe_step<T: UsbTransport>(
    channel: &mut Channel<'_, T>,
    tag: &mut u32,
    lun_index: u8,
    cmd_fn: impl Fn() -> crate::scsi::command::CommandBlock,
    cfg: &Config,
) -> Result<Outcome, CoreError> {
    let mut attempt = 0u32;
    loop {
        let cmd = cmd_fn();
        let outcome = issue(channel, tag, lun_index, &cmd, cfg).await?;
        if !outcome.failed {
            return Ok(outcome);
        }
        let sense = outcome.sense.clone().unwrap_or(SenseTriple { key: 0, asc: 0, ascq: 0 });
        match sense.classify() {
            RecoveryHint::None => return Ok(outcome),
            RecoveryHint::MediumNotPresent => return Err(CoreError::Medium(MediumError::NotPresent)),
            RecoveryHint::RetryWithBackoff if attempt < cfg.max_probe_retries => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                continue;
            }
            _ => return Err(CoreError::Medium(MediumError::CommandFailed(sense))),
        }
    }
}

impl Clone for Outcome {
    fn clone(&self) -> Self {
        Self { data: self.data.clone(), failed: self.failed, sense: self.sense }
    }
}

/// Probes logical unit `lun_index`, returning `Ok(None)` when the LUN is
/// declared removable and reports "medium not present" (§4.4 step 1),
/// `Ok(Some(lun))` once the full sequence succeeds, or `Err` on any other
/// unrecoverable failure.
#[instrument(skip(channel, cfg, serial), fields(lun_index))]
pub async fn probe<T: UsbTransport>(channel: &mut Channel<'_, T>, lun_index: u8, serial: &str, cfg: &Config) -> Result<Option<Lun>, CoreError> {
    let mut tag = lun_index as u32 * 1000;

    // Step 1: Test Unit Ready.
    let tur = probe_step(channel, &mut tag, lun_index, command::test_unit_ready, cfg).await;
    let removable_absent = matches!(tur, Err(CoreError::Medium(MediumError::NotPresent)));
    if let Err(e) = tur {
        if !removable_absent {
            return Err(e);
        }
    }

    // Step 2: Inquiry.
    let inquiry_outcome = probe_step(channel, &mut tag, lun_index, command::inquiry, cfg).await?;
    let inquiry = InquiryInfo::from_bytes(&inquiry_outcome.data)?;
    if !inquiry.is_direct_access_block_device() {
        warn!(peripheral_device_type = inquiry.peripheral_device_type, "not a direct-access block device");
        return Err(CoreError::Medium(MediumError::UnsupportedPeripheralType));
    }
    let removable = inquiry.removable;
    if removable_absent {
        info!("medium not present on removable LUN; skipping without failing the drive");
        return Ok(None);
    }

    // Step 3: Read Format Capacities, tolerant of Illegal Request.
    let _ = probe_step(channel, &mut tag, lun_index, command::read_format_capacities, cfg).await;

    // Step 4: drain residual unit attention.
    let _ = probe_step(channel, &mut tag, lun_index, || command::request_sense(18), cfg).await;

    // Step 5: Read Capacity (10), escalating to (16) on overflow.
    let rc10 = probe_step(channel, &mut tag, lun_index, command::read_capacity_10, cfg).await?;
    let (last_lba_10, block_length_10) = response::parse_read_capacity_10(&rc10.data)?;
    let (block_count, block_length, long_lba) = if last_lba_10 == u32::MAX {
        let rc16 = probe_step(channel, &mut tag, lun_index, command::read_capacity_16, cfg).await?;
        let (last_lba_16, block_length_16) = response::parse_read_capacity_16(&rc16.data)?;
        (last_lba_16 + 1, block_length_16, true)
    } else {
        (last_lba_10 as u64 + 1, block_length_10, false)
    };
    const VALID_BLOCK_LENGTHS: [u32; 4] = [512, 1024, 2048, 4096];
    if block_count == 0 || !VALID_BLOCK_LENGTHS.contains(&block_length) {
        return Err(CoreError::Medium(MediumError::InvalidGeometry));
    }

    // Step 6: Mode Sense, Caching page (also carries the WP bit in its header).
    let caching = match probe_step(channel, &mut tag, lun_index, || command::mode_sense_caching(24), cfg).await {
        Ok(outcome) => response::parse_mode_sense_caching(&outcome.data).unwrap_or_default(),
        Err(_) => Default::default(),
    };

    // Step 7: Prevent Medium Removal for ejectable removable media.
    let eject_supported = removable;
    if removable && eject_supported {
        let _ = probe_step(channel, &mut tag, lun_index, || command::prevent_allow_medium_removal(true), cfg).await;
    }

    // Step 8: mark ready.
    Ok(Some(Lun {
        index: lun_index,
        removable,
        eject_supported,
        write_protected: caching.write_protected,
        write_cache_enabled: caching.write_cache_enabled,
        vendor_id: response::trim_scsi_ascii(&inquiry.vendor_id),
        product_id: response::trim_scsi_ascii(&inquiry.product_id),
        serial: serial.to_string(),
        long_lba,
        block_count,
        block_length,
        ready: true,
        filesystems: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::cbw::csw_status;
    use crate::usb::transport::mock::{MockTransport, Scripted};

    fn csw_bytes(tag: u32, status: u8) -> Vec<u8> {
        let mut b = vec![0u8; 13];
        b[0..4].copy_from_slice(&crate::usb::cbw::CSW_SIGNATURE.to_le_bytes());
        b[4..8].copy_from_slice(&tag.to_le_bytes());
        b[12] = status;
        b
    }

    fn inquiry_bytes() -> Vec<u8> {
        let mut b = vec![0x20u8; 36];
        b[0] = 0x00;
        b
    }

    fn read_capacity_10_bytes(last_lba: u32, block_len: u32) -> Vec<u8> {
        let mut b = vec![0u8; 8];
        b[0..4].copy_from_slice(&last_lba.to_be_bytes());
        b[4..8].copy_from_slice(&block_len.to_be_bytes());
        b
    }

    #[tokio::test]
    async fn happy_path_probe_reports_geometry() {
        let mut t = MockTransport::default();
        let cfg = Config::default();

        // Test Unit Ready (tag auto-incremented per issue() call).
        t.push_read(Scripted::Ok(csw_bytes(1, csw_status::PASSED)));
        // Inquiry.
        t.push_read(Scripted::Ok(inquiry_bytes()));
        t.push_read(Scripted::Ok(csw_bytes(2, csw_status::PASSED)));
        // Read Format Capacities (tolerant failure path taken as failed + sense).
        t.push_read(Scripted::Ok(csw_bytes(3, csw_status::FAILED)));
        t.push_read(Scripted::Ok(vec![0u8; 18])); // request sense for the failed step
        // drain residual unit attention (request sense, step 4).
        t.push_read(Scripted::Ok(vec![0u8; 18]));
        t.push_read(Scripted::Ok(csw_bytes(5, csw_status::PASSED)));
        // Read Capacity 10.
        t.push_read(Scripted::Ok(read_capacity_10_bytes(0x00F0_0000, 512)));
        t.push_read(Scripted::Ok(csw_bytes(6, csw_status::PASSED)));
        // Mode Sense Caching.
        let mut mode = vec![0u8; 4 + 8];
        mode[3] = 0;
        mode[4 + 2] = 0x04;
        t.push_read(Scripted::Ok(mode));
        t.push_read(Scripted::Ok(csw_bytes(7, csw_status::PASSED)));

        let mut channel = Channel::Bot(&mut t);
        let lun = probe(&mut channel, 0, "SN1234", &cfg).await.unwrap().expect("lun should probe successfully");
        assert_eq!(lun.block_count, 0x00F0_0001);
        assert_eq!(lun.block_length, 512);
        assert!(!lun.long_lba);
        assert!(lun.write_cache_enabled);
        assert_eq!(lun.serial, "SN1234");
    }

    #[tokio::test]
    async fn rejects_unsupported_block_length() {
        let mut t = MockTransport::default();
        let cfg = Config::default();

        t.push_read(Scripted::Ok(csw_bytes(1, csw_status::PASSED)));
        t.push_read(Scripted::Ok(inquiry_bytes()));
        t.push_read(Scripted::Ok(csw_bytes(2, csw_status::PASSED)));
        t.push_read(Scripted::Ok(csw_bytes(3, csw_status::FAILED)));
        t.push_read(Scripted::Ok(vec![0u8; 18]));
        t.push_read(Scripted::Ok(vec![0u8; 18]));
        t.push_read(Scripted::Ok(csw_bytes(5, csw_status::PASSED)));
        // Read Capacity 10 with a block length SCSI never defines.
        t.push_read(Scripted::Ok(read_capacity_10_bytes(0x00F0_0000, 520)));
        t.push_read(Scripted::Ok(csw_bytes(6, csw_status::PASSED)));

        let mut channel = Channel::Bot(&mut t);
        let err = probe(&mut channel, 0, "", &cfg).await.unwrap_err();
        assert!(matches!(err, CoreError::Medium(MediumError::InvalidGeometry)));
    }
}

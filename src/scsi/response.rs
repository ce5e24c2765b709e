//! Parsers for SCSI replies: INQUIRY, READ CAPACITY (10/16), MODE SENSE
//! (Caching page), and REQUEST SENSE, as required by §4.2.

use bytemuck::Pod;

use crate::error::{CoreError, ProtocolError};
use crate::scsi::command_descriptor::{ReadCapacity10Reply, ReadCapacity16Reply};
use crate::scsi::sense::SenseTriple;

/// Casts a reply buffer onto a `Pod` struct, failing with a `ProtocolError`
/// rather than panicking if the device returned a short buffer.
pub fn parse_fixed<T: Pod>(buf: &[u8]) -> Result<T, CoreError> {
    bytemuck::try_from_bytes::<T>(&buf[..std::mem::size_of::<T>().min(buf.len())])
        .copied()
        .map_err(|_| {
            CoreError::Protocol(ProtocolError::ShortRead {
                expected: std::mem::size_of::<T>(),
                got: buf.len(),
            })
        })
}

/// Parsed 36-byte standard INQUIRY reply, trimmed to the LUN attributes the
/// prober records (§3 LUN data model, §4.4 step 2).
#[derive(Debug, Clone)]
pub struct InquiryInfo {
    pub peripheral_qualifier: u8,
    pub peripheral_device_type: u8,
    pub removable: bool,
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_revision: [u8; 4],
}

/// Peripheral device types accepted as "direct-access block device" by the
/// prober (§4.4 step 2).
pub const DIRECT_ACCESS_TYPES: [u8; 3] = [0x00, 0x07, 0x0E];

impl InquiryInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CoreError> {
        if buf.len() < 36 {
            return Err(CoreError::Protocol(ProtocolError::ShortRead { expected: 36, got: buf.len() }));
        }
        let peripheral_info = buf[0];
        let mut vendor_id = [0u8; 8];
        vendor_id.copy_from_slice(&buf[8..16]);
        let mut product_id = [0u8; 16];
        product_id.copy_from_slice(&buf[16..32]);
        let mut product_revision = [0u8; 4];
        product_revision.copy_from_slice(&buf[32..36]);
        Ok(Self {
            peripheral_qualifier: peripheral_info >> 5,
            peripheral_device_type: peripheral_info & 0x1F,
            removable: (buf[1] & 0x80) != 0,
            vendor_id,
            product_id,
            product_revision,
        })
    }

    pub fn is_direct_access_block_device(&self) -> bool {
        self.peripheral_qualifier == 0 && DIRECT_ACCESS_TYPES.contains(&self.peripheral_device_type)
    }
}

/// Trims trailing ASCII spaces (SCSI pads identification fields with 0x20)
/// and any non-ASCII bytes, per §4.4 step 2's "trim trailing spaces".
pub fn trim_scsi_ascii(buf: &[u8]) -> String {
    let trimmed = buf
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map(|last| &buf[..=last])
        .unwrap_or(&[]);
    trimmed.iter().map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' }).collect()
}

/// `(last_lba, block_length)` decoded from a READ CAPACITY (10) reply.
pub fn parse_read_capacity_10(buf: &[u8]) -> Result<(u32, u32), CoreError> {
    let reply: ReadCapacity10Reply = parse_fixed(buf)?;
    Ok((u32::from_be_bytes(reply.last_lba_be), u32::from_be_bytes(reply.block_length_be)))
}

/// `(last_lba, block_length)` decoded from a READ CAPACITY (16) reply.
pub fn parse_read_capacity_16(buf: &[u8]) -> Result<(u64, u32), CoreError> {
    let reply: ReadCapacity16Reply = parse_fixed(buf)?;
    Ok((u64::from_be_bytes(reply.last_lba_be), u32::from_be_bytes(reply.block_length_be)))
}

/// Fixed-format sense data (REQUEST SENSE), trimmed to key/ASC/ASCQ.
pub fn parse_request_sense(buf: &[u8]) -> Result<SenseTriple, CoreError> {
    if buf.len() < 14 {
        return Err(CoreError::Protocol(ProtocolError::ShortRead { expected: 14, got: buf.len() }));
    }
    Ok(SenseTriple { key: buf[2] & 0x0F, asc: buf[12], ascq: buf[13] })
}

/// Write-cache-enabled / write-protect bits parsed out of a MODE SENSE (6)
/// Caching page and its header (§4.4 step 6).
#[derive(Debug, Clone, Copy, Default)]
pub struct CachingInfo {
    pub write_cache_enabled: bool,
    pub write_protected: bool,
}

/// Parses the 4-byte MODE SENSE (6) header followed by an 8-byte (or
/// longer) Caching mode page, as returned for page code 0x08. The WP bit
/// (device-specific parameter, header byte 2 bit 7) is independent of the
/// Caching page itself but lives in the same reply.
pub fn parse_mode_sense_caching(buf: &[u8]) -> Result<CachingInfo, CoreError> {
    const HEADER_LEN: usize = 4;
    if buf.len() < HEADER_LEN + 3 {
        return Err(CoreError::Protocol(ProtocolError::ShortRead { expected: HEADER_LEN + 3, got: buf.len() }));
    }
    let write_protected = (buf[2] & 0x80) != 0;
    let block_descriptor_len = buf[3] as usize;
    let page_offset = HEADER_LEN + block_descriptor_len;
    if buf.len() <= page_offset + 2 {
        return Err(CoreError::Protocol(ProtocolError::ShortRead { expected: page_offset + 3, got: buf.len() }));
    }
    let wce = (buf[page_offset + 2] & 0x04) != 0;
    Ok(CachingInfo { write_cache_enabled: wce, write_protected })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_spaces() {
        assert_eq!(trim_scsi_ascii(b"Kingston DataTraveler    "), "Kingston DataTraveler");
        assert_eq!(trim_scsi_ascii(b"        "), "");
    }

    #[test]
    fn read_capacity_10_reply_decodes_big_endian() {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&0x00F0_0000u32.to_be_bytes());
        buf[4..8].copy_from_slice(&512u32.to_be_bytes());
        let (last_lba, block_len) = parse_read_capacity_10(&buf).unwrap();
        assert_eq!(last_lba, 0x00F0_0000);
        assert_eq!(block_len, 512);
    }

    #[test]
    fn read_capacity_10_all_ones_signals_overflow() {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&u32::MAX.to_be_bytes());
        buf[4..8].copy_from_slice(&512u32.to_be_bytes());
        let (last_lba, _) = parse_read_capacity_10(&buf).unwrap();
        assert_eq!(last_lba, 0xFFFF_FFFF);
    }

    #[test]
    fn inquiry_identifies_direct_access_disk() {
        let mut buf = [0x20u8; 36];
        buf[0] = 0x00; // qualifier 0, type 0 (direct access)
        buf[1] = 0x80; // removable
        let info = InquiryInfo::from_bytes(&buf).unwrap();
        assert!(info.is_direct_access_block_device());
        assert!(info.removable);
    }

    #[test]
    fn sense_triple_parses_medium_not_present() {
        let mut buf = [0u8; 18];
        buf[2] = 0x02; // NOT READY
        buf[12] = 0x3A;
        buf[13] = 0x00;
        let sense = parse_request_sense(&buf).unwrap();
        assert_eq!(sense.key, 0x02);
        assert_eq!(sense.asc, 0x3A);
        assert_eq!(sense.ascq, 0x00);
    }
}

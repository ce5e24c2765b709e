//! The Command Block Wrapper and Command Status Wrapper framing structures
//! of the Bulk-Only Transport, USB Mass Storage Class §5.

use bytemuck::{Pod, Zeroable};

/// Signature identifying a packet as a CBW (little-endian on the wire).
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// Signature identifying a packet as a CSW (little-endian on the wire).
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Direction of the optional data phase that follows a CBW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbwDirection {
    DataIn,
    DataOut,
    NonDirectional,
}

impl CbwDirection {
    /// The CBW `flags` byte's direction bit (bit 7; 1 = IN, per USBMSC BOT §5.1 table 5.2).
    fn flag_bit(self) -> u8 {
        match self {
            CbwDirection::DataIn => 0x80,
            CbwDirection::DataOut | CbwDirection::NonDirectional => 0x00,
        }
    }
}

/// The 31-byte Command Block Wrapper, little-endian, §5.1.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CommandBlockWrapper {
    signature: [u8; 4],
    tag: [u8; 4],
    data_transfer_length: [u8; 4],
    flags: u8,
    lun: u8,
    cdb_length: u8,
    cdb: [u8; 16],
}

impl CommandBlockWrapper {
    /// `lun` identifies which LUN (0-15, low nibble) the wrapped command targets.
    pub fn new(tag: u32, data_transfer_length: u32, direction: CbwDirection, lun: u8, cdb: &[u8]) -> Self {
        debug_assert!(cdb.len() <= 16);
        debug_assert!(lun <= 0x0F);
        let mut cdb_buf = [0u8; 16];
        cdb_buf[..cdb.len()].copy_from_slice(cdb);
        Self {
            signature: CBW_SIGNATURE.to_le_bytes(),
            tag: tag.to_le_bytes(),
            data_transfer_length: data_transfer_length.to_le_bytes(),
            flags: direction.flag_bit(),
            lun: lun & 0x0F,
            cdb_length: cdb.len() as u8,
            cdb: cdb_buf,
        }
    }

    pub fn tag(&self) -> u32 {
        u32::from_le_bytes(self.tag)
    }
}

/// The 13-byte Command Status Wrapper, little-endian, §5.2.
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
pub struct CommandStatusWrapper {
    signature: [u8; 4],
    tag: [u8; 4],
    data_residue: [u8; 4],
    status: u8,
}

/// CSW status byte values, §5.2 table 5.3.
pub mod csw_status {
    pub const PASSED: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const PHASE_ERROR: u8 = 2;
}

impl CommandStatusWrapper {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        bytemuck::try_from_bytes::<Self>(buf).ok().copied()
    }

    pub fn signature(&self) -> u32 {
        u32::from_le_bytes(self.signature)
    }

    pub fn tag(&self) -> u32 {
        u32::from_le_bytes(self.tag)
    }

    pub fn data_residue(&self) -> u32 {
        u32::from_le_bytes(self.data_residue)
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn is_valid_signature(&self) -> bool {
        self.signature() == CSW_SIGNATURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbw_is_exactly_31_bytes() {
        assert_eq!(std::mem::size_of::<CommandBlockWrapper>(), 31);
    }

    #[test]
    fn csw_is_exactly_13_bytes() {
        assert_eq!(std::mem::size_of::<CommandStatusWrapper>(), 13);
    }

    #[test]
    fn cbw_encodes_signature_little_endian() {
        let cbw = CommandBlockWrapper::new(1, 36, CbwDirection::DataIn, 0, &[0x12]);
        assert_eq!(cbw.signature, CBW_SIGNATURE.to_le_bytes());
        assert_eq!(cbw.flags, 0x80);
        assert_eq!(cbw.tag(), 1);
    }

    #[test]
    fn csw_round_trips_through_bytes() {
        let raw: [u8; 13] = {
            let mut b = [0u8; 13];
            b[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
            b[4..8].copy_from_slice(&7u32.to_le_bytes());
            b[12] = csw_status::PASSED;
            b
        };
        let csw = CommandStatusWrapper::parse(&raw).unwrap();
        assert!(csw.is_valid_signature());
        assert_eq!(csw.tag(), 7);
        assert_eq!(csw.status(), csw_status::PASSED);
    }
}

//! Command-block builders: one function per CDB the prober or Block
//! Adapter issues. Each wraps a `command_descriptor` struct into a
//! direction-tagged, size-tagged [`CommandBlock`] the transport state
//! machines (BOT/UASP) can submit without knowing SCSI semantics.

use bytemuck::bytes_of;

use super::command_descriptor::*;
use crate::usb::cbw::CbwDirection;

/// A serialized CDB ready to be embedded in a CBW or a UASP Command IU,
/// plus the metadata the BOT/UASP state machine needs to drive the data
/// phase without inspecting the command bytes itself.
pub struct CommandBlock {
    bytes: Vec<u8>,
    pub direction: CbwDirection,
    pub data_transfer_len: u32,
    payload: Vec<u8>,
}

impl CommandBlock {
    fn new(bytes: &[u8], direction: CbwDirection, data_transfer_len: u32) -> Self {
        debug_assert!(bytes.len() <= 16, "CDB exceeds the 16-byte USB maximum (§4.2)");
        Self { bytes: bytes.to_vec(), direction, data_transfer_len, payload: Vec::new() }
    }

    pub fn cdb(&self) -> &[u8] {
        &self.bytes
    }

    /// Attaches the bytes a `DataOut` command sends in its data phase.
    /// `data.len()` must equal `data_transfer_len`; the BOT/UASP state
    /// machines trust this and do not re-check it.
    pub fn set_payload(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len() as u32, self.data_transfer_len);
        self.payload = data.to_vec();
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::new(bytes_of(&TestUnitReady::new()), CbwDirection::NonDirectional, 0)
}

pub fn request_sense(allocation_length: u8) -> CommandBlock {
    CommandBlock::new(
        bytes_of(&RequestSense::new(allocation_length)),
        CbwDirection::DataIn,
        allocation_length as u32,
    )
}

pub fn inquiry() -> CommandBlock {
    CommandBlock::new(bytes_of(&Inquiry::standard(36)), CbwDirection::DataIn, 36)
}

pub fn prevent_allow_medium_removal(prevent: bool) -> CommandBlock {
    CommandBlock::new(bytes_of(&PreventAllowMediumRemoval::new(prevent)), CbwDirection::NonDirectional, 0)
}

pub fn start_stop_unit(start: bool) -> CommandBlock {
    CommandBlock::new(bytes_of(&StartStopUnit::new(start)), CbwDirection::NonDirectional, 0)
}

pub fn read_format_capacities() -> CommandBlock {
    CommandBlock::new(bytes_of(&ReadFormatCapacities::new(255)), CbwDirection::DataIn, 255)
}

pub fn read_capacity_10() -> CommandBlock {
    CommandBlock::new(bytes_of(&ReadCapacity10::new()), CbwDirection::DataIn, 8)
}

pub fn read_capacity_16() -> CommandBlock {
    CommandBlock::new(bytes_of(&ReadCapacity16::new()), CbwDirection::DataIn, 32)
}

pub fn mode_sense_caching(allocation_length: u8) -> CommandBlock {
    CommandBlock::new(
        bytes_of(&ModeSense6::new(MODE_PAGE_CACHING, allocation_length)),
        CbwDirection::DataIn,
        allocation_length as u32,
    )
}

pub fn read_10(lba: u32, count: u16, block_length: u32) -> CommandBlock {
    CommandBlock::new(bytes_of(&Read10::new(lba, count)), CbwDirection::DataIn, count as u32 * block_length)
}

pub fn write_10(lba: u32, count: u16, block_length: u32) -> CommandBlock {
    CommandBlock::new(bytes_of(&Write10::new(lba, count)), CbwDirection::DataOut, count as u32 * block_length)
}

pub fn read_16(lba: u64, count: u32, block_length: u32) -> CommandBlock {
    CommandBlock::new(bytes_of(&Read16::new(lba, count)), CbwDirection::DataIn, count * block_length)
}

pub fn write_16(lba: u64, count: u32, block_length: u32) -> CommandBlock {
    CommandBlock::new(bytes_of(&Write16::new(lba, count)), CbwDirection::DataOut, count * block_length)
}

pub fn synchronize_cache_10() -> CommandBlock {
    CommandBlock::new(bytes_of(&SynchronizeCache10::new()), CbwDirection::NonDirectional, 0)
}

pub fn report_luns(allocation_length: u32) -> CommandBlock {
    CommandBlock::new(bytes_of(&ReportLuns::new(allocation_length)), CbwDirection::DataIn, allocation_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_10_carries_correct_transfer_length() {
        let cb = read_10(0, 4, 512);
        assert_eq!(cb.data_transfer_len, 2048);
        assert_eq!(cb.direction, CbwDirection::DataIn);
        assert_eq!(cb.cdb().len(), 10);
    }

    #[test]
    fn test_unit_ready_is_non_directional_and_six_bytes() {
        let cb = test_unit_ready();
        assert_eq!(cb.cdb().len(), 6);
        assert_eq!(cb.direction, CbwDirection::NonDirectional);
        assert_eq!(cb.data_transfer_len, 0);
    }
}

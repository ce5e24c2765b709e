//! Byte-exact layouts for the CDBs this prober issues, and the fixed-size
//! portion of their replies.
//!
//! Every field here is big-endian and built with explicit `to_be_bytes()` —
//! never a native multi-byte integer — so host endianness can never leak
//! into the wire format (§4.2). Structs derive `bytemuck::Pod` instead of
//! going through an `unsafe` pointer-to-slice cast: every field is a plain
//! `u8` or `[u8; N]`, so there is no padding and no invalid bit pattern for
//! `bytemuck` to worry about.

use bytemuck::{Pod, Zeroable};

pub mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SENSE_10: u8 = 0x5A;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    pub const REPORT_LUNS: u8 = 0xA0;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    pub const READ_CAPACITY_16: u8 = 0x9E;
    pub const READ_CAPACITY_16_SERVICE_ACTION: u8 = 0x10;
}

macro_rules! pod_cdb {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Clone, Copy, Pod, Zeroable)]
        #[repr(C)]
        pub struct $name {
            $(pub $field: $ty),*
        }
    };
}

pod_cdb!(TestUnitReady {
    operation_code: u8,
    reserved: [u8; 4],
    control: u8,
});

impl TestUnitReady {
    pub fn new() -> Self {
        Self { operation_code: op::TEST_UNIT_READY, reserved: [0; 4], control: 0 }
    }
}

pod_cdb!(RequestSense {
    operation_code: u8,
    desc: u8,
    reserved: [u8; 2],
    allocation_length: u8,
    control: u8,
});

impl RequestSense {
    pub fn new(allocation_length: u8) -> Self {
        Self { operation_code: op::REQUEST_SENSE, desc: 0, reserved: [0; 2], allocation_length, control: 0 }
    }
}

pod_cdb!(Inquiry {
    operation_code: u8,
    evpd: u8,
    page_code: u8,
    allocation_length_be: [u8; 2],
    control: u8,
});

impl Inquiry {
    pub fn standard(len: u16) -> Self {
        Self {
            operation_code: op::INQUIRY,
            evpd: 0,
            page_code: 0,
            allocation_length_be: len.to_be_bytes(),
            control: 0,
        }
    }
}

pod_cdb!(PreventAllowMediumRemoval {
    operation_code: u8,
    reserved: [u8; 3],
    prevent: u8,
    control: u8,
});

impl PreventAllowMediumRemoval {
    pub fn new(prevent: bool) -> Self {
        Self {
            operation_code: op::PREVENT_ALLOW_MEDIUM_REMOVAL,
            reserved: [0; 3],
            prevent: prevent as u8,
            control: 0,
        }
    }
}

pod_cdb!(StartStopUnit {
    operation_code: u8,
    immed: u8,
    reserved: u8,
    power_condition_modifier: u8,
    flags: u8,
    control: u8,
});

impl StartStopUnit {
    /// `start = false` issues STOP UNIT (used on LUN teardown, §3 LUN lifecycle).
    pub fn new(start: bool) -> Self {
        Self {
            operation_code: op::START_STOP_UNIT,
            immed: 0,
            reserved: 0,
            power_condition_modifier: 0,
            flags: start as u8,
            control: 0,
        }
    }
}

pod_cdb!(ReadFormatCapacities {
    operation_code: u8,
    reserved: [u8; 6],
    allocation_length_be: [u8; 2],
    control: u8,
});

impl ReadFormatCapacities {
    pub fn new(allocation_length: u16) -> Self {
        Self {
            operation_code: op::READ_FORMAT_CAPACITIES,
            reserved: [0; 6],
            allocation_length_be: allocation_length.to_be_bytes(),
            control: 0,
        }
    }
}

pod_cdb!(ReadCapacity10 {
    operation_code: u8,
    reserved1: u8,
    lba_be: [u8; 4],
    reserved6: [u8; 3],
    control: u8,
});

impl ReadCapacity10 {
    pub fn new() -> Self {
        Self { operation_code: op::READ_CAPACITY_10, reserved1: 0, lba_be: [0; 4], reserved6: [0; 3], control: 0 }
    }
}

#[derive(Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct ReadCapacity10Reply {
    pub last_lba_be: [u8; 4],
    pub block_length_be: [u8; 4],
}

pod_cdb!(ReadCapacity16 {
    operation_code: u8,
    service_action: u8,
    lba_be: [u8; 8],
    allocation_length_be: [u8; 4],
    reserved: u8,
    control: u8,
});

impl ReadCapacity16 {
    pub fn new() -> Self {
        Self {
            operation_code: op::READ_CAPACITY_16,
            service_action: op::READ_CAPACITY_16_SERVICE_ACTION,
            lba_be: [0; 8],
            allocation_length_be: 32u32.to_be_bytes(),
            reserved: 0,
            control: 0,
        }
    }
}

#[derive(Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct ReadCapacity16Reply {
    pub last_lba_be: [u8; 8],
    pub block_length_be: [u8; 4],
    pub flags: [u8; 2],
    pub lowest_aligned_lba_be: [u8; 2],
    pub reserved: [u8; 16],
}

pod_cdb!(ModeSense6 {
    operation_code: u8,
    dbd: u8,
    page_control_and_code: u8,
    subpage_code: u8,
    allocation_length: u8,
    control: u8,
});

/// Caching mode page, queried by the prober to learn WCE/FUA support (§4.4 step 6).
pub const MODE_PAGE_CACHING: u8 = 0x08;

impl ModeSense6 {
    pub fn new(page_code: u8, allocation_length: u8) -> Self {
        Self {
            operation_code: op::MODE_SENSE_6,
            dbd: 0,
            page_control_and_code: page_code & 0x3F,
            subpage_code: 0,
            allocation_length,
            control: 0,
        }
    }
}

pod_cdb!(Read10 {
    operation_code: u8,
    flags: u8,
    lba_be: [u8; 4],
    group: u8,
    transfer_length_be: [u8; 2],
    control: u8,
});

impl Read10 {
    pub fn new(lba: u32, count: u16) -> Self {
        Self { operation_code: op::READ_10, flags: 0, lba_be: lba.to_be_bytes(), group: 0, transfer_length_be: count.to_be_bytes(), control: 0 }
    }
}

pod_cdb!(Write10 {
    operation_code: u8,
    flags: u8,
    lba_be: [u8; 4],
    group: u8,
    transfer_length_be: [u8; 2],
    control: u8,
});

impl Write10 {
    pub fn new(lba: u32, count: u16) -> Self {
        Self { operation_code: op::WRITE_10, flags: 0, lba_be: lba.to_be_bytes(), group: 0, transfer_length_be: count.to_be_bytes(), control: 0 }
    }
}

pod_cdb!(Read16 {
    operation_code: u8,
    flags: u8,
    lba_be: [u8; 8],
    transfer_length_be: [u8; 4],
    group: u8,
    control: u8,
});

impl Read16 {
    pub fn new(lba: u64, count: u32) -> Self {
        Self { operation_code: op::READ_16, flags: 0, lba_be: lba.to_be_bytes(), transfer_length_be: count.to_be_bytes(), group: 0, control: 0 }
    }
}

pod_cdb!(Write16 {
    operation_code: u8,
    flags: u8,
    lba_be: [u8; 8],
    transfer_length_be: [u8; 4],
    group: u8,
    control: u8,
});

impl Write16 {
    pub fn new(lba: u64, count: u32) -> Self {
        Self { operation_code: op::WRITE_16, flags: 0, lba_be: lba.to_be_bytes(), transfer_length_be: count.to_be_bytes(), group: 0, control: 0 }
    }
}

pod_cdb!(SynchronizeCache10 {
    operation_code: u8,
    flags: u8,
    lba_be: [u8; 4],
    group: u8,
    num_blocks_be: [u8; 2],
    control: u8,
});

impl SynchronizeCache10 {
    pub fn new() -> Self {
        Self { operation_code: op::SYNCHRONIZE_CACHE_10, flags: 0, lba_be: [0; 4], group: 0, num_blocks_be: [0; 2], control: 0 }
    }
}

pod_cdb!(ReportLuns {
    operation_code: u8,
    reserved1: u8,
    select_report: u8,
    reserved2: [u8; 3],
    allocation_length_be: [u8; 4],
    reserved3: u8,
    control: u8,
});

impl ReportLuns {
    pub fn new(allocation_length: u32) -> Self {
        Self {
            operation_code: op::REPORT_LUNS,
            reserved1: 0,
            select_report: 0,
            reserved2: [0; 3],
            allocation_length_be: allocation_length.to_be_bytes(),
            reserved3: 0,
            control: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read10_encodes_big_endian_lba() {
        let cdb = Read10::new(0x0102_0304, 0x0506);
        assert_eq!(cdb.lba_be, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(cdb.transfer_length_be, [0x05, 0x06]);
        assert_eq!(cdb.operation_code, op::READ_10);
    }

    #[test]
    fn cdb_sizes_match_spec() {
        assert_eq!(std::mem::size_of::<TestUnitReady>(), 6);
        assert_eq!(std::mem::size_of::<Inquiry>(), 6);
        assert_eq!(std::mem::size_of::<ReadCapacity10>(), 10);
        assert_eq!(std::mem::size_of::<Read10>(), 10);
        assert_eq!(std::mem::size_of::<Read16>(), 16);
        assert_eq!(std::mem::size_of::<ReadCapacity16>(), 16);
    }

    #[test]
    fn read_capacity_16_requests_long_response() {
        let cdb = ReadCapacity16::new();
        assert_eq!(cdb.service_action, op::READ_CAPACITY_16_SERVICE_ACTION);
    }
}

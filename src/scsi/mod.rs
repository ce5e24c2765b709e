//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//!
//! This module only encodes and decodes SCSI wire formats. Sequencing
//! commands against a particular LUN — the "what order, how many retries"
//! question — belongs to [`crate::lun`].

pub mod command;
pub mod command_descriptor;
pub mod response;
pub mod sense;

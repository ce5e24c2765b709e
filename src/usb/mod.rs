//! Interactions with USB mass storage devices: transport abstraction,
//! Bulk-Only Transport and UASP state machines, and the `nusb`-backed host
//! implementation.
//!
//! As described by the USB Mass Storage Class - Bulk Only Transport spec
//! and the USB Attached SCSI Protocol spec: a drive exposes either one
//! bulk IN/OUT pair carrying framed CBW/data/CSW cycles, or four
//! independent bulk pipes carrying tagged Information Units. Both map onto
//! the same [`transport::UsbTransport`] capability interface so the rest
//! of the core (the LUN prober, the Block Adapter) can drive either
//! without knowing which one it has.

pub mod bot;
pub mod cbw;
pub mod engine;
pub mod host;
pub mod transport;
pub mod uasp;

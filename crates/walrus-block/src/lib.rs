//! Block-device abstraction for the Walrus engine.
//!
//! The engine owns two devices - a log device and a data device - both
//! behind the [`BlockDevice`] trait. A file-backed implementation is
//! provided for tests and embedding. [`SectorIo`] layers typed,
//! checksum-aware sector access on top of a device.

pub mod device;
pub mod sector;

pub use device::{BlockDevice, FileBlockDevice};
pub use sector::SectorIo;

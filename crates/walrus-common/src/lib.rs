//! Shared types for the Walrus block-level WAL engine.
//!
//! Holds the error type, the LSID state machine, the on-disk checksum
//! and the engine configuration used by every other crate.

pub mod checksum;
pub mod config;
pub mod error;
pub mod lsid;

pub use config::{EngineConfig, FormatOptions};
pub use error::{Result, WalrusError};
pub use lsid::{Lsid, LsidSet, LsidState};

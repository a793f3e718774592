//! The Walrus engine runtime.
//!
//! Assembles the write pipeline, checkpoint loop, freeze state machine
//! and control surface around the formats in `walrus-wal`, and exposes
//! the whole thing as an [`Engine`] value owned by the host.

pub mod checkpoint;
pub mod control;
pub mod engine;
pub mod iocore;

pub use control::{ControlRequest, ControlResponse};
pub use engine::Engine;

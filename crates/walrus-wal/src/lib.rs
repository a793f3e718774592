//! On-disk formats and stores of the Walrus log device.
//!
//! Covers the super sector (mirrored metadata), the log-pack codec,
//! the ring-buffer address arithmetic, the snapshot store and the
//! crash-recovery (redo) pass.

pub mod constants;
pub mod logpack;
pub mod redo;
pub mod ring;
pub mod snapshot;
pub mod super_block;

pub use logpack::{LogPack, LogPackHeader, LogRecord, PackBuilder, PackIo};
pub use redo::{redo, RedoReport};
pub use ring::RingAllocator;
pub use snapshot::{SnapshotRecord, SnapshotStore};
pub use super_block::{read_super, write_super, SuperBlock, SuperSector};

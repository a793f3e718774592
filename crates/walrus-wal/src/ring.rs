//! Ring-buffer address arithmetic.
//!
//! LSIDs map onto the circular log region as
//! `ring_offset + (lsid mod ring_size)`; the allocator is pure math
//! over the layout published by the super sector.

use walrus_common::Lsid;

/// Maps LSIDs to log-device sector offsets and tracks capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocator {
    ring_offset: u64,
    ring_size: u64,
}

impl RingAllocator {
    pub fn new(ring_offset: u64, ring_size: u64) -> Self {
        debug_assert!(ring_size > 0);
        Self {
            ring_offset,
            ring_size,
        }
    }

    /// First sector of the ring on the log device.
    pub fn offset(&self) -> u64 {
        self.ring_offset
    }

    /// Ring capacity in sectors.
    pub fn size(&self) -> u64 {
        self.ring_size
    }

    /// Log-device sector offset of an LSID.
    pub fn offset_of(&self, lsid: Lsid) -> u64 {
        self.ring_offset + (lsid.0 % self.ring_size)
    }

    /// Sectors from this LSID to the ring end (inclusive of the LSID's
    /// own sector); a pack must fit here to stay contiguous on disk.
    pub fn contiguous_from(&self, lsid: Lsid) -> u64 {
        self.ring_size - (lsid.0 % self.ring_size)
    }

    /// True when appending `pack_size` sectors would overwrite the
    /// oldest retained log record.
    pub fn would_overflow(&self, oldest: Lsid, latest: Lsid, pack_size: u64) -> bool {
        latest.0 - oldest.0 + pack_size > self.ring_size
    }

    /// Free sectors between `latest` and the overwrite horizon.
    pub fn free_space(&self, oldest: Lsid, latest: Lsid) -> u64 {
        self.ring_size - (latest.0 - oldest.0)
    }
}

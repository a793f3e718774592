//! LSID types and the locked LSID state.

use crate::{Result, WalrusError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log sequence id - the position of a log record in the logical,
/// unwrapped log stream.
///
/// LSIDs are monotonically increasing 64-bit values. The ring-buffer
/// offset of an LSID is `ring_offset + (lsid mod ring_size)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsid(pub u64);

impl Lsid {
    /// Invalid/unset LSID.
    pub const INVALID: Lsid = Lsid(u64::MAX);

    /// Returns true if this is a valid LSID.
    pub fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }

    /// Returns the LSID advanced by the given number of log sectors.
    pub fn advance(&self, n: u64) -> Lsid {
        Lsid(self.0.wrapping_add(n))
    }
}

impl std::fmt::Display for Lsid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// The seven LSID cursors tracked by the engine.
///
/// Ordering invariant, at all times:
/// `oldest <= prev_written <= written <= permanent <= completed <= flush <= latest`.
///
/// - `latest` - next LSID to assign.
/// - `flush` - highest LSID covered by a submitted log write whose
///   durability (FUA or a following FLUSH) has been arranged.
/// - `completed` - all log writes up to here finished on the log device.
/// - `permanent` - plus a FLUSH made them crash-safe.
/// - `written` - all data-device writes up to here are done.
/// - `prev_written` - `written` as of the last successful checkpoint.
/// - `oldest` - earliest LSID still retrievable in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsidSet {
    pub oldest: Lsid,
    pub prev_written: Lsid,
    pub written: Lsid,
    pub permanent: Lsid,
    pub completed: Lsid,
    pub flush: Lsid,
    pub latest: Lsid,
}

impl LsidSet {
    /// All cursors at the given LSID.
    pub fn uniform(lsid: Lsid) -> Self {
        Self {
            oldest: lsid,
            prev_written: lsid,
            written: lsid,
            permanent: lsid,
            completed: lsid,
            flush: lsid,
            latest: lsid,
        }
    }

    /// Returns true if the ordering invariant holds.
    pub fn is_ordered(&self) -> bool {
        self.oldest <= self.prev_written
            && self.prev_written <= self.written
            && self.written <= self.permanent
            && self.permanent <= self.completed
            && self.completed <= self.flush
            && self.flush <= self.latest
    }
}

/// The LSID set under its single lock.
///
/// Getters return copies; mutators re-check the ordering invariant and
/// refuse the update (debug-assert, error in release) on violation.
pub struct LsidState {
    inner: Mutex<LsidSet>,
}

impl LsidState {
    /// Creates the state from an initial, ordered set.
    pub fn new(set: LsidSet) -> Result<Self> {
        if !set.is_ordered() {
            return Err(WalrusError::InvalidLsid {
                lsid: set.latest.0,
                reason: "initial lsid set out of order".to_string(),
            });
        }
        Ok(Self {
            inner: Mutex::new(set),
        })
    }

    /// Returns a copy of the whole set.
    pub fn snapshot(&self) -> LsidSet {
        *self.inner.lock()
    }

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut LsidSet),
    {
        let mut guard = self.inner.lock();
        let mut next = *guard;
        f(&mut next);
        if !next.is_ordered() {
            debug_assert!(false, "lsid ordering violated: {:?}", next);
            return Err(WalrusError::InvalidLsid {
                lsid: next.latest.0,
                reason: "lsid ordering violated".to_string(),
            });
        }
        *guard = next;
        Ok(())
    }

    /// Reserves `n` log sectors and returns the first assigned LSID.
    pub fn advance_latest(&self, n: u64) -> Result<Lsid> {
        let mut guard = self.inner.lock();
        let first = guard.latest;
        guard.latest = first.advance(n);
        Ok(first)
    }

    /// Marks log writes up to `lsid` as submitted with durability arranged.
    pub fn set_flush(&self, lsid: Lsid) -> Result<()> {
        self.update(|s| s.flush = s.flush.max(lsid))
    }

    /// Marks log writes up to `lsid` as completed on the log device.
    pub fn set_completed(&self, lsid: Lsid) -> Result<()> {
        self.update(|s| s.completed = s.completed.max(lsid))
    }

    /// Raises `permanent` up to the given LSID (never lowers it).
    pub fn promote_permanent(&self, up_to: Lsid) -> Result<()> {
        self.update(|s| s.permanent = s.permanent.max(up_to))
    }

    /// Marks data-device writes up to `lsid` as done.
    pub fn set_written(&self, lsid: Lsid) -> Result<()> {
        self.update(|s| s.written = s.written.max(lsid))
    }

    /// Records the `written` value persisted by the last checkpoint.
    pub fn set_prev_written(&self, lsid: Lsid) -> Result<()> {
        self.update(|s| s.prev_written = s.prev_written.max(lsid))
    }

    /// Advances `oldest`. The caller validates the LSID against the log.
    ///
    /// `prev_written` is dragged along when the new `oldest` passes it;
    /// the discarded prefix can no longer be a redo starting point.
    pub fn set_oldest(&self, lsid: Lsid) -> Result<()> {
        self.update(|s| {
            s.oldest = lsid;
            s.prev_written = s.prev_written.max(lsid);
        })
    }

    /// Resets every cursor to the given LSID (clear-log).
    pub fn reset(&self, lsid: Lsid) {
        *self.inner.lock() = LsidSet::uniform(lsid);
    }

    /// Restores a previously snapshotted set (clear-log failure path).
    pub fn restore(&self, set: LsidSet) {
        *self.inner.lock() = set;
    }
}

//! Periodic persistence of the advanced LSIDs into the super sector.

use crate::engine::EngineShared;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use walrus_common::config::MAX_CHECKPOINT_INTERVAL_MS;
use walrus_common::{Result, WalrusError};

/// The checkpoint loop.
///
/// Each tick flushes the data device (making `written` crash-safe) and
/// syncs the super sector. Any failure latches the engine read-only
/// and stops the loop. `stop`/`start` are idempotent; freeze and
/// clear-log pause the loop through them.
pub(crate) struct Checkpointer {
    shared: Arc<EngineShared>,
    interval_ms: Arc<AtomicU32>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Checkpointer {
    pub(crate) fn new(shared: Arc<EngineShared>, interval_ms: u32) -> Self {
        Self {
            shared,
            interval_ms: Arc::new(AtomicU32::new(interval_ms)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn interval_ms(&self) -> u32 {
        self.interval_ms.load(Ordering::Acquire)
    }

    /// Updates the period; takes effect from the next tick.
    pub(crate) fn set_interval_ms(&self, interval_ms: u32) -> Result<()> {
        if interval_ms == 0 || interval_ms > MAX_CHECKPOINT_INTERVAL_MS {
            return Err(WalrusError::InvalidArgument(format!(
                "checkpoint interval {} outside 1..={} ms",
                interval_ms, MAX_CHECKPOINT_INTERVAL_MS
            )));
        }
        self.interval_ms.store(interval_ms, Ordering::Release);
        Ok(())
    }

    /// Runs one checkpoint now.
    pub(crate) fn take_checkpoint(&self) -> Result<()> {
        self.shared.check_writable()?;
        checkpoint_once(&self.shared)
    }

    /// Starts the loop if it is not running.
    pub(crate) fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let interval_ms = Arc::clone(&self.interval_ms);
        *handle = Some(tokio::spawn(async move {
            loop {
                let interval = interval_ms.load(Ordering::Acquire);
                tokio::time::sleep(Duration::from_millis(interval as u64)).await;
                if shared.is_read_only() {
                    return;
                }
                if checkpoint_once(&shared).is_err() {
                    return;
                }
            }
        }));
    }

    /// Stops the loop. The loop only sleeps between whole checkpoints,
    /// so aborting never tears a super write.
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

fn checkpoint_once(shared: &EngineShared) -> Result<()> {
    let result = shared.data.flush().and_then(|_| shared.sync_super());
    if let Err(ref e) = result {
        tracing::error!(error = %e, "checkpoint failed");
        shared.set_read_only("checkpoint failure");
    }
    result
}

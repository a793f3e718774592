//! Configuration for the Walrus engine.

use serde::{Deserialize, Serialize};

/// Upper bound on the checkpoint interval.
pub const MAX_CHECKPOINT_INTERVAL_MS: u32 = 3_600_000;

/// Upper bound on the freeze timeout; larger requests are clipped.
pub const MAX_FREEZE_TIMEOUT_SECS: u32 = 86_400;

/// Maximum device name length in bytes (the on-disk field holds 64
/// NUL-padded bytes).
pub const DEVICE_NAME_MAX: usize = 63;

/// Runtime tuning knobs of an engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Checkpoint period in milliseconds.
    pub checkpoint_interval_ms: u32,
    /// Maximum payload sectors grouped into one log pack.
    pub max_logpack_pb: u32,
    /// Log flush cadence: at most this many milliseconds between flushes.
    pub log_flush_interval_ms: u64,
    /// Log flush cadence: at most this many unflushed physical blocks.
    pub log_flush_interval_pb: u64,
    /// Data-device submissions sorted per bulk of this many jobs.
    pub n_io_bulk: usize,
    /// Stop accepting writes when in-flight data bytes exceed this many MiB.
    pub max_pending_mb: usize,
    /// Resume accepting writes when in-flight data bytes fall below this.
    pub min_pending_mb: usize,
    /// How long a write may wait on back-pressure before the engine
    /// gives up and latches read-only.
    pub queue_stop_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 10_000,
            max_logpack_pb: 64,
            log_flush_interval_ms: 100,
            log_flush_interval_pb: 512,
            n_io_bulk: 64,
            max_pending_mb: 32,
            min_pending_mb: 16,
            queue_stop_timeout_ms: 5_000,
        }
    }
}

/// Parameters for formatting a fresh pair of devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Device name stored in the super sector (up to 63 bytes).
    pub name: String,
    /// Number of snapshot metadata sectors to reserve.
    pub snapshot_metadata_size: u32,
    /// Exposed capacity in sectors; `None` means the data device size.
    pub device_size: Option<u64>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            snapshot_metadata_size: 8,
            device_size: None,
        }
    }
}

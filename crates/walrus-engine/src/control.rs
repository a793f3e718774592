//! The administrative control surface.
//!
//! Each request carries typed parameters and yields a typed response
//! or an error kind; the host maps both onto its own wire format.

use crate::engine::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use walrus_common::{Lsid, Result, WalrusError};
use walrus_wal::constants::FORMAT_VERSION;
use walrus_wal::SnapshotRecord;

/// Control operations accepted by [`Engine::control`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    GetOldestLsid,
    SetOldestLsid(u64),
    TakeCheckpoint,
    GetCheckpointInterval,
    SetCheckpointInterval(u32),
    GetWrittenLsid,
    GetPermanentLsid,
    GetCompletedLsid,
    GetLogUsage,
    GetLogCapacity,
    CreateSnapshot {
        name: String,
        /// `u64::MAX` means "the current completed LSID".
        lsid: u64,
        /// Seconds since the epoch; zero means "now".
        timestamp: u64,
    },
    DeleteSnapshot {
        name: String,
    },
    DeleteSnapshotRange {
        lsid0: u64,
        lsid1: u64,
    },
    GetSnapshot {
        name: String,
    },
    NumOfSnapshotRange {
        lsid0: u64,
        lsid1: u64,
    },
    ListSnapshotRange {
        lsid0: u64,
        lsid1: u64,
        max: u32,
    },
    ListSnapshotFrom {
        snapshot_id: u32,
        max: u32,
    },
    Resize {
        /// New exposed size in sectors; zero means "data device size".
        new_size: u64,
    },
    ClearLog,
    IsLogOverflow,
    Freeze {
        timeout_secs: u32,
    },
    IsFrozen,
    Melt,
    Version,
}

/// Typed results of control operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Lsid(u64),
    Size(u64),
    Count(u32),
    Flag(bool),
    Interval(u32),
    Version(u32),
    Snapshot(SnapshotRecord),
    SnapshotList {
        records: Vec<SnapshotRecord>,
        next_lsid: Option<u64>,
    },
    SnapshotListFrom {
        records: Vec<SnapshotRecord>,
        next_snapshot_id: Option<u32>,
    },
}

impl Engine {
    /// Executes one control operation.
    pub async fn control(&self, req: ControlRequest) -> Result<ControlResponse> {
        use ControlRequest as Req;
        use ControlResponse as Resp;

        match req {
            Req::GetOldestLsid => Ok(Resp::Lsid(self.shared().lsids.snapshot().oldest.0)),

            Req::SetOldestLsid(lsid) => {
                self.shared().check_writable()?;
                let snap = self.shared().lsids.snapshot();
                let valid = lsid == snap.written.0
                    || (snap.oldest.0 <= lsid
                        && lsid < snap.written.0
                        && self.check_logpack_at(Lsid(lsid)));
                if !valid {
                    return Err(WalrusError::InvalidLsid {
                        lsid,
                        reason: format!(
                            "not a pack header between oldest {} and written {}",
                            snap.oldest, snap.written
                        ),
                    });
                }
                self.shared().lsids.set_oldest(Lsid(lsid))?;
                Ok(Resp::Ok)
            }

            Req::TakeCheckpoint => {
                self.checkpointer().stop();
                let result = self.checkpointer().take_checkpoint();
                self.checkpointer().start();
                result.map(|_| Resp::Ok)
            }

            Req::GetCheckpointInterval => Ok(Resp::Interval(self.checkpointer().interval_ms())),

            Req::SetCheckpointInterval(interval_ms) => {
                self.checkpointer().set_interval_ms(interval_ms)?;
                Ok(Resp::Ok)
            }

            Req::GetWrittenLsid => Ok(Resp::Lsid(self.shared().lsids.snapshot().written.0)),
            Req::GetPermanentLsid => Ok(Resp::Lsid(self.shared().lsids.snapshot().permanent.0)),
            Req::GetCompletedLsid => Ok(Resp::Lsid(self.shared().lsids.snapshot().completed.0)),

            Req::GetLogUsage => {
                let snap = self.shared().lsids.snapshot();
                Ok(Resp::Size(snap.latest.0 - snap.oldest.0))
            }

            Req::GetLogCapacity => Ok(Resp::Size(self.shared().ring.read().size())),

            Req::CreateSnapshot {
                name,
                lsid,
                timestamp,
            } => {
                self.shared().check_writable()?;
                let lsid = if Lsid(lsid).is_valid() {
                    Lsid(lsid)
                } else {
                    self.shared().lsids.snapshot().completed
                };
                let timestamp = if timestamp == 0 {
                    SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0)
                } else {
                    timestamp
                };
                self.latch_on_io(self.shared().snapshots.add(&name, lsid, timestamp))?;
                Ok(Resp::Ok)
            }

            Req::DeleteSnapshot { name } => {
                self.shared().check_writable()?;
                self.latch_on_io(self.shared().snapshots.del(&name))?;
                Ok(Resp::Ok)
            }

            Req::DeleteSnapshotRange { lsid0, lsid1 } => {
                self.shared().check_writable()?;
                let n = self.latch_on_io(
                    self.shared()
                        .snapshots
                        .del_range(Lsid(lsid0), Lsid(lsid1)),
                )?;
                Ok(Resp::Count(n))
            }

            Req::GetSnapshot { name } => {
                Ok(Resp::Snapshot(self.shared().snapshots.get(&name)?))
            }

            Req::NumOfSnapshotRange { lsid0, lsid1 } => Ok(Resp::Count(
                self.shared()
                    .snapshots
                    .n_records_range(Lsid(lsid0), Lsid(lsid1)),
            )),

            Req::ListSnapshotRange { lsid0, lsid1, max } => {
                let (records, next_lsid) =
                    self.shared()
                        .snapshots
                        .list_range(Lsid(lsid0), Lsid(lsid1), max as usize);
                Ok(Resp::SnapshotList { records, next_lsid })
            }

            Req::ListSnapshotFrom { snapshot_id, max } => {
                let (records, next_snapshot_id) = self
                    .shared()
                    .snapshots
                    .list_from(snapshot_id, max as usize);
                Ok(Resp::SnapshotListFrom {
                    records,
                    next_snapshot_id,
                })
            }

            Req::Resize { new_size } => self.resize(new_size).map(|_| Resp::Ok),

            Req::ClearLog => self.clear_log().await.map(|_| Resp::Ok),

            Req::IsLogOverflow => Ok(Resp::Flag(
                self.shared().log_overflow.load(Ordering::Acquire),
            )),

            Req::Freeze { timeout_secs } => {
                self.freeze(timeout_secs).await.map(|_| Resp::Ok)
            }

            Req::IsFrozen => Ok(Resp::Flag(self.is_frozen().await)),

            Req::Melt => self.melt().await.map(|_| Resp::Ok),

            Req::Version => Ok(Resp::Version(FORMAT_VERSION)),
        }
    }

    /// Metadata-write I/O failures are fatal for writes: latch before
    /// surfacing the error.
    fn latch_on_io<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(WalrusError::Io(_)) = &result {
            self.shared()
                .set_read_only("snapshot metadata write failure");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serde_roundtrip() {
        let reqs = vec![
            ControlRequest::GetOldestLsid,
            ControlRequest::SetOldestLsid(42),
            ControlRequest::CreateSnapshot {
                name: "s1".to_string(),
                lsid: 100,
                timestamp: 0,
            },
            ControlRequest::ListSnapshotRange {
                lsid0: 0,
                lsid1: 300,
                max: 10,
            },
            ControlRequest::Freeze { timeout_secs: 30 },
        ];
        for req in reqs {
            let json = serde_json::to_string(&req).unwrap();
            let back: ControlRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(format!("{:?}", req), format!("{:?}", back));
        }
    }

    #[test]
    fn test_response_serde_roundtrip() {
        let resps = vec![
            ControlResponse::Ok,
            ControlResponse::Lsid(7),
            ControlResponse::Count(3),
            ControlResponse::Flag(true),
            ControlResponse::SnapshotList {
                records: vec![],
                next_lsid: Some(40),
            },
        ];
        for resp in resps {
            let json = serde_json::to_string(&resp).unwrap();
            let back: ControlResponse = serde_json::from_str(&json).unwrap();
            assert_eq!(format!("{:?}", resp), format!("{:?}", back));
        }
    }
}

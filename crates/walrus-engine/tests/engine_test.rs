//! End-to-end scenarios against file-backed devices.

use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walrus_block::{FileBlockDevice, SectorIo};
use walrus_common::{EngineConfig, FormatOptions, WalrusError};
use walrus_engine::{ControlRequest, ControlResponse, Engine};
use walrus_wal::read_super;

const SS: u32 = 4096;
const SNAPSHOT_SECTORS: u32 = 8;
// Layout with 4096-byte sectors: reserved page (1), super0 (1),
// snapshot metadata (8), super1 (1) -> ring starts at sector 11.
const RING_OFFSET: u64 = 11;
const RING_SECTORS: u64 = 1024;
const DATA_SECTORS: u64 = 2048;

struct Fixture {
    _dir: TempDir,
    log_path: PathBuf,
    data_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        Self::with_ring(RING_SECTORS)
    }

    fn with_ring(ring_sectors: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.img");
        let data_path = dir.path().join("data.img");

        let log =
            FileBlockDevice::create(&log_path, SS, RING_OFFSET + ring_sectors).unwrap();
        let data = FileBlockDevice::create(&data_path, SS, DATA_SECTORS).unwrap();
        Engine::format(
            Arc::new(log),
            Arc::new(data),
            &FormatOptions {
                name: "test0".to_string(),
                snapshot_metadata_size: SNAPSHOT_SECTORS,
                device_size: None,
            },
        )
        .unwrap();

        Self {
            _dir: dir,
            log_path,
            data_path,
        }
    }

    async fn open(&self) -> Engine {
        self.open_with(EngineConfig::default()).await
    }

    async fn open_with(&self, config: EngineConfig) -> Engine {
        let log = FileBlockDevice::open(&self.log_path, SS).unwrap();
        let data = FileBlockDevice::open(&self.data_path, SS).unwrap();
        Engine::open(Arc::new(log), Arc::new(data), config)
            .await
            .unwrap()
    }

    /// Opens the pipeline with a checkpoint interval long enough that
    /// no checkpoint fires during the test (crash simulation).
    async fn open_no_checkpoint(&self) -> Engine {
        self.open_with(EngineConfig {
            checkpoint_interval_ms: 3_600_000,
            ..Default::default()
        })
        .await
    }

    fn log_io(&self) -> SectorIo {
        SectorIo::new(Arc::new(FileBlockDevice::open(&self.log_path, SS).unwrap()))
    }
}

fn sector_data(fill: u8, sectors: usize) -> Bytes {
    Bytes::from(vec![fill; SS as usize * sectors])
}

async fn ctl(engine: &Engine, req: ControlRequest) -> ControlResponse {
    engine.control(req).await.unwrap()
}

async fn ctl_u64(engine: &Engine, req: ControlRequest) -> u64 {
    match ctl(engine, req).await {
        ControlResponse::Lsid(v) | ControlResponse::Size(v) => v,
        other => panic!("expected numeric response, got {:?}", other),
    }
}

async fn wait_written(engine: &Engine, at_least: u64) {
    for _ in 0..500 {
        if ctl_u64(engine, ControlRequest::GetWrittenLsid).await >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("written lsid never reached {}", at_least);
}

fn zero_range(path: &Path, byte_offset: u64, len: usize) {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap();
    file.seek(SeekFrom::Start(byte_offset)).unwrap();
    file.write_all(&vec![0u8; len]).unwrap();
    file.sync_all().unwrap();
}

fn corrupt_byte(path: &Path, byte_offset: u64) {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    let mut b = [0u8; 1];
    file.seek(SeekFrom::Start(byte_offset)).unwrap();
    file.read_exact(&mut b).unwrap();
    b[0] ^= 0x01;
    file.seek(SeekFrom::Start(byte_offset)).unwrap();
    file.write_all(&b).unwrap();
    file.sync_all().unwrap();
}

// S1: fresh init.
#[tokio::test]
async fn test_fresh_init() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    assert_eq!(ctl_u64(&engine, ControlRequest::GetOldestLsid).await, 0);
    assert_eq!(ctl_u64(&engine, ControlRequest::GetWrittenLsid).await, 0);
    assert_eq!(ctl_u64(&engine, ControlRequest::GetLogUsage).await, 0);
    assert_eq!(
        ctl_u64(&engine, ControlRequest::GetLogCapacity).await,
        RING_SECTORS
    );
    assert_eq!(engine.capacity_sectors(), DATA_SECTORS);

    match ctl(
        &engine,
        ControlRequest::ListSnapshotFrom {
            snapshot_id: 0,
            max: 10,
        },
    )
    .await
    {
        ControlResponse::SnapshotListFrom {
            records,
            next_snapshot_id,
        } => {
            assert!(records.is_empty());
            assert!(next_snapshot_id.is_none());
        }
        other => panic!("unexpected response {:?}", other),
    }

    match ctl(&engine, ControlRequest::Version).await {
        ControlResponse::Version(v) => assert_eq!(v, 1),
        other => panic!("unexpected response {:?}", other),
    }

    engine.shutdown().await.unwrap();
}

// S2: a single acknowledged write survives a crash via redo.
#[tokio::test]
async fn test_write_crash_redo() {
    let fx = Fixture::new();
    {
        let engine = fx.open_no_checkpoint().await;
        engine.write(1000, sector_data(0xAB, 8)).await.unwrap();
        // Crash: drop the engine without shutdown or checkpoint.
        drop(engine);
    }

    let engine = fx.open_no_checkpoint().await;
    // Redo replayed the pack: header + 8 payload sectors.
    assert_eq!(ctl_u64(&engine, ControlRequest::GetWrittenLsid).await, 9);

    let read = engine.read(1000, 8).unwrap();
    assert!(read.iter().all(|&b| b == 0xAB));
    engine.shutdown().await.unwrap();
}

// S3: a torn tail pack is truncated; a second redo is a no-op.
#[tokio::test]
async fn test_partial_tail_truncated() {
    let fx = Fixture::new();
    {
        let engine = fx.open_no_checkpoint().await;
        engine.write(100, sector_data(0x11, 8)).await.unwrap();
        engine.write(200, sector_data(0x22, 4)).await.unwrap();
        drop(engine);
    }

    // Simulate a crash during the second pack's log write: its payload
    // is torn in the log (one flipped bit) and never reached the data
    // device.
    corrupt_byte(&fx.log_path, (RING_OFFSET + 10) * SS as u64 + 123);
    zero_range(&fx.data_path, 200 * SS as u64, 4 * SS as usize);

    {
        let engine = fx.open_no_checkpoint().await;
        // Pack 1 applied, pack 2 dropped entirely (its only record is torn).
        assert_eq!(ctl_u64(&engine, ControlRequest::GetWrittenLsid).await, 9);
        assert!(engine.read(100, 8).unwrap().iter().all(|&b| b == 0x11));
        assert!(engine.read(200, 4).unwrap().iter().all(|&b| b == 0));
        drop(engine);
    }

    // Idempotence: another restart lands at the same boundary.
    let engine = fx.open_no_checkpoint().await;
    assert_eq!(ctl_u64(&engine, ControlRequest::GetWrittenLsid).await, 9);
    engine.shutdown().await.unwrap();
}

// S4: snapshot lifecycle.
#[tokio::test]
async fn test_snapshot_lifecycle() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    for (name, lsid) in [("s1", 100), ("s2", 200)] {
        ctl(
            &engine,
            ControlRequest::CreateSnapshot {
                name: name.to_string(),
                lsid,
                timestamp: 1234,
            },
        )
        .await;
    }

    match ctl(
        &engine,
        ControlRequest::ListSnapshotRange {
            lsid0: 0,
            lsid1: 300,
            max: 10,
        },
    )
    .await
    {
        ControlResponse::SnapshotList { records, next_lsid } => {
            assert!(next_lsid.is_none());
            let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
            assert_eq!(names, vec!["s1", "s2"]);
            assert_eq!(records[0].lsid.0, 100);
            assert_eq!(records[1].lsid.0, 200);
        }
        other => panic!("unexpected response {:?}", other),
    }

    match ctl(
        &engine,
        ControlRequest::NumOfSnapshotRange {
            lsid0: 150,
            lsid1: 250,
        },
    )
    .await
    {
        ControlResponse::Count(n) => assert_eq!(n, 1),
        other => panic!("unexpected response {:?}", other),
    }

    match ctl(
        &engine,
        ControlRequest::DeleteSnapshotRange {
            lsid0: 150,
            lsid1: 250,
        },
    )
    .await
    {
        ControlResponse::Count(n) => assert_eq!(n, 1),
        other => panic!("unexpected response {:?}", other),
    }

    match ctl(
        &engine,
        ControlRequest::GetSnapshot {
            name: "s1".to_string(),
        },
    )
    .await
    {
        ControlResponse::Snapshot(r) => {
            assert_eq!(r.lsid.0, 100);
            assert_eq!(r.timestamp, 1234);
        }
        other => panic!("unexpected response {:?}", other),
    }
    assert!(matches!(
        engine
            .control(ControlRequest::GetSnapshot {
                name: "s2".to_string()
            })
            .await,
        Err(WalrusError::NotFound(_))
    ));

    // Duplicate names conflict.
    assert!(matches!(
        engine
            .control(ControlRequest::CreateSnapshot {
                name: "s1".to_string(),
                lsid: 150,
                timestamp: 0,
            })
            .await,
        Err(WalrusError::NameConflict(_))
    ));

    engine.shutdown().await.unwrap();
}

// S4 continued: snapshots survive restart.
#[tokio::test]
async fn test_snapshots_persist() {
    let fx = Fixture::new();
    {
        let engine = fx.open().await;
        ctl(
            &engine,
            ControlRequest::CreateSnapshot {
                name: "durable".to_string(),
                lsid: 77,
                timestamp: 4242,
            },
        )
        .await;
        engine.shutdown().await.unwrap();
    }

    let engine = fx.open().await;
    match ctl(
        &engine,
        ControlRequest::GetSnapshot {
            name: "durable".to_string(),
        },
    )
    .await
    {
        ControlResponse::Snapshot(r) => {
            assert_eq!(r.lsid.0, 77);
            assert_eq!(r.timestamp, 4242);
        }
        other => panic!("unexpected response {:?}", other),
    }
    engine.shutdown().await.unwrap();
}

// S5: freeze with timeout blocks a write until the auto-melt.
#[tokio::test]
async fn test_freeze_timeout() {
    let fx = Fixture::new();
    let engine = Arc::new(fx.open().await);

    ctl(&engine, ControlRequest::Freeze { timeout_secs: 2 }).await;
    match ctl(&engine, ControlRequest::IsFrozen).await {
        ControlResponse::Flag(frozen) => assert!(frozen),
        other => panic!("unexpected response {:?}", other),
    }

    // Reads pass through the freeze.
    engine.read(0, 1).unwrap();

    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.write(0, sector_data(0x55, 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!writer.is_finished());

    // The timer melts the device and the write completes.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    writer.await.unwrap().unwrap();
    match ctl(&engine, ControlRequest::IsFrozen).await {
        ControlResponse::Flag(frozen) => assert!(!frozen),
        other => panic!("unexpected response {:?}", other),
    }

    engine.shutdown().await.unwrap();
}

// Explicit freeze/melt, idempotent melt, and cancel-by-freeze.
#[tokio::test]
async fn test_freeze_melt_explicit() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    ctl(&engine, ControlRequest::Freeze { timeout_secs: 3600 }).await;
    // An explicit freeze without timeout cancels the pending melt.
    ctl(&engine, ControlRequest::Freeze { timeout_secs: 0 }).await;
    assert!(engine.is_frozen().await);

    ctl(&engine, ControlRequest::Melt).await;
    assert!(!engine.is_frozen().await);
    ctl(&engine, ControlRequest::Melt).await;

    engine.write(0, sector_data(9, 1)).await.unwrap();
    engine.shutdown().await.unwrap();
}

// S6: clear log rotates uuid and salt and resets the lsid set.
#[tokio::test]
async fn test_clear_log() {
    let fx = Fixture::new();
    let before = read_super(&fx.log_io()).unwrap();

    let engine = fx.open_no_checkpoint().await;
    engine.write(1000, sector_data(0xAB, 8)).await.unwrap();
    assert_eq!(ctl_u64(&engine, ControlRequest::GetLogUsage).await, 9);

    ctl(&engine, ControlRequest::ClearLog).await;
    assert_eq!(ctl_u64(&engine, ControlRequest::GetOldestLsid).await, 0);
    assert_eq!(ctl_u64(&engine, ControlRequest::GetWrittenLsid).await, 0);
    assert_eq!(ctl_u64(&engine, ControlRequest::GetLogUsage).await, 0);
    match ctl(&engine, ControlRequest::IsLogOverflow).await {
        ControlResponse::Flag(v) => assert!(!v),
        other => panic!("unexpected response {:?}", other),
    }
    assert!(!engine.is_frozen().await);

    // The device keeps working in the new epoch.
    engine.write(500, sector_data(0x33, 2)).await.unwrap();
    engine.shutdown().await.unwrap();

    let after = read_super(&fx.log_io()).unwrap();
    assert_ne!(before.uuid, after.uuid);
    assert_ne!(before.log_checksum_salt, after.log_checksum_salt);
    assert_eq!(after.oldest_lsid.0, 0);
}

// Ring overflow latches read-only until clear-log.
#[tokio::test]
async fn test_log_overflow_sticky() {
    let fx = Fixture::with_ring(16);
    let engine = fx.open_no_checkpoint().await;

    // Each 8-sector write makes a 9-sector pack; the second one
    // cannot fit a 16-sector ring.
    engine.write(0, sector_data(1, 8)).await.unwrap();
    let err = engine.write(8, sector_data(2, 8)).await.unwrap_err();
    assert!(matches!(err, WalrusError::LogOverflow));

    match ctl(&engine, ControlRequest::IsLogOverflow).await {
        ControlResponse::Flag(v) => assert!(v),
        other => panic!("unexpected response {:?}", other),
    }
    assert!(matches!(
        engine.write(16, sector_data(3, 1)).await.unwrap_err(),
        WalrusError::ReadOnly
    ));
    // Snapshot mutations are refused too.
    assert!(matches!(
        engine
            .control(ControlRequest::CreateSnapshot {
                name: "s".to_string(),
                lsid: 0,
                timestamp: 0,
            })
            .await
            .unwrap_err(),
        WalrusError::ReadOnly
    ));

    // Clear-log is the way out.
    ctl(&engine, ControlRequest::ClearLog).await;
    match ctl(&engine, ControlRequest::IsLogOverflow).await {
        ControlResponse::Flag(v) => assert!(!v),
        other => panic!("unexpected response {:?}", other),
    }
    engine.write(16, sector_data(3, 1)).await.unwrap();
    engine.shutdown().await.unwrap();
}

// SET_OLDEST_LSID accepts pack boundaries and the written lsid only.
#[tokio::test]
async fn test_set_oldest_lsid() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    engine.write(0, sector_data(1, 8)).await.unwrap();
    engine.write(100, sector_data(2, 8)).await.unwrap();
    wait_written(&engine, 18).await;
    assert_eq!(ctl_u64(&engine, ControlRequest::GetLogUsage).await, 18);

    // Lsid 9 is the second pack's header.
    ctl(&engine, ControlRequest::SetOldestLsid(9)).await;
    assert_eq!(ctl_u64(&engine, ControlRequest::GetOldestLsid).await, 9);
    assert_eq!(ctl_u64(&engine, ControlRequest::GetLogUsage).await, 9);

    // Mid-pack lsids are rejected.
    assert!(matches!(
        engine
            .control(ControlRequest::SetOldestLsid(12))
            .await
            .unwrap_err(),
        WalrusError::InvalidLsid { .. }
    ));

    // The written lsid itself is always acceptable.
    ctl(&engine, ControlRequest::SetOldestLsid(18)).await;
    assert_eq!(ctl_u64(&engine, ControlRequest::GetOldestLsid).await, 18);

    engine.shutdown().await.unwrap();
}

// Discards are logged, applied, and zero the data range.
#[tokio::test]
async fn test_discard() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    engine.write(10, sector_data(0x5A, 4)).await.unwrap();
    wait_written(&engine, 5).await;
    assert!(engine.read(10, 4).unwrap().iter().all(|&b| b == 0x5A));

    engine.discard(10, 4).await.unwrap();
    wait_written(&engine, 10).await;
    assert!(engine.read(10, 4).unwrap().iter().all(|&b| b == 0));

    engine.shutdown().await.unwrap();
}

// Without FUA the engine falls back to the explicit flush discipline.
#[tokio::test]
async fn test_non_fua_flush_discipline() {
    let fx = Fixture::new();
    let log = FileBlockDevice::open(&fx.log_path, SS).unwrap().without_fua();
    let data = FileBlockDevice::open(&fx.data_path, SS).unwrap();
    let engine = Engine::open(Arc::new(log), Arc::new(data), EngineConfig::default())
        .await
        .unwrap();

    engine.write(0, sector_data(7, 8)).await.unwrap();
    // The ack itself implies the pack is permanent.
    assert_eq!(ctl_u64(&engine, ControlRequest::GetPermanentLsid).await, 9);
    assert_eq!(ctl_u64(&engine, ControlRequest::GetCompletedLsid).await, 9);

    engine.flush().await.unwrap();
    engine.shutdown().await.unwrap();
}

// TAKE_CHECKPOINT persists written_lsid so redo has nothing to do.
#[tokio::test]
async fn test_take_checkpoint() {
    let fx = Fixture::new();
    {
        let engine = fx.open_no_checkpoint().await;
        engine.write(50, sector_data(0xEE, 8)).await.unwrap();
        wait_written(&engine, 9).await;
        ctl(&engine, ControlRequest::TakeCheckpoint).await;
        drop(engine);
    }

    // The super already carries written=9; redo starts there.
    let sup = read_super(&fx.log_io()).unwrap();
    assert_eq!(sup.written_lsid.0, 9);

    let engine = fx.open_no_checkpoint().await;
    assert_eq!(ctl_u64(&engine, ControlRequest::GetWrittenLsid).await, 9);
    assert!(engine.read(50, 8).unwrap().iter().all(|&b| b == 0xEE));
    engine.shutdown().await.unwrap();
}

// Checkpoint interval is clamped and queryable.
#[tokio::test]
async fn test_checkpoint_interval() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    ctl(&engine, ControlRequest::SetCheckpointInterval(500)).await;
    match ctl(&engine, ControlRequest::GetCheckpointInterval).await {
        ControlResponse::Interval(ms) => assert_eq!(ms, 500),
        other => panic!("unexpected response {:?}", other),
    }
    assert!(engine
        .control(ControlRequest::SetCheckpointInterval(0))
        .await
        .is_err());
    assert!(engine
        .control(ControlRequest::SetCheckpointInterval(u32::MAX))
        .await
        .is_err());

    engine.shutdown().await.unwrap();
}

// RESIZE grows the exposed device, never shrinks it.
#[tokio::test]
async fn test_resize() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("log.img");
    let data_path = dir.path().join("data.img");
    let log = FileBlockDevice::create(&log_path, SS, RING_OFFSET + RING_SECTORS).unwrap();
    let data = FileBlockDevice::create(&data_path, SS, DATA_SECTORS).unwrap();
    Engine::format(
        Arc::new(log),
        Arc::new(data),
        &FormatOptions {
            name: "resize-test".to_string(),
            snapshot_metadata_size: SNAPSHOT_SECTORS,
            device_size: Some(1024),
        },
    )
    .unwrap();

    let log = FileBlockDevice::open(&log_path, SS).unwrap();
    let data = FileBlockDevice::open(&data_path, SS).unwrap();
    let engine = Engine::open(Arc::new(log), Arc::new(data), EngineConfig::default())
        .await
        .unwrap();

    assert_eq!(engine.capacity_sectors(), 1024);
    assert!(engine.write(1500, sector_data(1, 1)).await.is_err());

    ctl(&engine, ControlRequest::Resize { new_size: 1600 }).await;
    assert_eq!(engine.capacity_sectors(), 1600);
    engine.write(1500, sector_data(1, 1)).await.unwrap();

    // Shrink is refused; zero grows to the data device size.
    assert!(engine
        .control(ControlRequest::Resize { new_size: 1024 })
        .await
        .is_err());
    ctl(&engine, ControlRequest::Resize { new_size: 0 }).await;
    assert_eq!(engine.capacity_sectors(), DATA_SECTORS);

    // Beyond the data device is refused.
    assert!(engine
        .control(ControlRequest::Resize {
            new_size: DATA_SECTORS + 1
        })
        .await
        .is_err());

    engine.shutdown().await.unwrap();
}

// Consecutive packs chain: next pack lsid = previous + its size.
#[tokio::test]
async fn test_lsid_accounting_across_writes() {
    let fx = Fixture::new();
    let engine = fx.open().await;

    engine.write(0, sector_data(1, 2)).await.unwrap();
    engine.write(10, sector_data(2, 3)).await.unwrap();
    engine.write(20, sector_data(3, 1)).await.unwrap();
    // Packs of 3, 4 and 2 sectors.
    assert_eq!(ctl_u64(&engine, ControlRequest::GetLogUsage).await, 9);
    wait_written(&engine, 9).await;

    assert!(engine.read(0, 2).unwrap().iter().all(|&b| b == 1));
    assert!(engine.read(10, 3).unwrap().iter().all(|&b| b == 2));
    assert!(engine.read(20, 1).unwrap().iter().all(|&b| b == 3));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reject_unaligned_write() {
    let fx = Fixture::new();
    let engine = fx.open().await;
    let err = engine
        .write(0, Bytes::from(vec![0u8; 100]))
        .await
        .unwrap_err();
    assert!(matches!(err, WalrusError::InvalidArgument(_)));
    assert!(engine.read(0, 0).is_err());
    engine.shutdown().await.unwrap();
}

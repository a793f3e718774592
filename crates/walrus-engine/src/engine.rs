//! The engine facade: owns the two devices and every subsystem.

use crate::checkpoint::Checkpointer;
use crate::iocore::{drain_data, wait_melted, IoCore, PackMsg};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;
use walrus_block::{BlockDevice, SectorIo};
use walrus_common::config::MAX_FREEZE_TIMEOUT_SECS;
use walrus_common::{EngineConfig, FormatOptions, Lsid, LsidSet, LsidState, Result, WalrusError};
use walrus_wal::constants::{FORMAT_VERSION, PAGE_SIZE};
use walrus_wal::logpack::LogPackHeader;
use walrus_wal::ring::RingAllocator;
use walrus_wal::{redo, PackIo, SnapshotStore, SuperBlock, SuperSector};

/// State shared between the engine facade and its tasks.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) log: SectorIo,
    pub(crate) data: SectorIo,
    pub(crate) lsids: LsidState,
    pub(crate) super_block: SuperBlock,
    pub(crate) ring: RwLock<RingAllocator>,
    pub(crate) salt: AtomicU32,
    pub(crate) read_only: AtomicBool,
    pub(crate) log_overflow: AtomicBool,
    /// Exposed capacity in sectors, under `size_lock`.
    pub(crate) size: Mutex<u64>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) pending_data_bytes: AtomicU64,
    pub(crate) pending_notify: Notify,
}

impl EngineShared {
    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Latches the read-only flag; mutations fail from here on.
    pub(crate) fn set_read_only(&self, why: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            tracing::error!(why, "engine latched read-only");
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(WalrusError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Snapshots the LSID set, then persists `oldest`/`written` into
    /// the super. The LSID lock is released before the super lock is
    /// taken.
    pub(crate) fn sync_super(&self) -> Result<()> {
        let snap = self.lsids.snapshot();
        self.super_block.sync(snap.oldest, snap.written)?;
        self.lsids.set_prev_written(snap.written)?;
        Ok(())
    }
}

/// Freeze state machine; every transition happens under the lock.
pub(crate) enum FreezeState {
    Melted,
    Frozen,
    FrozenWithTimeout { timer: JoinHandle<()> },
}

pub(crate) struct FreezeCtl {
    pub(crate) state: tokio::sync::Mutex<FreezeState>,
    /// Gate observed by the pack stage and the write entry points.
    pub(crate) gate: watch::Sender<bool>,
}

/// A Walrus device: a virtual block device whose writes are logged to
/// the log device before being applied to the data device.
pub struct Engine {
    shared: Arc<EngineShared>,
    iocore: IoCore,
    checkpointer: Arc<Checkpointer>,
    freeze: Arc<FreezeCtl>,
}

impl Engine {
    /// Formats the device pair: writes the super mirrors, empty
    /// snapshot metadata and an invalidated first log pack slot.
    pub fn format(
        log: Arc<dyn BlockDevice>,
        data: Arc<dyn BlockDevice>,
        opts: &FormatOptions,
    ) -> Result<()> {
        let log_io = SectorIo::new(log);
        let data_io = SectorIo::new(data);
        let sector_size = check_sector_sizes(&log_io, &data_io)?;

        let metadata_offset = SuperSector::metadata_offset_for(sector_size);
        let ring_offset = metadata_offset + opts.snapshot_metadata_size as u64 + 1;
        let log_sectors = log_io.size_sectors();
        if log_sectors <= ring_offset {
            return Err(WalrusError::InvalidArgument(format!(
                "log device of {} sectors leaves no ring space",
                log_sectors
            )));
        }

        let device_size = opts.device_size.unwrap_or_else(|| data_io.size_sectors());
        if device_size == 0 || device_size > data_io.size_sectors() {
            return Err(WalrusError::InvalidArgument(format!(
                "exposed size {} exceeds data device capacity {}",
                device_size,
                data_io.size_sectors()
            )));
        }

        let image = SuperSector {
            version: FORMAT_VERSION,
            sector_size,
            snapshot_metadata_size: opts.snapshot_metadata_size,
            log_checksum_salt: rand::random(),
            uuid: Uuid::new_v4(),
            name: opts.name.clone(),
            ring_buffer_size: log_sectors - ring_offset,
            oldest_lsid: Lsid(0),
            written_lsid: Lsid(0),
            device_size,
        };

        SnapshotStore::format(&log_io, metadata_offset, opts.snapshot_metadata_size)?;
        SuperBlock::format(log_io.clone(), image.clone())?;
        // Make sure the slot at LSID 0 never parses as a pack.
        log_io.zero_sector(image.ring().offset_of(Lsid(0)))?;
        log_io.flush()?;

        tracing::info!(
            name = %image.name,
            uuid = %image.uuid,
            ring = image.ring_buffer_size,
            device_size,
            "device formatted"
        );
        Ok(())
    }

    /// Opens a formatted device pair: loads the super, redoes the
    /// unapplied log tail, then starts the pipeline and checkpointing.
    pub async fn open(
        log: Arc<dyn BlockDevice>,
        data: Arc<dyn BlockDevice>,
        config: EngineConfig,
    ) -> Result<Engine> {
        let log_io = SectorIo::new(log);
        let data_io = SectorIo::new(data);
        check_sector_sizes(&log_io, &data_io)?;

        let super_block = SuperBlock::read(log_io.clone())?;
        let image = super_block.image();
        if image.sector_size as usize != log_io.sector_size() {
            return Err(WalrusError::InvalidArgument(format!(
                "super sector_size {} does not match device {}",
                image.sector_size,
                log_io.sector_size()
            )));
        }
        if image.device_size > data_io.size_sectors() {
            return Err(WalrusError::InvalidArgument(format!(
                "exposed size {} exceeds data device capacity {}",
                image.device_size,
                data_io.size_sectors()
            )));
        }

        let report = redo(&log_io, &data_io, &image)?;
        let end = report.end_lsid;
        super_block.update(|s| s.written_lsid = end);

        let lsids = LsidState::new(LsidSet {
            oldest: image.oldest_lsid,
            prev_written: end,
            written: end,
            permanent: end,
            completed: end,
            flush: end,
            latest: end,
        })?;

        let snapshots = SnapshotStore::load(
            log_io.clone(),
            image.metadata_offset(),
            image.snapshot_metadata_size,
        )?;

        let shared = Arc::new(EngineShared {
            config: config.clone(),
            log: log_io,
            data: data_io,
            lsids,
            super_block,
            ring: RwLock::new(image.ring()),
            salt: AtomicU32::new(image.log_checksum_salt),
            read_only: AtomicBool::new(false),
            log_overflow: AtomicBool::new(false),
            size: Mutex::new(image.device_size),
            snapshots,
            pending_data_bytes: AtomicU64::new(0),
            pending_notify: Notify::new(),
        });
        shared.sync_super()?;

        let (gate_tx, gate_rx) = watch::channel(false);
        let iocore = IoCore::spawn(shared.clone(), gate_rx);
        let checkpointer = Arc::new(Checkpointer::new(
            shared.clone(),
            config.checkpoint_interval_ms,
        ));
        checkpointer.start();

        tracing::info!(
            name = %image.name,
            uuid = %image.uuid,
            written = end.0,
            "engine opened"
        );
        Ok(Engine {
            shared,
            iocore,
            checkpointer,
            freeze: Arc::new(FreezeCtl {
                state: tokio::sync::Mutex::new(FreezeState::Melted),
                gate: gate_tx,
            }),
        })
    }

    /// Exposed capacity in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        *self.shared.size.lock()
    }

    /// Reads sectors from the data device. Reads bypass the freeze
    /// gate and are allowed on a read-only engine.
    pub fn read(&self, offset: u64, n_sectors: u64) -> Result<Bytes> {
        if n_sectors == 0 {
            return Err(WalrusError::InvalidArgument("empty read".to_string()));
        }
        self.check_bounds(offset, n_sectors)?;
        self.shared.data.read_sectors(offset, n_sectors)
    }

    /// Writes whole sectors. Resolves once the write is permanent in
    /// the log; the data-device copy follows asynchronously.
    pub async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.shared.check_writable()?;
        let sector_size = self.shared.data.sector_size();
        if data.is_empty() || data.len() % sector_size != 0 {
            return Err(WalrusError::InvalidArgument(format!(
                "write length {} is not a positive multiple of sector size {}",
                data.len(),
                sector_size
            )));
        }
        let n_sectors = (data.len() / sector_size) as u64;
        self.check_bounds(offset, n_sectors)?;
        self.check_ring_fit(n_sectors)?;

        self.wait_melted_gate().await;
        self.wait_pending_below().await?;
        self.submit(PackIo::Write { offset, data }).await
    }

    /// Discards a sector range. Logged like a write, no payload.
    pub async fn discard(&self, offset: u64, n_sectors: u64) -> Result<()> {
        self.shared.check_writable()?;
        if n_sectors == 0 {
            return Err(WalrusError::InvalidArgument("empty discard".to_string()));
        }
        self.check_bounds(offset, n_sectors)?;
        self.check_ring_fit(n_sectors)?;

        self.wait_melted_gate().await;
        self.wait_pending_below().await?;
        self.submit(PackIo::Discard {
            offset,
            n_sectors: n_sectors as u32,
        })
        .await
    }

    /// Flush barrier: resolves once every previously accepted write is
    /// permanent.
    pub async fn flush(&self) -> Result<()> {
        self.shared.check_writable()?;
        self.wait_melted_gate().await;
        let (tx, rx) = oneshot::channel();
        self.iocore
            .pack_tx
            .send(PackMsg::Flush { ack: Some(tx) })
            .map_err(|_| WalrusError::ReadOnly)?;
        rx.await.map_err(|_| WalrusError::ReadOnly)?
    }

    async fn submit(&self, io: PackIo) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.iocore
            .pack_tx
            .send(PackMsg::Io { io, ack: tx })
            .map_err(|_| WalrusError::ReadOnly)?;
        rx.await.map_err(|_| WalrusError::ReadOnly)?
    }

    fn check_bounds(&self, offset: u64, n_sectors: u64) -> Result<()> {
        let size = *self.shared.size.lock();
        if offset.checked_add(n_sectors).map_or(true, |end| end > size) {
            return Err(WalrusError::InvalidArgument(format!(
                "sector range {}+{} beyond device size {}",
                offset, n_sectors, size
            )));
        }
        Ok(())
    }

    fn check_ring_fit(&self, n_sectors: u64) -> Result<()> {
        let ring_size = self.shared.ring.read().size();
        if n_sectors + 1 > ring_size {
            return Err(WalrusError::InvalidArgument(format!(
                "{}-sector request can never fit a {}-sector ring",
                n_sectors, ring_size
            )));
        }
        Ok(())
    }

    async fn wait_melted_gate(&self) {
        let mut gate = self.freeze.gate.subscribe();
        wait_melted(&mut gate).await;
    }

    /// Back-pressure: waits for the data stage to fall below the low
    /// watermark, latching read-only if it stays stalled.
    async fn wait_pending_below(&self) -> Result<()> {
        let shared = &self.shared;
        let max = (shared.config.max_pending_mb as u64) << 20;
        let min = (shared.config.min_pending_mb as u64) << 20;
        if shared.pending_data_bytes.load(Ordering::Acquire) <= max {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(shared.config.queue_stop_timeout_ms);
        loop {
            let notified = shared.pending_notify.notified();
            if shared.pending_data_bytes.load(Ordering::Acquire) <= min {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                shared.set_read_only("data queue stalled past timeout");
                return Err(WalrusError::Busy("write queue stalled".to_string()));
            }
        }
    }

    /// Freezes the device: writes and discards block until melt, the
    /// pack stage and checkpointing pause, in-flight data drains.
    /// A non-zero timeout schedules an automatic melt.
    pub async fn freeze(&self, timeout_secs: u32) -> Result<()> {
        let timeout_secs = timeout_secs.min(MAX_FREEZE_TIMEOUT_SECS);
        self.cancel_melt_timer().await;

        let mut state = self.freeze.state.lock().await;
        if matches!(*state, FreezeState::Melted) {
            self.freeze.gate.send_replace(true);
            self.checkpointer.stop();
            drain_data(&self.shared).await;
            *state = FreezeState::Frozen;
            tracing::info!("device frozen");
        }

        if timeout_secs > 0 {
            let freeze = Arc::clone(&self.freeze);
            let checkpointer = Arc::clone(&self.checkpointer);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout_secs as u64)).await;
                let mut state = freeze.state.lock().await;
                if matches!(*state, FreezeState::FrozenWithTimeout { .. }) {
                    checkpointer.start();
                    freeze.gate.send_replace(false);
                    *state = FreezeState::Melted;
                    tracing::info!(timeout_secs, "freeze timeout elapsed, melted");
                }
            });
            *state = FreezeState::FrozenWithTimeout { timer };
        }
        Ok(())
    }

    /// Melts a frozen device; idempotent.
    pub async fn melt(&self) -> Result<()> {
        self.cancel_melt_timer().await;
        let mut state = self.freeze.state.lock().await;
        if matches!(*state, FreezeState::Frozen) {
            self.checkpointer.start();
            self.freeze.gate.send_replace(false);
            *state = FreezeState::Melted;
            tracing::info!("device melted");
        }
        Ok(())
    }

    /// True while writes are blocked.
    pub async fn is_frozen(&self) -> bool {
        !matches!(*self.freeze.state.lock().await, FreezeState::Melted)
    }

    /// Cancels a scheduled auto-melt, leaving the device plain-frozen.
    /// Idempotent.
    async fn cancel_melt_timer(&self) {
        let mut state = self.freeze.state.lock().await;
        if matches!(*state, FreezeState::FrozenWithTimeout { .. }) {
            if let FreezeState::FrozenWithTimeout { timer } =
                std::mem::replace(&mut *state, FreezeState::Frozen)
            {
                timer.abort();
            }
        }
    }

    /// Grows the exposed device. `new_size == 0` means "to the data
    /// device capacity"; shrinking is not supported.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        self.shared.check_writable()?;
        let data_size = self.shared.data.refresh_size()?;
        let new_size = if new_size == 0 { data_size } else { new_size };

        let old_size = *self.shared.size.lock();
        if new_size < old_size {
            return Err(WalrusError::InvalidArgument(format!(
                "shrink from {} to {} sectors is not supported",
                old_size, new_size
            )));
        }
        if new_size > data_size {
            return Err(WalrusError::InvalidArgument(format!(
                "new size {} exceeds data device capacity {}",
                new_size, data_size
            )));
        }
        if new_size == old_size {
            return Ok(());
        }

        *self.shared.size.lock() = new_size;
        self.shared.super_block.update(|s| s.device_size = new_size);
        if let Err(e) = self.shared.sync_super() {
            self.shared.set_read_only("superblock sync failure");
            return Err(e);
        }
        tracing::info!(old_size, new_size, "device resized");
        Ok(())
    }

    /// Clears the whole log: resets every LSID to zero, rotates the
    /// UUID and checksum salt, drops all snapshots and the overflow
    /// latch. Runs frozen; melts on the way out.
    pub async fn clear_log(&self) -> Result<()> {
        self.freeze(0).await?;
        let result = self.clear_log_frozen();
        self.melt().await?;
        result
    }

    fn clear_log_frozen(&self) -> Result<()> {
        let shared = &self.shared;
        let saved_lsids = shared.lsids.snapshot();
        let saved_ring = *shared.ring.read();
        let saved_salt = shared.salt.load(Ordering::Acquire);
        let saved_image = shared.super_block.image();

        shared.lsids.reset(Lsid(0));

        let restore = |err: WalrusError| {
            shared.lsids.restore(saved_lsids);
            *shared.ring.write() = saved_ring;
            shared.salt.store(saved_salt, Ordering::Release);
            shared.super_block.restore(saved_image.clone());
            shared.set_read_only("clear log failed");
            err
        };

        // The log device may have grown since format.
        let log_sectors = shared.log.refresh_size().map_err(restore)?;
        let ring_offset = saved_ring.offset();
        if log_sectors <= ring_offset {
            return Err(restore(WalrusError::InvalidArgument(
                "log device shrink is not supported".to_string(),
            )));
        }
        let new_ring_size = log_sectors - ring_offset;
        if new_ring_size > saved_ring.size() {
            tracing::info!(
                old = saved_ring.size(),
                new = new_ring_size,
                "log device growth detected"
            );
        }

        let new_salt: u32 = rand::random();
        let new_uuid = Uuid::new_v4();
        let new_ring = RingAllocator::new(ring_offset, new_ring_size);
        *shared.ring.write() = new_ring;
        shared.salt.store(new_salt, Ordering::Release);
        shared.super_block.update(|s| {
            s.uuid = new_uuid;
            s.log_checksum_salt = new_salt;
            s.ring_buffer_size = new_ring_size;
            s.oldest_lsid = Lsid(0);
            s.written_lsid = Lsid(0);
        });
        shared.super_block.write().map_err(restore)?;

        // Invalidate the slot at LSID 0 so the old epoch is dead even
        // if its first pack happened to sit there.
        shared
            .log
            .zero_sector(new_ring.offset_of(Lsid(0)))
            .map_err(restore)?;
        shared.log.flush().map_err(restore)?;

        shared
            .snapshots
            .del_range(Lsid(0), Lsid(u64::MAX))
            .map_err(restore)?;

        shared.log_overflow.store(false, Ordering::Release);
        shared.read_only.store(false, Ordering::Release);
        tracing::info!(uuid = %new_uuid, ring = new_ring_size, "log cleared");
        Ok(())
    }

    /// True if a log-pack header with this exact LSID sits in the ring.
    pub(crate) fn check_logpack_at(&self, lsid: Lsid) -> bool {
        let ring = *self.shared.ring.read();
        let salt = self.shared.salt.load(Ordering::Acquire);
        match self.shared.log.read_sector(ring.offset_of(lsid)) {
            Ok(buf) => LogPackHeader::decode(&buf, salt)
                .map(|h| h.logpack_lsid == lsid)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub(crate) fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    /// Stops the pipeline and checkpointing, then takes a final
    /// checkpoint. The engine is unusable afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.melt().await?;
        self.checkpointer.stop();
        self.iocore.shutdown().await;
        if !self.shared.is_read_only() {
            self.shared.data.flush()?;
            self.shared.sync_super()?;
        }
        tracing::info!("engine shut down");
        Ok(())
    }
}

fn check_sector_sizes(log: &SectorIo, data: &SectorIo) -> Result<u32> {
    let sector_size = log.sector_size();
    if sector_size != data.sector_size() {
        return Err(WalrusError::InvalidArgument(format!(
            "log sector size {} differs from data sector size {}",
            sector_size,
            data.sector_size()
        )));
    }
    if sector_size == 0
        || !u64::try_from(sector_size)
            .map(|ss| PAGE_SIZE % ss == 0)
            .unwrap_or(false)
    {
        return Err(WalrusError::InvalidArgument(format!(
            "sector size {} does not divide the {}-byte reserved page",
            sector_size, PAGE_SIZE
        )));
    }
    Ok(sector_size as u32)
}

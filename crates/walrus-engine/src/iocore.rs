//! The staged write pipeline.
//!
//! Three stages over two tasks: the pack task groups queued writes
//! into log packs, writes them to the ring and acknowledges them once
//! permanent; acknowledged packs become data jobs that the data task
//! applies to the data device, advancing `written`. A ticker injects
//! timed flushes when the log device has no FUA.

use crate::engine::EngineShared;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use walrus_common::{Lsid, LsidSet, Result, WalrusError};
use walrus_wal::constants::max_records_in_sector;
use walrus_wal::ring::RingAllocator;
use walrus_wal::{PackBuilder, PackIo};

/// Requests flowing into the pack stage.
pub(crate) enum PackMsg {
    /// An upstream write or discard; `ack` fires once the log copy is
    /// permanent.
    Io {
        io: PackIo,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Barrier: flush the log, promote `permanent`, then ack.
    Flush {
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Shutdown,
}

/// A logged pack waiting for the data device.
pub(crate) struct DataJob {
    end_lsid: Lsid,
    ios: Vec<PackIo>,
    bytes: u64,
}

/// An ack (and its data job) parked until `permanent` covers it.
struct PendingAck {
    end_lsid: Lsid,
    acks: Vec<oneshot::Sender<Result<()>>>,
    job: DataJob,
}

/// Handles to the running pipeline.
pub(crate) struct IoCore {
    pub(crate) pack_tx: mpsc::UnboundedSender<PackMsg>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl IoCore {
    /// Spawns the pipeline tasks. `gate` pauses the pack stage while
    /// the device is frozen.
    pub(crate) fn spawn(shared: Arc<EngineShared>, gate: watch::Receiver<bool>) -> IoCore {
        let (pack_tx, pack_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let mut handles = vec![
            tokio::spawn(pack_task(shared.clone(), pack_rx, data_tx, gate)),
            tokio::spawn(data_task(shared.clone(), data_rx)),
        ];
        if !shared.log.supports_fua() {
            handles.push(tokio::spawn(flush_ticker(
                shared.config.log_flush_interval_ms,
                pack_tx.clone(),
            )));
        }

        IoCore {
            pack_tx,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    /// Stops the pipeline and waits for the tasks to exit.
    pub(crate) async fn shutdown(&self) {
        let _ = self.pack_tx.send(PackMsg::Shutdown);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Waits until the freeze gate is down.
pub(crate) async fn wait_melted(gate: &mut watch::Receiver<bool>) {
    loop {
        let frozen = { *gate.borrow() };
        if !frozen {
            return;
        }
        if gate.changed().await.is_err() {
            return;
        }
    }
}

/// Waits until the data stage has no bytes in flight.
pub(crate) async fn drain_data(shared: &EngineShared) {
    loop {
        let notified = shared.pending_notify.notified();
        if shared.pending_data_bytes.load(Ordering::Acquire) == 0 {
            return;
        }
        notified.await;
    }
}

async fn flush_ticker(interval_ms: u64, tx: mpsc::UnboundedSender<PackMsg>) {
    let interval = Duration::from_millis(interval_ms.max(1));
    loop {
        tokio::time::sleep(interval).await;
        if tx.send(PackMsg::Flush { ack: None }).is_err() {
            return;
        }
    }
}

const MAX_BATCH_IOS: usize = 128;

async fn pack_task(
    shared: Arc<EngineShared>,
    mut rx: mpsc::UnboundedReceiver<PackMsg>,
    data_tx: mpsc::UnboundedSender<DataJob>,
    mut gate: watch::Receiver<bool>,
) {
    let sector_size = shared.log.sector_size();
    let fua = shared.log.supports_fua();
    let mut pending: VecDeque<PendingAck> = VecDeque::new();
    let mut unflushed_pb: u64 = 0;

    loop {
        let Some(first) = rx.recv().await else { break };
        // Frozen: queued messages wait here until melt.
        wait_melted(&mut gate).await;

        // Collect everything immediately available into one batch.
        let mut ios: VecDeque<(PackIo, oneshot::Sender<Result<()>>)> = VecDeque::new();
        let mut flush_acks: Vec<oneshot::Sender<Result<()>>> = Vec::new();
        let mut flush_requested = false;
        let mut shutdown = false;
        let mut msg = Some(first);
        loop {
            match msg.take() {
                Some(PackMsg::Io { io, ack }) => ios.push_back((io, ack)),
                Some(PackMsg::Flush { ack }) => {
                    flush_requested = true;
                    if let Some(ack) = ack {
                        flush_acks.push(ack);
                    }
                }
                Some(PackMsg::Shutdown) => {
                    shutdown = true;
                    break;
                }
                None => {}
            }
            if ios.len() >= MAX_BATCH_IOS {
                break;
            }
            match rx.try_recv() {
                Ok(m) => msg = Some(m),
                Err(_) => break,
            }
        }

        if shared.is_read_only() {
            fail_all(&mut ios, &mut flush_acks, || WalrusError::ReadOnly);
        }

        // Pack stage: group, assign LSIDs, append to the ring.
        let salt = shared.salt.load(Ordering::Acquire);
        while !ios.is_empty() {
            match write_one_pack(
                &shared,
                sector_size,
                salt,
                fua,
                &mut ios,
                &mut pending,
                &mut unflushed_pb,
            ) {
                Ok(()) => {}
                Err(WalrusError::LogOverflow) => {
                    shared.log_overflow.store(true, Ordering::Release);
                    shared.set_read_only("ring buffer overflow");
                    fail_all(&mut ios, &mut flush_acks, || WalrusError::LogOverflow);
                }
                Err(e) => {
                    tracing::error!(error = %e, "log pack write failed");
                    shared.set_read_only("log device write failure");
                    fail_all(&mut ios, &mut flush_acks, || WalrusError::ReadOnly);
                }
            }
        }

        // Durability: FUA packs are already permanent; otherwise flush
        // whenever acks are waiting or the block budget is spent.
        let mut flush_failed = false;
        if !fua
            && unflushed_pb > 0
            && (flush_requested
                || !pending.is_empty()
                || unflushed_pb >= shared.config.log_flush_interval_pb)
        {
            let snap = shared.lsids.snapshot();
            match shared.log.flush() {
                Ok(()) => {
                    let _ = shared.lsids.promote_permanent(snap.completed);
                    unflushed_pb = 0;
                }
                Err(e) => {
                    tracing::error!(error = %e, "log flush failed");
                    shared.set_read_only("log device flush failure");
                    flush_failed = true;
                }
            }
        }

        // Ack stage: release everything `permanent` now covers.
        if flush_failed {
            while let Some(p) = pending.pop_front() {
                for ack in p.acks {
                    let _ = ack.send(Err(WalrusError::ReadOnly));
                }
            }
            for ack in flush_acks.drain(..) {
                let _ = ack.send(Err(WalrusError::ReadOnly));
            }
        } else {
            let permanent = shared.lsids.snapshot().permanent;
            while pending
                .front()
                .map_or(false, |p| p.end_lsid <= permanent)
            {
                let Some(p) = pending.pop_front() else { break };
                for ack in p.acks {
                    let _ = ack.send(Ok(()));
                }
                shared
                    .pending_data_bytes
                    .fetch_add(p.job.bytes, Ordering::AcqRel);
                if data_tx.send(p.job).is_err() {
                    shared.set_read_only("data stage unavailable");
                }
            }
            for ack in flush_acks.drain(..) {
                let _ = ack.send(Ok(()));
            }
        }

        if shutdown {
            break;
        }
    }

    // Pipeline going away: nothing queued may be left hanging.
    while let Some(p) = pending.pop_front() {
        for ack in p.acks {
            let _ = ack.send(Err(WalrusError::ReadOnly));
        }
    }
}

fn fail_all<F>(
    ios: &mut VecDeque<(PackIo, oneshot::Sender<Result<()>>)>,
    flush_acks: &mut Vec<oneshot::Sender<Result<()>>>,
    err: F,
) where
    F: Fn() -> WalrusError,
{
    for (_, ack) in ios.drain(..) {
        let _ = ack.send(Err(err()));
    }
    for ack in flush_acks.drain(..) {
        let _ = ack.send(Err(err()));
    }
}

struct PackPlan {
    n_reqs: usize,
    payload_pb: u64,
    pad: Option<u32>,
}

/// Decides how many queued requests the next pack takes, or that a
/// padding pack must run the log out to the ring end first.
fn plan_pack(
    ios: &VecDeque<(PackIo, oneshot::Sender<Result<()>>)>,
    sector_size: usize,
    max_logpack_pb: u64,
    ring: &RingAllocator,
    snap: &LsidSet,
) -> PackPlan {
    let contig = ring.contiguous_from(snap.latest);
    let front_pb = ios
        .front()
        .map(|(io, _)| io.io_sectors(sector_size) as u64)
        .unwrap_or(0);
    // A single oversized request gets a pack of its own; everything is
    // clipped to the contiguous room before the ring end.
    let budget = max_logpack_pb.max(front_pb).min(contig.saturating_sub(1));
    let max_records = max_records_in_sector(sector_size);

    let mut payload_pb = 0u64;
    let mut n_reqs = 0usize;
    for (io, _) in ios.iter() {
        if n_reqs >= max_records {
            break;
        }
        let s = io.io_sectors(sector_size) as u64;
        if payload_pb + s > budget {
            break;
        }
        payload_pb += s;
        n_reqs += 1;
    }

    if n_reqs == 0 {
        // The front request cannot fit before the ring end: pad out to
        // it so the next pack starts at the ring head.
        let pad = (contig - 1) as u32;
        return PackPlan {
            n_reqs: 0,
            payload_pb: pad as u64,
            pad: Some(pad),
        };
    }
    PackPlan {
        n_reqs,
        payload_pb,
        pad: None,
    }
}

fn write_one_pack(
    shared: &EngineShared,
    sector_size: usize,
    salt: u32,
    fua: bool,
    ios: &mut VecDeque<(PackIo, oneshot::Sender<Result<()>>)>,
    pending: &mut VecDeque<PendingAck>,
    unflushed_pb: &mut u64,
) -> Result<()> {
    let snap = shared.lsids.snapshot();
    let ring = *shared.ring.read();
    let plan = plan_pack(
        ios,
        sector_size,
        shared.config.max_logpack_pb as u64,
        &ring,
        &snap,
    );

    let pack_size = 1 + plan.payload_pb;
    if ring.would_overflow(snap.oldest, snap.latest, pack_size) {
        return Err(WalrusError::LogOverflow);
    }

    let lsid = shared.lsids.advance_latest(pack_size)?;
    let end = lsid.advance(pack_size);

    // Consume the planned requests.
    let mut builder = PackBuilder::new(sector_size, plan.payload_pb as u32);
    let mut acks = Vec::with_capacity(plan.n_reqs);
    let mut job_ios = Vec::with_capacity(plan.n_reqs);
    let mut job_bytes = 0u64;
    for _ in 0..plan.n_reqs {
        let Some((io, ack)) = ios.pop_front() else { break };
        job_bytes += io.payload_len() as u64;
        builder.push(io.clone());
        job_ios.push(io);
        acks.push(ack);
    }
    if let Some(pad) = plan.pad {
        builder.pad(pad);
    }

    let pack = builder.finish(lsid, salt);
    let write_result = pack.header.encode(sector_size, salt).and_then(|header| {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + pack.payload.len());
        parts.push(&header);
        for p in &pack.payload {
            parts.push(p);
        }
        shared.log.write_vectored(ring.offset_of(lsid), &parts, fua)
    });
    if let Err(e) = write_result {
        for ack in acks {
            let _ = ack.send(Err(WalrusError::ReadOnly));
        }
        return Err(e);
    }

    shared.lsids.set_flush(end)?;
    shared.lsids.set_completed(end)?;
    if fua {
        shared.lsids.promote_permanent(end)?;
    } else {
        *unflushed_pb += pack_size;
    }

    if !acks.is_empty() {
        pending.push_back(PendingAck {
            end_lsid: end,
            acks,
            job: DataJob {
                end_lsid: end,
                ios: job_ios,
                bytes: job_bytes,
            },
        });
    }
    Ok(())
}

async fn data_task(shared: Arc<EngineShared>, mut rx: mpsc::UnboundedReceiver<DataJob>) {
    loop {
        let Some(first) = rx.recv().await else { break };
        let mut jobs = vec![first];
        while jobs.len() < shared.config.n_io_bulk {
            match rx.try_recv() {
                Ok(job) => jobs.push(job),
                Err(_) => break,
            }
        }

        let total: u64 = jobs.iter().map(|j| j.bytes).sum();
        let end = jobs[jobs.len() - 1].end_lsid;

        if !shared.is_read_only() {
            // Sorting the bulk by data offset improves sequentiality.
            let mut items: Vec<&PackIo> = jobs.iter().flat_map(|j| j.ios.iter()).collect();
            items.sort_by_key(|io| io.offset());

            let mut failed = false;
            for io in items {
                let result = match io {
                    PackIo::Write { offset, data } => {
                        shared.data.write_sectors(*offset, data, false)
                    }
                    PackIo::Discard { offset, n_sectors } => {
                        shared.data.discard(*offset, *n_sectors as u64)
                    }
                };
                if let Err(e) = result {
                    tracing::error!(error = %e, "data device write failed");
                    shared.set_read_only("data device write failure");
                    failed = true;
                    break;
                }
            }
            if !failed {
                if let Err(e) = shared.lsids.set_written(end) {
                    tracing::error!(error = %e, "written lsid update failed");
                    shared.set_read_only("lsid state inconsistency");
                }
            }
        }

        shared
            .pending_data_bytes
            .fetch_sub(total, Ordering::AcqRel);
        shared.pending_notify.notify_waiters();
    }
}

//! Crash recovery: replay unapplied log packs onto the data device.
//!
//! Runs once at engine open, before the write pipeline starts. The log
//! tail is delimited by validation failures: a header that does not
//! decode (or whose LSID disagrees with the cursor) ends the log, and
//! a torn payload truncates its pack in place.

use crate::logpack::LogPackHeader;
use crate::super_block::SuperSector;
use walrus_block::SectorIo;
use walrus_common::checksum;
use walrus_common::{Lsid, Result};

/// Summary of one redo pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoReport {
    /// Cursor start (the super's `written_lsid`).
    pub start_lsid: Lsid,
    /// Cursor end; the engine resumes logging here.
    pub end_lsid: Lsid,
    /// Packs applied, the truncated tail pack included.
    pub packs_applied: u64,
    /// Data sectors written to the data device.
    pub sectors_applied: u64,
    /// True when a torn tail pack was truncated and rewritten.
    pub truncated: bool,
}

/// Replays the log from `written_lsid` and returns where it ended.
///
/// Idempotent: a second pass from the new end is a no-op, because the
/// sector at the end either fails validation or carries a different
/// LSID. The caller is responsible for moving the LSID state to
/// `end_lsid` and syncing the super.
pub fn redo(log: &SectorIo, data: &SectorIo, sup: &SuperSector) -> Result<RedoReport> {
    let ring = sup.ring();
    let salt = sup.log_checksum_salt;
    let sector_size = log.sector_size();

    let start = sup.written_lsid;
    let mut cursor = start;
    let mut packs_applied = 0u64;
    let mut sectors_applied = 0u64;
    let mut truncated = false;

    loop {
        let head_off = ring.offset_of(cursor);
        let head_buf = log.read_sector(head_off)?;
        let header = match LogPackHeader::decode(&head_buf, salt) {
            Ok(h) => h,
            Err(_) => break,
        };
        if header.logpack_lsid != cursor {
            break;
        }

        // Read payloads, stopping at the first torn record.
        let mut payloads = Vec::with_capacity(header.records.len());
        let mut torn_at: Option<usize> = None;
        for (i, rec) in header.records.iter().enumerate() {
            if !rec.has_payload() {
                payloads.push(None);
                continue;
            }
            let off = ring.offset_of(header.record_lsid(rec));
            let payload = log.read_sectors(off, rec.io_size as u64)?;
            if checksum::checksum(&payload, salt) != rec.checksum {
                torn_at = Some(i);
                break;
            }
            payloads.push(Some(payload));
        }

        match torn_at {
            None => {
                apply_records(data, &header, &payloads, &mut sectors_applied)?;
                cursor = header.next_lsid();
                packs_applied += 1;
            }
            Some(0) => {
                // Nothing salvageable; invalidate the header so a
                // rerun stops at the same place.
                tracing::warn!(lsid = cursor.0, "torn log pack with no valid records");
                log.zero_sector(head_off)?;
                log.flush()?;
                truncated = true;
                break;
            }
            Some(k) => {
                tracing::warn!(
                    lsid = cursor.0,
                    kept = k,
                    dropped = header.records.len() - k,
                    "truncating torn log pack tail"
                );
                let mut rewritten = header.clone();
                rewritten.truncate(k);
                let buf = rewritten.encode(sector_size, salt)?;
                log.write_sectors(head_off, &buf, false)?;
                log.flush()?;
                apply_records(data, &rewritten, &payloads, &mut sectors_applied)?;
                cursor = rewritten.next_lsid();
                packs_applied += 1;
                truncated = true;
                break;
            }
        }
    }

    data.flush()?;
    let report = RedoReport {
        start_lsid: start,
        end_lsid: cursor,
        packs_applied,
        sectors_applied,
        truncated,
    };
    if packs_applied > 0 || truncated {
        tracing::info!(
            start = start.0,
            end = cursor.0,
            packs = packs_applied,
            sectors = sectors_applied,
            truncated,
            "redo finished"
        );
    }
    Ok(report)
}

fn apply_records(
    data: &SectorIo,
    header: &LogPackHeader,
    payloads: &[Option<bytes::Bytes>],
    sectors_applied: &mut u64,
) -> Result<()> {
    for (rec, payload) in header.records.iter().zip(payloads) {
        if rec.is_padding {
            continue;
        }
        if rec.is_discard {
            data.discard(rec.offset, rec.io_size as u64)?;
            continue;
        }
        if let Some(payload) = payload {
            data.write_sectors(rec.offset, payload, false)?;
            *sectors_applied += rec.io_size as u64;
        }
    }
    Ok(())
}

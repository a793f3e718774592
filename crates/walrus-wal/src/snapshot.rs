//! Persistent snapshot store.
//!
//! Snapshots are `(id, name, lsid, timestamp)` records living in the
//! metadata sectors between super0 and super1. Each sector carries an
//! occupancy bitmap and a checksum; every mutation rewrites the
//! affected sector before returning.

use crate::constants::{
    max_snapshots_in_sector, INVALID_SNAPSHOT_ID, NAME_SIZE, SNAPSHOT_RECORD_SIZE,
    SNAPSHOT_SECTOR_HEADER_SIZE,
};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use walrus_block::SectorIo;
use walrus_common::checksum;
use walrus_common::{Lsid, Result, WalrusError};

/// One named snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: u32,
    pub name: String,
    pub lsid: Lsid,
    pub timestamp: u64,
}

struct Inner {
    by_id: BTreeMap<u32, SnapshotRecord>,
    by_name: HashMap<String, u32>,
    by_lsid: BTreeMap<(u64, String), u32>,
    /// Slot assignment per metadata sector.
    sectors: Vec<Vec<Option<u32>>>,
    next_id: u32,
}

impl Inner {
    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                INVALID_SNAPSHOT_ID => 0,
                n => n,
            };
            if id != INVALID_SNAPSHOT_ID && !self.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, record: SnapshotRecord, sector: usize, slot: usize) {
        self.sectors[sector][slot] = Some(record.snapshot_id);
        self.by_name
            .insert(record.name.clone(), record.snapshot_id);
        self.by_lsid
            .insert((record.lsid.0, record.name.clone()), record.snapshot_id);
        self.by_id.insert(record.snapshot_id, record);
    }

    fn remove(&mut self, id: u32) -> Option<SnapshotRecord> {
        let record = self.by_id.remove(&id)?;
        self.by_name.remove(&record.name);
        self.by_lsid.remove(&(record.lsid.0, record.name.clone()));
        for sector in &mut self.sectors {
            for slot in sector.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        Some(record)
    }

    fn slot_of(&self, id: u32) -> Option<usize> {
        self.sectors
            .iter()
            .position(|sector| sector.iter().any(|s| *s == Some(id)))
    }

    fn free_slot(&self) -> Option<(usize, usize)> {
        for (si, sector) in self.sectors.iter().enumerate() {
            if let Some(slot) = sector.iter().position(|s| s.is_none()) {
                return Some((si, slot));
            }
        }
        None
    }
}

/// The snapshot store: in-memory indexes plus sector persistence.
pub struct SnapshotStore {
    io: SectorIo,
    metadata_offset: u64,
    n_sectors: u32,
    slots_per_sector: usize,
    inner: Mutex<Inner>,
}

impl SnapshotStore {
    /// Writes empty, validly-checksummed metadata sectors.
    pub fn format(io: &SectorIo, metadata_offset: u64, n_sectors: u32) -> Result<()> {
        let mut buf = BytesMut::zeroed(io.sector_size());
        checksum::embed(&mut buf, 0, 0);
        for i in 0..n_sectors {
            io.write_sectors(metadata_offset + i as u64, &buf, false)?;
        }
        io.flush()?;
        Ok(())
    }

    /// Loads the store, verifying every sector checksum and bitmap.
    pub fn load(io: SectorIo, metadata_offset: u64, n_sectors: u32) -> Result<Self> {
        let sector_size = io.sector_size();
        let slots_per_sector = max_snapshots_in_sector(sector_size);
        let mut inner = Inner {
            by_id: BTreeMap::new(),
            by_name: HashMap::new(),
            by_lsid: BTreeMap::new(),
            sectors: vec![vec![None; slots_per_sector]; n_sectors as usize],
            next_id: 0,
        };

        for si in 0..n_sectors as usize {
            let off = metadata_offset + si as u64;
            let buf = io.read_sector(off)?;
            if !checksum::verify(&buf, 0) {
                return Err(WalrusError::Checksum {
                    sector: off,
                    reason: "snapshot sector checksum".to_string(),
                });
            }

            let bitmap = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            for slot in 0..slots_per_sector {
                if bitmap & (1 << slot) == 0 {
                    continue;
                }
                let record = decode_record(&buf, slot).map_err(|reason| {
                    WalrusError::Checksum {
                        sector: off,
                        reason,
                    }
                })?;
                if inner.by_name.contains_key(&record.name)
                    || inner.by_id.contains_key(&record.snapshot_id)
                {
                    return Err(WalrusError::Checksum {
                        sector: off,
                        reason: format!("duplicate snapshot entry {}", record.name),
                    });
                }
                if record.snapshot_id >= inner.next_id {
                    inner.next_id = record.snapshot_id.wrapping_add(1);
                }
                inner.insert(record, si, slot);
            }
        }

        let n = inner.by_id.len();
        if n > 0 {
            tracing::info!(snapshots = n, "snapshot store loaded");
        }
        Ok(Self {
            io,
            metadata_offset,
            n_sectors,
            slots_per_sector,
            inner: Mutex::new(inner),
        })
    }

    /// Number of snapshots currently stored.
    pub fn n_records(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    fn write_sector(&self, inner: &Inner, sector: usize) -> Result<()> {
        let mut buf = BytesMut::zeroed(self.io.sector_size());
        let mut bitmap: u32 = 0;
        for (slot, occupant) in inner.sectors[sector].iter().enumerate() {
            let Some(id) = occupant else { continue };
            let Some(record) = inner.by_id.get(id) else {
                continue;
            };
            bitmap |= 1 << slot;
            encode_record(&mut buf, slot, record);
        }
        buf[4..8].copy_from_slice(&bitmap.to_le_bytes());
        checksum::embed(&mut buf, 0, 0);
        self.io
            .write_sectors(self.metadata_offset + sector as u64, &buf, true)
    }

    /// Adds a snapshot. Fails with `NameConflict` on a duplicate name,
    /// `Busy` when every record slot is occupied.
    pub fn add(&self, name: &str, lsid: Lsid, timestamp: u64) -> Result<SnapshotRecord> {
        validate_name(name)?;
        if !lsid.is_valid() {
            return Err(WalrusError::InvalidLsid {
                lsid: lsid.0,
                reason: "snapshot lsid is invalid".to_string(),
            });
        }

        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) {
            return Err(WalrusError::NameConflict(name.to_string()));
        }
        let Some((sector, slot)) = inner.free_slot() else {
            return Err(WalrusError::Busy("snapshot metadata full".to_string()));
        };

        let record = SnapshotRecord {
            snapshot_id: inner.alloc_id(),
            name: name.to_string(),
            lsid,
            timestamp,
        };
        inner.insert(record.clone(), sector, slot);
        if let Err(e) = self.write_sector(&inner, sector) {
            inner.remove(record.snapshot_id);
            return Err(e);
        }
        Ok(record)
    }

    /// Deletes a snapshot by name.
    pub fn del(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(&id) = inner.by_name.get(name) else {
            return Err(WalrusError::NotFound(name.to_string()));
        };
        let sector = inner.slot_of(id).unwrap_or(0);
        inner.remove(id);
        self.write_sector(&inner, sector)
    }

    /// Deletes every snapshot whose lsid falls in `[lsid0, lsid1)`;
    /// returns the number removed.
    pub fn del_range(&self, lsid0: Lsid, lsid1: Lsid) -> Result<u32> {
        let mut inner = self.inner.lock();
        let ids: Vec<u32> = inner
            .by_lsid
            .range((lsid0.0, String::new())..(lsid1.0, String::new()))
            .map(|(_, &id)| id)
            .collect();

        let mut dirty: Vec<usize> = Vec::new();
        for id in &ids {
            if let Some(sector) = inner.slot_of(*id) {
                if !dirty.contains(&sector) {
                    dirty.push(sector);
                }
            }
            inner.remove(*id);
        }
        for sector in dirty {
            self.write_sector(&inner, sector)?;
        }
        Ok(ids.len() as u32)
    }

    /// Looks a snapshot up by name.
    pub fn get(&self, name: &str) -> Result<SnapshotRecord> {
        let inner = self.inner.lock();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
            .ok_or_else(|| WalrusError::NotFound(name.to_string()))
    }

    /// Counts snapshots with lsid in `[lsid0, lsid1)`.
    pub fn n_records_range(&self, lsid0: Lsid, lsid1: Lsid) -> u32 {
        self.inner
            .lock()
            .by_lsid
            .range((lsid0.0, String::new())..(lsid1.0, String::new()))
            .count() as u32
    }

    /// Lists up to `max` snapshots with lsid in `[lsid0, lsid1)`,
    /// ordered by lsid then name. The second value is the lsid to
    /// resume from, or `None` when the range is exhausted.
    pub fn list_range(
        &self,
        lsid0: Lsid,
        lsid1: Lsid,
        max: usize,
    ) -> (Vec<SnapshotRecord>, Option<u64>) {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        let mut next = None;
        for (&(lsid, _), &id) in inner
            .by_lsid
            .range((lsid0.0, String::new())..(lsid1.0, String::new()))
        {
            if records.len() == max {
                next = Some(lsid);
                break;
            }
            if let Some(record) = inner.by_id.get(&id) {
                records.push(record.clone());
            }
        }
        (records, next)
    }

    /// Lists up to `max` snapshots with id >= `snapshot_id`, ordered
    /// by id. The second value is the id to resume from.
    pub fn list_from(&self, snapshot_id: u32, max: usize) -> (Vec<SnapshotRecord>, Option<u32>) {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        let mut next = None;
        for (&id, record) in inner.by_id.range(snapshot_id..) {
            if records.len() == max {
                next = Some(id);
                break;
            }
            records.push(record.clone());
        }
        (records, next)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WalrusError::InvalidArgument(
            "empty snapshot name".to_string(),
        ));
    }
    if name.len() >= NAME_SIZE {
        return Err(WalrusError::InvalidArgument(format!(
            "snapshot name longer than {} bytes",
            NAME_SIZE - 1
        )));
    }
    if name.bytes().any(|b| b == 0) {
        return Err(WalrusError::InvalidArgument(
            "snapshot name contains NUL".to_string(),
        ));
    }
    Ok(())
}

fn slot_offset(slot: usize) -> usize {
    SNAPSHOT_SECTOR_HEADER_SIZE + slot * SNAPSHOT_RECORD_SIZE
}

fn encode_record(buf: &mut [u8], slot: usize, record: &SnapshotRecord) {
    let mut cur = &mut buf[slot_offset(slot)..slot_offset(slot) + SNAPSHOT_RECORD_SIZE];
    cur.put_u32_le(record.snapshot_id);
    cur.put_u32_le(0); // reserved
    cur.put_u64_le(record.lsid.0);
    cur.put_u64_le(record.timestamp);
    let mut name_field = [0u8; NAME_SIZE];
    name_field[..record.name.len()].copy_from_slice(record.name.as_bytes());
    cur.put_slice(&name_field);
}

fn decode_record(buf: &[u8], slot: usize) -> std::result::Result<SnapshotRecord, String> {
    let mut cur = &buf[slot_offset(slot)..slot_offset(slot) + SNAPSHOT_RECORD_SIZE];
    let snapshot_id = cur.get_u32_le();
    let _reserved = cur.get_u32_le();
    let lsid = Lsid(cur.get_u64_le());
    let timestamp = cur.get_u64_le();
    let mut name_field = [0u8; NAME_SIZE];
    cur.copy_to_slice(&mut name_field);

    if snapshot_id == INVALID_SNAPSHOT_ID {
        return Err("occupied slot with invalid snapshot id".to_string());
    }
    let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
    if name_len == 0 || name_len >= NAME_SIZE {
        return Err("snapshot name length out of range".to_string());
    }
    let name = std::str::from_utf8(&name_field[..name_len])
        .map_err(|_| "snapshot name is not UTF-8".to_string())?
        .to_string();

    Ok(SnapshotRecord {
        snapshot_id,
        name,
        lsid,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use walrus_block::FileBlockDevice;

    const SS: u32 = 512;
    const META_OFF: u64 = 9;
    const META_SECTORS: u32 = 2;

    fn create_test_store() -> (SnapshotStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dev = FileBlockDevice::create(&dir.path().join("log.img"), SS, 64).unwrap();
        let io = SectorIo::new(Arc::new(dev));
        SnapshotStore::format(&io, META_OFF, META_SECTORS).unwrap();
        let store = SnapshotStore::load(io, META_OFF, META_SECTORS).unwrap();
        (store, dir)
    }

    #[test]
    fn test_fresh_store_empty() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.n_records(), 0);
        let (records, next) = store.list_from(0, 100);
        assert!(records.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn test_add_get_del() {
        let (store, _dir) = create_test_store();
        let added = store.add("s1", Lsid(100), 1234).unwrap();
        assert_eq!(added.name, "s1");
        assert_eq!(added.lsid, Lsid(100));

        let got = store.get("s1").unwrap();
        assert_eq!(got, added);

        store.del("s1").unwrap();
        assert!(matches!(store.get("s1"), Err(WalrusError::NotFound(_))));
    }

    #[test]
    fn test_name_conflict() {
        let (store, _dir) = create_test_store();
        store.add("s1", Lsid(100), 0).unwrap();
        assert!(matches!(
            store.add("s1", Lsid(200), 0),
            Err(WalrusError::NameConflict(_))
        ));
    }

    #[test]
    fn test_del_missing() {
        let (store, _dir) = create_test_store();
        assert!(matches!(store.del("nope"), Err(WalrusError::NotFound(_))));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (store, _dir) = create_test_store();
        assert!(store.add("", Lsid(1), 0).is_err());
        assert!(store.add(&"x".repeat(NAME_SIZE), Lsid(1), 0).is_err());
        assert!(store.add("bad\0name", Lsid(1), 0).is_err());
    }

    #[test]
    fn test_ids_monotonic() {
        let (store, _dir) = create_test_store();
        let a = store.add("a", Lsid(1), 0).unwrap();
        let b = store.add("b", Lsid(2), 0).unwrap();
        store.del("a").unwrap();
        let c = store.add("c", Lsid(3), 0).unwrap();
        assert!(b.snapshot_id > a.snapshot_id);
        assert!(c.snapshot_id > b.snapshot_id);
    }

    #[test]
    fn test_store_full_is_busy() {
        let (store, _dir) = create_test_store();
        // 512-byte sectors hold 5 records each; 2 sectors -> 10 slots.
        for i in 0..10 {
            store.add(&format!("s{}", i), Lsid(i), 0).unwrap();
        }
        assert!(matches!(
            store.add("overflow", Lsid(99), 0),
            Err(WalrusError::Busy(_))
        ));

        // Deleting one frees a slot again.
        store.del("s3").unwrap();
        store.add("replacement", Lsid(50), 0).unwrap();
    }

    #[test]
    fn test_list_range_ordering() {
        let (store, _dir) = create_test_store();
        store.add("z", Lsid(100), 0).unwrap();
        store.add("a", Lsid(100), 0).unwrap();
        store.add("m", Lsid(50), 0).unwrap();
        store.add("out", Lsid(300), 0).unwrap();

        let (records, next) = store.list_range(Lsid(0), Lsid(300), 10);
        assert!(next.is_none());
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["m", "a", "z"]);
    }

    #[test]
    fn test_list_range_pagination() {
        let (store, _dir) = create_test_store();
        for i in 0..6u64 {
            store.add(&format!("s{}", i), Lsid(i * 10), 0).unwrap();
        }
        let (page, next) = store.list_range(Lsid(0), Lsid(100), 4);
        assert_eq!(page.len(), 4);
        let resume = next.unwrap();
        assert_eq!(resume, 40);

        let (rest, next2) = store.list_range(Lsid(resume), Lsid(100), 4);
        assert_eq!(rest.len(), 2);
        assert!(next2.is_none());
    }

    #[test]
    fn test_list_from_pagination() {
        let (store, _dir) = create_test_store();
        for i in 0..5u64 {
            store.add(&format!("s{}", i), Lsid(i), 0).unwrap();
        }
        let (page, next) = store.list_from(0, 3);
        assert_eq!(page.len(), 3);
        let resume = next.unwrap();

        let (rest, next2) = store.list_from(resume, 3);
        assert_eq!(rest.len(), 2);
        assert!(next2.is_none());

        // list_range results are a subset of the list_from sequence.
        let (by_lsid, _) = store.list_range(Lsid(0), Lsid(100), 100);
        let all: Vec<_> = page.into_iter().chain(rest).collect();
        for r in by_lsid {
            assert!(all.contains(&r));
        }
    }

    #[test]
    fn test_del_range() {
        let (store, _dir) = create_test_store();
        store.add("s1", Lsid(100), 0).unwrap();
        store.add("s2", Lsid(200), 0).unwrap();
        store.add("s3", Lsid(250), 0).unwrap();

        assert_eq!(store.n_records_range(Lsid(150), Lsid(250)), 1);
        let removed = store.del_range(Lsid(150), Lsid(250)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("s1").is_ok());
        assert!(store.get("s2").is_err());
        assert!(store.get("s3").is_ok());

        // [0, MAX) clears everything.
        let removed = store.del_range(Lsid(0), Lsid(u64::MAX)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.n_records(), 0);
    }

    #[test]
    fn test_persistence_across_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.img");
        {
            let dev = FileBlockDevice::create(&path, SS, 64).unwrap();
            let io = SectorIo::new(Arc::new(dev));
            SnapshotStore::format(&io, META_OFF, META_SECTORS).unwrap();
            let store = SnapshotStore::load(io, META_OFF, META_SECTORS).unwrap();
            store.add("kept", Lsid(77), 42).unwrap();
            store.add("gone", Lsid(88), 43).unwrap();
            store.del("gone").unwrap();
        }

        let dev = FileBlockDevice::open(&path, SS).unwrap();
        let io = SectorIo::new(Arc::new(dev));
        let store = SnapshotStore::load(io, META_OFF, META_SECTORS).unwrap();
        assert_eq!(store.n_records(), 1);
        let r = store.get("kept").unwrap();
        assert_eq!(r.lsid, Lsid(77));
        assert_eq!(r.timestamp, 42);

        // Ids keep climbing after reload.
        let again = store.add("another", Lsid(99), 0).unwrap();
        assert!(again.snapshot_id > r.snapshot_id);
    }

    #[test]
    fn test_corrupt_sector_detected_at_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.img");
        let io = {
            let dev = FileBlockDevice::create(&path, SS, 64).unwrap();
            SectorIo::new(Arc::new(dev))
        };
        SnapshotStore::format(&io, META_OFF, META_SECTORS).unwrap();
        {
            let store = SnapshotStore::load(io.clone(), META_OFF, META_SECTORS).unwrap();
            store.add("s1", Lsid(1), 0).unwrap();
        }

        // Flip one byte in the first metadata sector.
        let mut buf = io.read_sector(META_OFF).unwrap().to_vec();
        buf[20] ^= 0xFF;
        io.write_sectors(META_OFF, &buf, false).unwrap();

        assert!(matches!(
            SnapshotStore::load(io, META_OFF, META_SECTORS),
            Err(WalrusError::Checksum { .. })
        ));
    }
}

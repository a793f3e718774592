//! Super sector codec and the mirrored superblock protocol.
//!
//! The super sector describes the log-device layout and carries the
//! durable `oldest`/`written` LSIDs. It is stored twice (super0 and
//! super1) so a torn write can never lose both copies.

use crate::constants::{FORMAT_VERSION, NAME_SIZE, PAGE_SIZE, SUPER_ENCODED_SIZE};
use crate::ring::RingAllocator;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use uuid::Uuid;
use walrus_block::SectorIo;
use walrus_common::checksum;
use walrus_common::{Lsid, Result, WalrusError};

/// How far past the metadata region the mirror scan will look when
/// super0 is unreadable.
const SUPER1_SCAN_LIMIT: u64 = 4096;

/// In-memory image of the super sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperSector {
    pub version: u32,
    pub sector_size: u32,
    pub snapshot_metadata_size: u32,
    pub log_checksum_salt: u32,
    pub uuid: Uuid,
    pub name: String,
    pub ring_buffer_size: u64,
    pub oldest_lsid: Lsid,
    pub written_lsid: Lsid,
    pub device_size: u64,
}

impl SuperSector {
    /// Sector offset of super0 (the reserved page precedes it).
    pub fn super0_offset(sector_size: u32) -> u64 {
        PAGE_SIZE / sector_size as u64
    }

    /// Sector offset of the first snapshot metadata sector.
    pub fn metadata_offset_for(sector_size: u32) -> u64 {
        Self::super0_offset(sector_size) + 1
    }

    pub fn metadata_offset(&self) -> u64 {
        Self::metadata_offset_for(self.sector_size)
    }

    /// Sector offset of the super1 mirror.
    pub fn super1_offset(&self) -> u64 {
        self.metadata_offset() + self.snapshot_metadata_size as u64
    }

    /// First sector of the ring buffer.
    pub fn ring_offset(&self) -> u64 {
        self.super1_offset() + 1
    }

    /// Ring allocator for the published layout.
    pub fn ring(&self) -> RingAllocator {
        RingAllocator::new(self.ring_offset(), self.ring_buffer_size)
    }

    /// Encodes the image into one sector, checksum embedded (salt 0).
    pub fn encode(&self) -> Result<Bytes> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() >= NAME_SIZE {
            return Err(WalrusError::InvalidArgument(format!(
                "device name longer than {} bytes",
                NAME_SIZE - 1
            )));
        }
        if (self.sector_size as usize) < SUPER_ENCODED_SIZE {
            return Err(WalrusError::InvalidArgument(format!(
                "sector size {} below encoded super size",
                self.sector_size
            )));
        }

        let mut buf = BytesMut::zeroed(self.sector_size as usize);
        {
            let mut cur = &mut buf[..];
            cur.put_u32_le(0); // checksum, embedded below
            cur.put_u32_le(self.version);
            cur.put_u32_le(self.sector_size);
            cur.put_u32_le(self.snapshot_metadata_size);
            cur.put_u32_le(self.log_checksum_salt);
            cur.put_u32_le(0); // reserved
            cur.put_slice(self.uuid.as_bytes());
            let mut name_field = [0u8; NAME_SIZE];
            name_field[..name_bytes.len()].copy_from_slice(name_bytes);
            cur.put_slice(&name_field);
            cur.put_u64_le(self.ring_buffer_size);
            cur.put_u64_le(self.oldest_lsid.0);
            cur.put_u64_le(self.written_lsid.0);
            cur.put_u64_le(self.device_size);
        }
        checksum::embed(&mut buf, 0, 0);
        Ok(buf.freeze())
    }

    /// Decodes and validates a super sector image.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let invalid = |reason: String| WalrusError::InvalidArgument(reason);

        if buf.len() < SUPER_ENCODED_SIZE {
            return Err(invalid("super sector too small".to_string()));
        }
        if !checksum::verify(buf, 0) {
            return Err(WalrusError::Checksum {
                sector: 0,
                reason: "super sector checksum".to_string(),
            });
        }

        let mut cur = buf;
        let _checksum = cur.get_u32_le();
        let version = cur.get_u32_le();
        let sector_size = cur.get_u32_le();
        let snapshot_metadata_size = cur.get_u32_le();
        let log_checksum_salt = cur.get_u32_le();
        let _reserved = cur.get_u32_le();
        let mut uuid_bytes = [0u8; 16];
        cur.copy_to_slice(&mut uuid_bytes);
        let mut name_field = [0u8; NAME_SIZE];
        cur.copy_to_slice(&mut name_field);
        let ring_buffer_size = cur.get_u64_le();
        let oldest_lsid = Lsid(cur.get_u64_le());
        let written_lsid = Lsid(cur.get_u64_le());
        let device_size = cur.get_u64_le();

        if version != FORMAT_VERSION {
            return Err(invalid(format!("unsupported format version {}", version)));
        }
        if sector_size as usize != buf.len() {
            return Err(invalid(format!(
                "super sector_size {} does not match sector length {}",
                sector_size,
                buf.len()
            )));
        }
        if ring_buffer_size == 0 {
            return Err(invalid("zero ring buffer".to_string()));
        }
        if oldest_lsid > written_lsid {
            return Err(invalid(format!(
                "oldest lsid {} above written lsid {}",
                oldest_lsid, written_lsid
            )));
        }

        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| invalid("device name is not UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            version,
            sector_size,
            snapshot_metadata_size,
            log_checksum_salt,
            uuid: Uuid::from_bytes(uuid_bytes),
            name,
            ring_buffer_size,
            oldest_lsid,
            written_lsid,
            device_size,
        })
    }
}

/// Reads the super sector, falling back to the mirror.
///
/// Super0 lives at a fixed offset. If it is corrupt, super1's position
/// is unknown (it depends on `snapshot_metadata_size`), so a bounded
/// scan looks for a sector that decodes and is self-locating: a super
/// whose own layout places its mirror at the offset it was read from.
pub fn read_super(io: &SectorIo) -> Result<SuperSector> {
    let sector_size = io.sector_size() as u32;
    let off0 = SuperSector::super0_offset(sector_size);

    let primary = io
        .read_sector(off0)
        .and_then(|buf| SuperSector::decode(&buf));
    let err0 = match primary {
        Ok(sup) => return Ok(sup),
        Err(e) => e,
    };

    tracing::warn!(error = %err0, "primary super sector invalid, scanning for mirror");
    let start = SuperSector::metadata_offset_for(sector_size);
    let end = (start + SUPER1_SCAN_LIMIT).min(io.size_sectors());
    for off in start..end {
        let Ok(buf) = io.read_sector(off) else {
            continue;
        };
        let Ok(sup) = SuperSector::decode(&buf) else {
            continue;
        };
        if sup.super1_offset() == off {
            tracing::warn!(offset = off, "recovered super sector from mirror");
            return Ok(sup);
        }
    }
    Err(err0)
}

/// Writes both super copies with a FLUSH between and after, so at any
/// instant at least one mirror is intact on disk.
pub fn write_super(io: &SectorIo, sup: &SuperSector) -> Result<()> {
    let buf = sup.encode()?;
    io.write_sectors(SuperSector::super0_offset(sup.sector_size), &buf, false)?;
    io.flush()?;
    io.write_sectors(sup.super1_offset(), &buf, false)?;
    io.flush()?;
    Ok(())
}

/// The in-memory superblock image under its own lock.
///
/// Lock rule: callers snapshot the LSID set *before* touching this
/// lock; `sync` receives plain values and never reaches back into the
/// LSID state.
pub struct SuperBlock {
    io: SectorIo,
    image: Mutex<SuperSector>,
}

impl SuperBlock {
    /// Loads the superblock from the log device.
    pub fn read(io: SectorIo) -> Result<Self> {
        let image = read_super(&io)?;
        Ok(Self {
            io,
            image: Mutex::new(image),
        })
    }

    /// Writes a fresh super sector pair and returns the manager.
    pub fn format(io: SectorIo, image: SuperSector) -> Result<Self> {
        write_super(&io, &image)?;
        Ok(Self {
            io,
            image: Mutex::new(image),
        })
    }

    /// Returns a copy of the current image.
    pub fn image(&self) -> SuperSector {
        self.image.lock().clone()
    }

    /// Mutates the in-memory image (not yet persisted).
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SuperSector),
    {
        f(&mut self.image.lock());
    }

    /// Replaces the in-memory image (clear-log failure path).
    pub fn restore(&self, image: SuperSector) {
        *self.image.lock() = image;
    }

    /// Persists the current image to both mirrors.
    pub fn write(&self) -> Result<()> {
        let image = self.image();
        write_super(&self.io, &image)
    }

    /// Stores the given LSIDs into the image and persists it.
    pub fn sync(&self, oldest: Lsid, written: Lsid) -> Result<()> {
        let image = {
            let mut guard = self.image.lock();
            guard.oldest_lsid = oldest;
            guard.written_lsid = written;
            guard.clone()
        };
        write_super(&self.io, &image)
    }
}

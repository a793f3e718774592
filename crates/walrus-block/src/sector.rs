//! Typed, checksum-aware sector I/O over a block device.

use crate::device::BlockDevice;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use walrus_common::checksum;
use walrus_common::{Result, WalrusError};

/// Shared handle for sector-granular access to one device.
#[derive(Clone)]
pub struct SectorIo {
    dev: Arc<dyn BlockDevice>,
}

impl SectorIo {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self { dev }
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> usize {
        self.dev.sector_size() as usize
    }

    /// Current device capacity in sectors.
    pub fn size_sectors(&self) -> u64 {
        self.dev.size_sectors()
    }

    /// Re-queries the device capacity.
    pub fn refresh_size(&self) -> Result<u64> {
        self.dev.refresh_size()
    }

    /// Whether the device honours FUA writes.
    pub fn supports_fua(&self) -> bool {
        self.dev.supports_fua()
    }

    /// Reads one sector.
    pub fn read_sector(&self, offset: u64) -> Result<Bytes> {
        self.read_sectors(offset, 1)
    }

    /// Reads `n` contiguous sectors.
    pub fn read_sectors(&self, offset: u64, n: u64) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(self.sector_size() * n as usize);
        self.dev.read_sectors(offset, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Reads one sector and verifies its embedded checksum.
    pub fn read_sector_checked(&self, offset: u64, salt: u32) -> Result<Bytes> {
        let buf = self.read_sector(offset)?;
        if !checksum::verify(&buf, salt) {
            return Err(WalrusError::Checksum {
                sector: offset,
                reason: "embedded checksum does not verify".to_string(),
            });
        }
        Ok(buf)
    }

    /// Writes one or more whole sectors.
    pub fn write_sectors(&self, offset: u64, data: &[u8], fua: bool) -> Result<()> {
        self.dev.write_sectors(offset, data, fua)
    }

    /// Writes several buffers as one contiguous sector run.
    ///
    /// Each part must itself be whole sectors; the parts are assembled
    /// into a single submission so the device sees one write.
    pub fn write_vectored(&self, offset: u64, parts: &[&[u8]], fua: bool) -> Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return Ok(());
        }
        let mut buf = BytesMut::with_capacity(total);
        for part in parts {
            buf.extend_from_slice(part);
        }
        self.dev.write_sectors(offset, &buf, fua)
    }

    /// Writes a zeroed sector (used to invalidate a log-pack header).
    pub fn zero_sector(&self, offset: u64) -> Result<()> {
        let zeros = vec![0u8; self.sector_size()];
        self.dev.write_sectors(offset, &zeros, false)
    }

    /// Makes all completed writes durable.
    pub fn flush(&self) -> Result<()> {
        self.dev.flush()
    }

    /// Discards a sector range on the device.
    pub fn discard(&self, offset: u64, n_sectors: u64) -> Result<()> {
        self.dev.discard(offset, n_sectors)
    }
}

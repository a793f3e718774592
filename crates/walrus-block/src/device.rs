//! Block device trait and the file-backed implementation.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walrus_common::{Result, WalrusError};

/// A byte-addressable device accessed at sector granularity.
///
/// Offsets and lengths are in sectors of `sector_size()` bytes. The
/// log and data devices of one engine must share a sector size.
pub trait BlockDevice: Send + Sync {
    /// Sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Current capacity in sectors.
    fn size_sectors(&self) -> u64;

    /// Re-queries the capacity (the backing store may have grown).
    fn refresh_size(&self) -> Result<u64> {
        Ok(self.size_sectors())
    }

    /// Whether writes can be made durable individually (FUA).
    fn supports_fua(&self) -> bool {
        false
    }

    /// Reads `buf.len() / sector_size` sectors starting at `offset`.
    fn read_sectors(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes whole sectors starting at `offset`. With `fua` set the
    /// data is durable when the call returns.
    fn write_sectors(&self, offset: u64, data: &[u8], fua: bool) -> Result<()>;

    /// Makes all completed writes durable.
    fn flush(&self) -> Result<()>;

    /// Discards a sector range. Reading discarded sectors afterwards
    /// returns unspecified (here: zeroed) data.
    fn discard(&self, offset: u64, n_sectors: u64) -> Result<()>;
}

/// A block device backed by a regular file.
pub struct FileBlockDevice {
    path: PathBuf,
    file: Mutex<File>,
    sector_size: u32,
    size_sectors: AtomicU64,
    fua: bool,
}

impl FileBlockDevice {
    /// Creates (or truncates) a device file of `n_sectors` sectors.
    pub fn create(path: &Path, sector_size: u32, n_sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(n_sectors * sector_size as u64)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            sector_size,
            size_sectors: AtomicU64::new(n_sectors),
            fua: true,
        })
    }

    /// Opens an existing device file.
    pub fn open(path: &Path, sector_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % sector_size as u64 != 0 {
            return Err(WalrusError::InvalidArgument(format!(
                "device size {} is not a multiple of sector size {}",
                len, sector_size
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            sector_size,
            size_sectors: AtomicU64::new(len / sector_size as u64),
            fua: true,
        })
    }

    /// Disables FUA support, forcing the engine onto its explicit
    /// FLUSH discipline. Used by tests.
    pub fn without_fua(mut self) -> Self {
        self.fua = false;
        self
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, n_sectors: u64) -> Result<()> {
        let size = self.size_sectors.load(Ordering::Acquire);
        if offset.checked_add(n_sectors).map_or(true, |end| end > size) {
            return Err(WalrusError::InvalidArgument(format!(
                "sector range {}+{} beyond device size {}",
                offset, n_sectors, size
            )));
        }
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size_sectors(&self) -> u64 {
        self.size_sectors.load(Ordering::Acquire)
    }

    fn refresh_size(&self) -> Result<u64> {
        let len = self.file.lock().metadata()?.len();
        let sectors = len / self.sector_size as u64;
        self.size_sectors.store(sectors, Ordering::Release);
        Ok(sectors)
    }

    fn supports_fua(&self) -> bool {
        self.fua
    }

    fn read_sectors(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let ss = self.sector_size as usize;
        if buf.is_empty() || buf.len() % ss != 0 {
            return Err(WalrusError::InvalidArgument(format!(
                "read length {} is not a positive multiple of sector size {}",
                buf.len(),
                ss
            )));
        }
        self.check_range(offset, (buf.len() / ss) as u64)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset * self.sector_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_sectors(&self, offset: u64, data: &[u8], fua: bool) -> Result<()> {
        let ss = self.sector_size as usize;
        if data.is_empty() || data.len() % ss != 0 {
            return Err(WalrusError::InvalidArgument(format!(
                "write length {} is not a positive multiple of sector size {}",
                data.len(),
                ss
            )));
        }
        self.check_range(offset, (data.len() / ss) as u64)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset * self.sector_size as u64))?;
        file.write_all(data)?;
        if fua {
            file.sync_data()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn discard(&self, offset: u64, n_sectors: u64) -> Result<()> {
        if n_sectors == 0 {
            return Ok(());
        }
        self.check_range(offset, n_sectors)?;

        let zeros = vec![0u8; self.sector_size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset * self.sector_size as u64))?;
        for _ in 0..n_sectors {
            file.write_all(&zeros)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_device(n_sectors: u64) -> (FileBlockDevice, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dev = FileBlockDevice::create(&dir.path().join("dev.img"), 512, n_sectors).unwrap();
        (dev, dir)
    }

    #[test]
    fn test_create_zero_filled() {
        let (dev, _dir) = create_test_device(8);
        assert_eq!(dev.size_sectors(), 8);
        assert_eq!(dev.sector_size(), 512);

        let mut buf = vec![0xFFu8; 512];
        dev.read_sectors(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (dev, _dir) = create_test_device(8);

        let mut data = vec![0u8; 1024];
        data[0] = 0xAB;
        data[1023] = 0xCD;
        dev.write_sectors(3, &data, false).unwrap();

        let mut buf = vec![0u8; 1024];
        dev.read_sectors(3, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let (dev, _dir) = create_test_device(4);
        let mut buf = vec![0u8; 512];
        assert!(dev.read_sectors(4, &mut buf).is_err());
        assert!(dev.write_sectors(3, &vec![0u8; 1024], false).is_err());
    }

    #[test]
    fn test_unaligned_length_rejected() {
        let (dev, _dir) = create_test_device(4);
        let mut buf = vec![0u8; 100];
        assert!(dev.read_sectors(0, &mut buf).is_err());
        assert!(dev.write_sectors(0, &buf, false).is_err());
    }

    #[test]
    fn test_discard_zeroes() {
        let (dev, _dir) = create_test_device(8);
        dev.write_sectors(2, &vec![0x5Au8; 1024], false).unwrap();
        dev.discard(2, 2).unwrap();

        let mut buf = vec![0xFFu8; 1024];
        dev.read_sectors(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fua_write_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        {
            let dev = FileBlockDevice::create(&path, 512, 4).unwrap();
            assert!(dev.supports_fua());
            dev.write_sectors(1, &vec![0x77u8; 512], true).unwrap();
        }
        let dev = FileBlockDevice::open(&path, 512).unwrap();
        let mut buf = vec![0u8; 512];
        dev.read_sectors(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x77));
    }

    #[test]
    fn test_without_fua() {
        let (dev, _dir) = create_test_device(4);
        let dev = dev.without_fua();
        assert!(!dev.supports_fua());
    }

    #[test]
    fn test_refresh_size_after_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let dev = FileBlockDevice::create(&path, 512, 4).unwrap();
        assert_eq!(dev.size_sectors(), 4);

        // Grow the backing file out-of-band.
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(8 * 512)
            .unwrap();

        assert_eq!(dev.refresh_size().unwrap(), 8);
        assert_eq!(dev.size_sectors(), 8);
    }

    #[test]
    fn test_open_rejects_unaligned_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, vec![0u8; 700]).unwrap();
        assert!(FileBlockDevice::open(&path, 512).is_err());
    }
}

//! Log-pack codec and pack builder.
//!
//! A log pack is one header sector followed by the payload sectors of
//! its records. Record LSIDs are relative (`lsid_local`) so a pack is
//! position-independent until its header LSID is assigned.

use crate::constants::{
    max_records_in_sector, LOGPACK_HEADER_SIZE, LOGPACK_RECORD_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use walrus_common::checksum;
use walrus_common::{Lsid, Result, WalrusError};

const FLAG_EXIST: u32 = 1 << 0;
const FLAG_PADDING: u32 = 1 << 1;
const FLAG_DISCARD: u32 = 1 << 2;

/// One record inside a log pack.
///
/// A record either carries payload sectors (a data write), marks a
/// discarded range (no payload), or pads the pack out to the ring end
/// (no payload, no data-device effect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Data-device sector offset (meaningless for padding).
    pub offset: u64,
    /// Size in sectors; consumes LSID space for every record kind.
    pub io_size: u32,
    /// LSID of this record relative to the pack header (>= 1).
    pub lsid_local: u32,
    /// Salted checksum of the payload; zero when there is none.
    pub checksum: u32,
    pub is_padding: bool,
    pub is_discard: bool,
}

impl LogRecord {
    /// True if payload sectors follow in the pack.
    pub fn has_payload(&self) -> bool {
        !self.is_padding && !self.is_discard
    }

    fn flags(&self) -> u32 {
        let mut f = FLAG_EXIST;
        if self.is_padding {
            f |= FLAG_PADDING;
        }
        if self.is_discard {
            f |= FLAG_DISCARD;
        }
        f
    }
}

/// Decoded log-pack header sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPackHeader {
    /// LSID of the header sector itself.
    pub logpack_lsid: Lsid,
    /// Total payload sectors (including padding/discard LSID space).
    pub total_io_size: u32,
    pub records: Vec<LogRecord>,
}

impl LogPackHeader {
    /// Pack size in sectors, header included.
    pub fn pack_size(&self) -> u64 {
        1 + self.total_io_size as u64
    }

    /// LSID of the pack following this one.
    pub fn next_lsid(&self) -> Lsid {
        self.logpack_lsid.advance(self.pack_size())
    }

    /// Absolute LSID of a record.
    pub fn record_lsid(&self, record: &LogRecord) -> Lsid {
        self.logpack_lsid.advance(record.lsid_local as u64)
    }

    /// Encodes the header into a full sector with the salted checksum
    /// embedded.
    pub fn encode(&self, sector_size: usize, salt: u32) -> Result<Bytes> {
        if self.records.is_empty() || self.records.len() > max_records_in_sector(sector_size) {
            return Err(WalrusError::InvalidArgument(format!(
                "{} records do not fit a {}-byte header sector",
                self.records.len(),
                sector_size
            )));
        }

        let mut buf = BytesMut::zeroed(sector_size);
        {
            let mut cur = &mut buf[..];
            cur.put_u32_le(0); // checksum, embedded below
            cur.put_u32_le(self.records.len() as u32);
            cur.put_u32_le(self.total_io_size);
            cur.put_u32_le(0); // reserved
            cur.put_u64_le(self.logpack_lsid.0);
            for rec in &self.records {
                cur.put_u32_le(rec.flags());
                cur.put_u32_le(rec.checksum);
                cur.put_u64_le(rec.offset);
                cur.put_u32_le(rec.io_size);
                cur.put_u32_le(rec.lsid_local);
            }
        }
        checksum::embed(&mut buf, 0, salt);
        Ok(buf.freeze())
    }

    /// Decodes and validates a header sector.
    ///
    /// Verifies the salted checksum and the structural invariants:
    /// record count bounds, strictly increasing contiguous
    /// `lsid_local`s and a consistent `total_io_size`. Stale sectors
    /// from a previous log epoch fail the salted checksum.
    pub fn decode(buf: &[u8], salt: u32) -> Result<Self> {
        let invalid = |reason: &str| WalrusError::InvalidLsid {
            lsid: Lsid::INVALID.0,
            reason: format!("log pack header: {}", reason),
        };

        if buf.len() < LOGPACK_HEADER_SIZE {
            return Err(invalid("sector too small"));
        }
        if !checksum::verify(buf, salt) {
            return Err(WalrusError::Checksum {
                sector: 0,
                reason: "log pack header checksum".to_string(),
            });
        }

        let mut cur = buf;
        let _checksum = cur.get_u32_le();
        let n_records = cur.get_u32_le() as usize;
        let total_io_size = cur.get_u32_le();
        let _reserved = cur.get_u32_le();
        let logpack_lsid = Lsid(cur.get_u64_le());

        if !logpack_lsid.is_valid() {
            return Err(invalid("invalid header lsid"));
        }
        if n_records == 0 || n_records > max_records_in_sector(buf.len()) {
            return Err(invalid("record count out of range"));
        }
        if cur.remaining() < n_records * LOGPACK_RECORD_SIZE {
            return Err(invalid("record array truncated"));
        }

        let mut records = Vec::with_capacity(n_records);
        let mut expect_local: u32 = 1;
        for _ in 0..n_records {
            let flags = cur.get_u32_le();
            let rec_checksum = cur.get_u32_le();
            let offset = cur.get_u64_le();
            let io_size = cur.get_u32_le();
            let lsid_local = cur.get_u32_le();

            if flags & FLAG_EXIST == 0 {
                return Err(invalid("record without exist flag"));
            }
            let is_padding = flags & FLAG_PADDING != 0;
            let is_discard = flags & FLAG_DISCARD != 0;
            if is_padding && is_discard {
                return Err(invalid("record both padding and discard"));
            }
            if lsid_local != expect_local {
                return Err(invalid("lsid_local not contiguous"));
            }
            expect_local = expect_local
                .checked_add(io_size)
                .ok_or_else(|| invalid("io_size overflow"))?;

            records.push(LogRecord {
                offset,
                io_size,
                lsid_local,
                checksum: rec_checksum,
                is_padding,
                is_discard,
            });
        }

        if total_io_size != expect_local - 1 {
            return Err(invalid("total_io_size mismatch"));
        }

        Ok(Self {
            logpack_lsid,
            total_io_size,
            records,
        })
    }

    /// Drops every record from index `keep` on and shrinks the pack
    /// accordingly. Used by redo to cut a torn tail.
    pub fn truncate(&mut self, keep: usize) {
        self.records.truncate(keep);
        self.total_io_size = self
            .records
            .last()
            .map(|r| r.lsid_local + r.io_size - 1)
            .unwrap_or(0);
    }
}

/// A write or discard destined for one log pack.
#[derive(Debug, Clone)]
pub enum PackIo {
    Write { offset: u64, data: Bytes },
    Discard { offset: u64, n_sectors: u32 },
}

impl PackIo {
    /// Data-device sector offset.
    pub fn offset(&self) -> u64 {
        match self {
            PackIo::Write { offset, .. } => *offset,
            PackIo::Discard { offset, .. } => *offset,
        }
    }

    /// LSID sectors this item consumes in the pack.
    pub fn io_sectors(&self, sector_size: usize) -> u32 {
        match self {
            PackIo::Write { data, .. } => (data.len() / sector_size) as u32,
            PackIo::Discard { n_sectors, .. } => *n_sectors,
        }
    }

    /// Payload bytes carried in the log (zero for discards).
    pub fn payload_len(&self) -> usize {
        match self {
            PackIo::Write { data, .. } => data.len(),
            PackIo::Discard { .. } => 0,
        }
    }
}

/// A finished pack: header plus the payload buffers of its write
/// records, in record order.
#[derive(Debug, Clone)]
pub struct LogPack {
    pub header: LogPackHeader,
    pub payload: Vec<Bytes>,
}

impl LogPack {
    /// Pack size in sectors, header included.
    pub fn pack_size(&self) -> u64 {
        self.header.pack_size()
    }
}

/// Accumulates upstream requests into one pack under a payload budget.
pub struct PackBuilder {
    sector_size: usize,
    budget_pb: u32,
    records: Vec<LogRecord>,
    payload: Vec<Bytes>,
    next_local: u32,
}

impl PackBuilder {
    pub fn new(sector_size: usize, budget_pb: u32) -> Self {
        Self {
            sector_size,
            budget_pb,
            records: Vec::new(),
            payload: Vec::new(),
            next_local: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Payload sectors accumulated so far (LSID space past the header).
    pub fn payload_sectors(&self) -> u32 {
        self.next_local - 1
    }

    /// True if the item fits the remaining budget and record slots.
    pub fn can_fit(&self, io: &PackIo) -> bool {
        self.records.len() < max_records_in_sector(self.sector_size)
            && self.payload_sectors() + io.io_sectors(self.sector_size) <= self.budget_pb
    }

    /// Adds an item; returns false (leaving the builder unchanged)
    /// when it does not fit.
    pub fn push(&mut self, io: PackIo) -> bool {
        if !self.can_fit(&io) {
            return false;
        }
        let io_size = io.io_sectors(self.sector_size);
        match io {
            PackIo::Write { offset, data } => {
                self.records.push(LogRecord {
                    offset,
                    io_size,
                    lsid_local: self.next_local,
                    checksum: 0,
                    is_padding: false,
                    is_discard: false,
                });
                self.payload.push(data);
            }
            PackIo::Discard { offset, .. } => {
                self.records.push(LogRecord {
                    offset,
                    io_size,
                    lsid_local: self.next_local,
                    checksum: 0,
                    is_padding: false,
                    is_discard: true,
                });
            }
        }
        self.next_local += io_size;
        true
    }

    /// Appends a padding record of `n` sectors, consuming LSID space
    /// without payload. Padding ignores the budget: it exists to run a
    /// pack out to the ring end.
    pub fn pad(&mut self, n: u32) {
        self.records.push(LogRecord {
            offset: 0,
            io_size: n,
            lsid_local: self.next_local,
            checksum: 0,
            is_padding: true,
            is_discard: false,
        });
        self.next_local += n;
    }

    /// Assigns the header LSID, computes record checksums and yields
    /// the pack.
    pub fn finish(mut self, lsid: Lsid, salt: u32) -> LogPack {
        let mut payload_idx = 0;
        for rec in &mut self.records {
            if rec.has_payload() {
                rec.checksum = checksum::checksum(&self.payload[payload_idx], salt);
                payload_idx += 1;
            }
        }
        LogPack {
            header: LogPackHeader {
                logpack_lsid: lsid,
                total_io_size: self.next_local - 1,
                records: self.records,
            },
            payload: self.payload,
        }
    }
}

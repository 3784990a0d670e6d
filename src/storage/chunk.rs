//! Chunk definitions and on-disk format
//!
//! A chunk is an immutable, self-describing file holding a fixed-duration,
//! fixed-step matrix of samples for one query. Files are published once and
//! never modified; replacement happens by atomic rename plus catalog swap.
//!
//! # Binary Layout
//!
//! ```text
//! header (48 bytes) | label-index block | sample block
//! ```
//!
//! The sample block is column-major storage flattened row by row:
//! `series_count` rows of `duration / step` little-endian IEEE-754 doubles.

use crate::error::ChunkError;
use crate::types::{DurationSecs, Labels, Time};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Magic number identifying the chunk format: "PMCK"
pub const CHUNK_MAGIC: u32 = 0x504d_434b;

/// Current chunk format version
pub const CHUNK_VERSION: u8 = 1;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 48;

/// File extension of published chunks
pub const CHUNK_SUFFIX: &str = ".chunk";

/// Suffix appended to quarantined corrupt chunks
pub const QUARANTINE_SUFFIX: &str = ".bad";

/// Marker embedded in not-yet-published temp file names
pub const TMP_MARKER: &str = ".tmp-";

/// Width of each zero-padded numeric field in a chunk file name
const NAME_FIELD_WIDTH: usize = 20;

/// Chunk header containing metadata
///
/// The header is stored at the beginning of each chunk file and contains
/// everything needed to read and validate the body.
///
/// # Binary Layout (48 bytes total, little-endian)
///
/// ```text
/// Offset | Size | Field
/// -------|------|------------------
///   0    |  4   | magic
///   4    |  1   | version
///   5    |  7   | reserved
///  12    |  8   | from
///  20    |  8   | duration
///  28    |  8   | step
///  36    |  8   | last_ts
///  44    |  4   | series_count
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Magic number for format identification
    pub magic: u32,

    /// Format version number (currently 1)
    pub version: u8,

    /// Timestamp of the first sample column (seconds)
    pub from: Time,

    /// Span of the chunk's range: `[from, from + duration)` (seconds)
    pub duration: DurationSecs,

    /// Column spacing (seconds); `duration` is a multiple of `step`
    pub step: DurationSecs,

    /// Timestamp of the last column actually written (seconds)
    pub last_ts: Time,

    /// Number of series rows in the body
    pub series_count: u32,
}

impl ChunkHeader {
    /// Create a header for a new chunk
    pub fn new(from: Time, last_ts: Time, duration: DurationSecs, step: DurationSecs) -> Self {
        Self {
            magic: CHUNK_MAGIC,
            version: CHUNK_VERSION,
            from,
            duration,
            step,
            last_ts,
            series_count: 0,
        }
    }

    /// Number of sample columns per series row
    pub fn columns(&self) -> usize {
        (self.duration / self.step) as usize
    }

    /// Whether the last written column is the last column of the range
    pub fn is_complete(&self) -> bool {
        self.last_ts == self.from + self.duration - self.step
    }

    /// Serialize to the fixed binary layout
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.version;
        // bytes 5..12 reserved
        buf[12..20].copy_from_slice(&self.from.to_le_bytes());
        buf[20..28].copy_from_slice(&self.duration.to_le_bytes());
        buf[28..36].copy_from_slice(&self.step.to_le_bytes());
        buf[36..44].copy_from_slice(&self.last_ts.to_le_bytes());
        buf[44..48].copy_from_slice(&self.series_count.to_le_bytes());
        buf
    }

    /// Parse from the fixed binary layout
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ChunkError> {
        if buf.len() < HEADER_LEN {
            return Err(ChunkError::Truncated {
                expected: HEADER_LEN as u64,
                actual: buf.len() as u64,
            });
        }
        let header = Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            version: buf[4],
            from: i64::from_le_bytes(buf[12..20].try_into().unwrap()),
            duration: i64::from_le_bytes(buf[20..28].try_into().unwrap()),
            step: i64::from_le_bytes(buf[28..36].try_into().unwrap()),
            last_ts: i64::from_le_bytes(buf[36..44].try_into().unwrap()),
            series_count: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        };
        header.validate()?;
        Ok(header)
    }

    /// Validate magic, version, and chunk invariants
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.magic != CHUNK_MAGIC {
            return Err(ChunkError::InvalidMagic {
                expected: CHUNK_MAGIC,
                actual: self.magic,
            });
        }
        if self.version > CHUNK_VERSION {
            return Err(ChunkError::UnsupportedVersion(self.version, CHUNK_VERSION));
        }
        if self.step <= 0 {
            return Err(ChunkError::InvalidHeader(format!(
                "non-positive step: {}",
                self.step
            )));
        }
        if self.duration <= 0 || self.duration % self.step != 0 {
            return Err(ChunkError::InvalidHeader(format!(
                "duration {} is not a positive multiple of step {}",
                self.duration, self.step
            )));
        }
        if self.last_ts < self.from || self.last_ts > self.from + self.duration - self.step {
            return Err(ChunkError::InvalidHeader(format!(
                "last_ts {} outside [{}, {}]",
                self.last_ts,
                self.from,
                self.from + self.duration - self.step
            )));
        }
        if (self.last_ts - self.from) % self.step != 0 {
            return Err(ChunkError::InvalidHeader(format!(
                "last_ts {} off the step grid (from {}, step {})",
                self.last_ts, self.from, self.step
            )));
        }
        Ok(())
    }
}

/// Filesystem-resident chunk descriptor
///
/// Everything the catalog needs, recoverable from the file name alone; the
/// body is never opened for catalog bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Full path of the chunk file
    pub path: PathBuf,

    /// Owning query, hex-encoded (the parent directory name)
    pub query_hash: String,

    /// Timestamp of the first sample column
    pub from: Time,

    /// Timestamp of the last column actually written
    pub last_ts: Time,

    /// Span of the chunk's range
    pub duration: DurationSecs,

    /// Column spacing
    pub step: DurationSecs,
}

impl ChunkInfo {
    /// File name encoding this descriptor: `<from>-<last_ts>-<duration>-<step>.chunk`
    ///
    /// All four fields are zero-padded decimal seconds so names sort
    /// chronologically.
    pub fn file_name(&self) -> String {
        format!(
            "{:0w$}-{:0w$}-{:0w$}-{:0w$}{}",
            self.from,
            self.last_ts,
            self.duration,
            self.step,
            CHUNK_SUFFIX,
            w = NAME_FIELD_WIDTH,
        )
    }

    /// Parse a descriptor back out of a chunk file path
    ///
    /// The parent directory name is taken as the query hash.
    pub fn from_path(path: &Path) -> Result<Self, ChunkError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ChunkError::InvalidFileName(path.display().to_string()))?;
        let stem = name
            .strip_suffix(CHUNK_SUFFIX)
            .ok_or_else(|| ChunkError::InvalidFileName(name.to_string()))?;

        let fields: Vec<&str> = stem.split('-').collect();
        if fields.len() != 4 {
            return Err(ChunkError::InvalidFileName(name.to_string()));
        }
        let parse = |s: &str| -> Result<i64, ChunkError> {
            s.parse::<i64>()
                .map_err(|_| ChunkError::InvalidFileName(name.to_string()))
        };

        let query_hash = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .ok_or_else(|| ChunkError::InvalidFileName(path.display().to_string()))?
            .to_string();

        let info = Self {
            path: path.to_path_buf(),
            query_hash,
            from: parse(fields[0])?,
            last_ts: parse(fields[1])?,
            duration: parse(fields[2])?,
            step: parse(fields[3])?,
        };
        if info.step <= 0 || info.duration <= 0 || info.duration % info.step != 0 {
            return Err(ChunkError::InvalidFileName(name.to_string()));
        }
        Ok(info)
    }

    /// End of the chunk's range (exclusive)
    pub fn to(&self) -> Time {
        self.from + self.duration
    }

    /// Whether the chunk holds its full column range
    pub fn is_complete(&self) -> bool {
        self.last_ts == self.from + self.duration - self.step
    }

    /// Whether this chunk's range overlaps `[from, to)`
    pub fn overlaps(&self, from: Time, to: Time) -> bool {
        self.from < to && self.to() > from
    }

    /// Whether this chunk's range fully contains `other`'s range
    pub fn covers(&self, other: &ChunkInfo) -> bool {
        self.from <= other.from && self.to() >= other.to()
    }

    /// Whether a header describes the same chunk this file name claims
    pub fn matches_header(&self, header: &ChunkHeader) -> bool {
        self.from == header.from
            && self.last_ts == header.last_ts
            && self.duration == header.duration
            && self.step == header.step
    }
}

/// Encode a label set into its canonical byte form
///
/// Layout: `u16` pair count, then per pair `u16` key length, key bytes,
/// `u16` value length, value bytes. `Labels` iterates keys in lexicographic
/// order, which makes the encoding canonical.
pub fn encode_labels(labels: &Labels, out: &mut BytesMut) -> Result<(), ChunkError> {
    if labels.len() > u16::MAX as usize {
        return Err(ChunkError::CorruptLabels(format!(
            "{} label pairs exceed the encodable maximum",
            labels.len()
        )));
    }
    out.put_u16_le(labels.len() as u16);
    for (key, value) in labels {
        for part in [key, value] {
            if part.len() > u16::MAX as usize {
                return Err(ChunkError::LabelTooLong(part.len()));
            }
            out.put_u16_le(part.len() as u16);
            out.put_slice(part.as_bytes());
        }
    }
    Ok(())
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], ChunkError> {
    let end = pos
        .checked_add(n)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| ChunkError::CorruptLabels("entry overruns block".to_string()))?;
    let s = &buf[*pos..end];
    *pos = end;
    Ok(s)
}

/// Decode a canonical label encoding
pub fn decode_labels(buf: &[u8]) -> Result<Labels, ChunkError> {
    let mut labels = Labels::new();
    let mut pos = 0usize;

    let count = u16::from_le_bytes(take(buf, &mut pos, 2)?.try_into().unwrap());
    for _ in 0..count {
        let mut parts = [String::new(), String::new()];
        for part in parts.iter_mut() {
            let len = u16::from_le_bytes(take(buf, &mut pos, 2)?.try_into().unwrap()) as usize;
            *part = std::str::from_utf8(take(buf, &mut pos, len)?)
                .map_err(|e| ChunkError::CorruptLabels(e.to_string()))?
                .to_string();
        }
        let [key, value] = parts;
        labels.insert(key, value);
    }
    if pos != buf.len() {
        return Err(ChunkError::CorruptLabels(format!(
            "{} trailing bytes after last entry",
            buf.len() - pos
        )));
    }
    Ok(labels)
}

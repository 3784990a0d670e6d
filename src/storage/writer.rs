//! Chunk writer: buffered build and atomic publish
//!
//! A destination chunk is assembled entirely in a caller-owned scratch
//! buffer, then persisted in one pass: unique temp name, write, fsync,
//! atomic rename to the metadata-bearing final name, fsync of the parent
//! directory. Readers can only ever observe a complete file.

use crate::error::ChunkError;
use crate::storage::chunk::{
    encode_labels, ChunkHeader, ChunkInfo, HEADER_LEN, TMP_MARKER,
};
use crate::types::{DurationSecs, MetricSeries, Time};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Reusable serialization scratch for one chunk at a time
///
/// Compaction workers and the ingester each own one of these and reuse it
/// across chunks, so building a chunk costs no steady-state allocation.
#[derive(Debug, Default)]
pub struct ChunkBuf {
    index: BytesMut,
    samples: BytesMut,
}

impl ChunkBuf {
    /// Create an empty scratch buffer
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.index.clear();
        self.samples.clear();
    }
}

/// Writer assembling one destination chunk
///
/// `create` fixes the time geometry, `write_metric` appends series, and
/// `persist` publishes the file. The writer borrows its scratch buffer from
/// the caller; dropping the writer without persisting discards the chunk.
pub struct ChunkWriter<'a> {
    header: ChunkHeader,
    buf: &'a mut ChunkBuf,
}

impl<'a> ChunkWriter<'a> {
    /// Prepare a new chunk spanning `[from, from + duration)`
    ///
    /// `last_ts` is the timestamp of the last column that holds data; for a
    /// complete chunk it equals `from + duration - step`.
    pub fn create(
        from: Time,
        last_ts: Time,
        duration: DurationSecs,
        step: DurationSecs,
        buf: &'a mut ChunkBuf,
    ) -> Result<Self, ChunkError> {
        let header = ChunkHeader::new(from, last_ts, duration, step);
        header.validate()?;
        buf.reset();
        Ok(Self { header, buf })
    }

    /// Timestamp of the first sample column
    pub fn from(&self) -> Time {
        self.header.from
    }

    /// Timestamp of the last column that holds data
    pub fn to(&self) -> Time {
        self.header.last_ts
    }

    /// Column spacing
    pub fn step(&self) -> DurationSecs {
        self.header.step
    }

    /// Append one series to the chunk
    ///
    /// The row must match the chunk's column count exactly.
    pub fn write_metric(&mut self, series: &MetricSeries) -> Result<(), ChunkError> {
        let want = self.header.columns();
        if series.values.len() != want {
            return Err(ChunkError::InvalidShape {
                want,
                got: series.values.len(),
            });
        }

        let fingerprint = series.fingerprint();
        let mut labels = BytesMut::new();
        encode_labels(&series.labels, &mut labels)?;

        self.buf.index.put_u64_le(fingerprint);
        self.buf.index.put_u32_le(labels.len() as u32);
        self.buf.index.put_slice(&labels);

        for v in &series.values {
            self.buf.samples.put_u64_le(v.to_bits());
        }
        self.header.series_count += 1;
        Ok(())
    }

    /// Publish the chunk into `dir` and return its descriptor
    ///
    /// The file is first written under a unique temp name
    /// (`<final>.tmp-<pid>-<nonce>`), fsynced, then renamed to its final
    /// name; the directory is fsynced after the rename. A crash at any point
    /// leaves either a reapable temp file or a fully valid chunk.
    pub fn persist(self, dir: &Path, query_hash: &str) -> Result<ChunkInfo, ChunkError> {
        let info = ChunkInfo {
            path: dir.join(self.file_name()),
            query_hash: query_hash.to_string(),
            from: self.header.from,
            last_ts: self.header.last_ts,
            duration: self.header.duration,
            step: self.header.step,
        };

        let tmp_name = format!(
            "{}{}{}-{}",
            self.file_name(),
            TMP_MARKER,
            std::process::id(),
            rand::random::<u32>()
        );
        let tmp_path = dir.join(&tmp_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;

        let result = (|| -> Result<(), ChunkError> {
            file.write_all(&self.header.to_bytes())?;
            file.write_all(&self.buf.index)?;
            file.write_all(&self.buf.samples)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            drop(file);
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        drop(file);

        if let Err(e) = std::fs::rename(&tmp_path, &info.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        File::open(dir)?.sync_all()?;
        Ok(info)
    }

    fn file_name(&self) -> String {
        ChunkInfo {
            path: Default::default(),
            query_hash: String::new(),
            from: self.header.from,
            last_ts: self.header.last_ts,
            duration: self.header.duration,
            step: self.header.step,
        }
        .file_name()
    }

    /// Total serialized size of the chunk so far, in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.buf.index.len() + self.buf.samples.len()
    }
}

//! Chunk reader: validated memory-mapped access and resampling reads
//!
//! Sealed chunk files are opened read-only through `memmap2`. Every header
//! field and every block boundary is validated before the first sample is
//! touched, so a truncated or tampered file fails at open, not mid-read.

use crate::error::ChunkError;
use crate::storage::chunk::{decode_labels, ChunkHeader, ChunkInfo, HEADER_LEN};
use crate::types::{is_missing, missing_sample, DurationSecs, Labels, MetricSeries, Time};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

/// Maximum chunk file size accepted by the reader (256 MB)
const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// One entry of the decoded label index
#[derive(Debug, Clone)]
struct SeriesEntry {
    fingerprint: u64,
    labels: Labels,
}

/// Read handle for one sealed chunk file
///
/// Holds the file mapped until `close` (or drop). Open/read/close is cheap
/// enough that compaction opens sources one at a time rather than keeping a
/// window of mappings alive.
#[derive(Debug)]
pub struct ChunkReader {
    mmap: Option<Mmap>,
    header: ChunkHeader,
    entries: Vec<SeriesEntry>,
    samples_off: usize,
    path: PathBuf,
}

impl ChunkReader {
    /// Open and validate the chunk file a descriptor points at
    ///
    /// Validates magic, version, header invariants, agreement between the
    /// file name and the header, and that the label index and sample block
    /// lie exactly within the file.
    pub fn open_from_info(info: &ChunkInfo) -> Result<Self, ChunkError> {
        let file = File::open(&info.path)?;
        let file_len = file.metadata()?.len();
        if file_len > MAX_CHUNK_SIZE {
            return Err(ChunkError::InvalidHeader(format!(
                "chunk file {} exceeds {} bytes",
                info.path.display(),
                MAX_CHUNK_SIZE
            )));
        }
        if (file_len as usize) < HEADER_LEN {
            return Err(ChunkError::Truncated {
                expected: HEADER_LEN as u64,
                actual: file_len,
            });
        }

        // Safety: the mapping is read-only and the file is never truncated
        // after publication; chunks are immutable by construction.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = ChunkHeader::from_bytes(&mmap[..HEADER_LEN])?;
        if !info.matches_header(&header) {
            return Err(ChunkError::InvalidHeader(format!(
                "file name {} disagrees with header ({}, {}, {}, {})",
                info.path.display(),
                header.from,
                header.last_ts,
                header.duration,
                header.step
            )));
        }

        // Walk the label index with bounds checks; everything after it must
        // be exactly the sample block.
        let mut entries = Vec::with_capacity(header.series_count as usize);
        let mut pos = HEADER_LEN;
        for _ in 0..header.series_count {
            let fixed_end = pos.checked_add(12).filter(|&e| e <= mmap.len()).ok_or(
                ChunkError::Truncated {
                    expected: (pos + 12) as u64,
                    actual: file_len,
                },
            )?;
            let fingerprint = u64::from_le_bytes(mmap[pos..pos + 8].try_into().unwrap());
            let labels_len =
                u32::from_le_bytes(mmap[pos + 8..fixed_end].try_into().unwrap()) as usize;
            let labels_end = fixed_end.checked_add(labels_len).filter(|&e| e <= mmap.len());
            let labels_end = labels_end.ok_or(ChunkError::Truncated {
                expected: (fixed_end + labels_len) as u64,
                actual: file_len,
            })?;
            let labels = decode_labels(&mmap[fixed_end..labels_end])?;
            entries.push(SeriesEntry {
                fingerprint,
                labels,
            });
            pos = labels_end;
        }

        let expected_len = (header.series_count as usize)
            .checked_mul(header.columns())
            .and_then(|n| n.checked_mul(8))
            .and_then(|n| n.checked_add(pos))
            .ok_or_else(|| ChunkError::InvalidHeader("sample block overflows".to_string()))?;
        if expected_len != mmap.len() {
            return Err(ChunkError::Truncated {
                expected: expected_len as u64,
                actual: file_len,
            });
        }

        Ok(Self {
            mmap: Some(mmap),
            header,
            entries,
            samples_off: pos,
            path: info.path.clone(),
        })
    }

    /// The validated header of this chunk
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Decode samples in `[from, to)` resampled to `step` and merge into `acc`
    ///
    /// If the chunk's step equals the requested step, columns are copied
    /// directly. If the chunk's step is finer, each destination column folds
    /// the source columns in its window with `fold` (left argument is the
    /// running value, starting from missing). A coarser chunk step is
    /// refused.
    ///
    /// Merge semantics into `acc` are first-writer-wins per slot: missing
    /// slots adopt this chunk's value, present slots are preserved. Source
    /// ordering is therefore the caller's concern.
    pub fn read_metrics<F>(
        &self,
        from: Time,
        to: Time,
        step: DurationSecs,
        fold: F,
        acc: &mut HashMap<u64, MetricSeries>,
    ) -> Result<(), ChunkError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let mmap = self.mmap.as_ref().ok_or_else(|| {
            ChunkError::InvalidHeader(format!("chunk {} already closed", self.path.display()))
        })?;
        if step <= 0 || to <= from {
            return Ok(());
        }
        let chunk_step = self.header.step;
        if chunk_step > step || step % chunk_step != 0 {
            return Err(ChunkError::IncompatibleStep {
                chunk_step,
                requested: step,
            });
        }

        let dst_columns = ((to - from) / step) as usize;
        let src_columns = self.header.columns();
        let chunk_from = self.header.from;

        for (row, entry) in self.entries.iter().enumerate() {
            let row_off = self.samples_off + row * src_columns * 8;

            let series = acc
                .entry(entry.fingerprint)
                .or_insert_with(|| MetricSeries::new(entry.labels.clone(), dst_columns));

            for i in 0..dst_columns {
                if !is_missing(series.values[i]) {
                    continue;
                }
                let ts = from + i as i64 * step;

                // Source columns whose timestamps fall in [ts, ts + step)
                let j_lo = div_ceil(ts - chunk_from, chunk_step).max(0);
                let j_hi = div_ceil(ts + step - chunk_from, chunk_step).min(src_columns as i64);

                let mut folded = missing_sample();
                for j in j_lo..j_hi {
                    let off = row_off + j as usize * 8;
                    let bits = u64::from_le_bytes(mmap[off..off + 8].try_into().unwrap());
                    folded = fold(folded, f64::from_bits(bits));
                }
                if !is_missing(folded) {
                    series.values[i] = folded;
                }
            }
        }
        Ok(())
    }

    /// Release the mapping; idempotent
    pub fn close(&mut self) {
        self.mmap = None;
    }
}

fn div_ceil(a: i64, b: i64) -> i64 {
    let d = a.div_euclid(b);
    if a.rem_euclid(b) != 0 {
        d + 1
    } else {
        d
    }
}

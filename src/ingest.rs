//! Ingester: scraped sample batches become base-duration chunks
//!
//! Each scrape delivers one column of samples for one query. The ingester
//! places that column into the query's jitter-aligned base-duration window:
//! it seeds an accumulator with the new column, backfills earlier columns
//! from the window's previous chunk file, publishes a replacement file
//! atomically, and supersedes the old one in the catalog.
//!
//! One window therefore always has at most one file on disk, whose
//! `last_ts` advances scrape by scrape until the chunk is complete and
//! becomes eligible for compaction.

use crate::aggregation;
use crate::catalog::ChunkCatalog;
use crate::error::Error;
use crate::metrics;
use crate::storage::chunk::ChunkInfo;
use crate::storage::reader::ChunkReader;
use crate::storage::writer::{ChunkBuf, ChunkWriter};
use crate::types::{
    jitter_offset, labels_fingerprint, truncate, DurationSecs, Labels, MetricSeries, Time,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Writes scraped samples into base-duration chunks
pub struct Ingester {
    catalog: Arc<ChunkCatalog>,
    base_duration: DurationSecs,
    buf: ChunkBuf,
}

impl Ingester {
    /// Create an ingester producing chunks of `base_duration` seconds
    pub fn new(catalog: Arc<ChunkCatalog>, base_duration: DurationSecs) -> Result<Self, Error> {
        if base_duration <= 0 {
            return Err(Error::Configuration(format!(
                "base chunk duration must be > 0, got {}",
                base_duration
            )));
        }
        Ok(Self {
            catalog,
            base_duration,
            buf: ChunkBuf::new(),
        })
    }

    /// Ingest one scrape: a column of samples for one query
    ///
    /// `ts` is the scrape timestamp and `step` the scrape interval; `step`
    /// must divide the base duration. The timestamp is floored onto the
    /// window's step grid.
    pub fn write(
        &mut self,
        query_hash: &str,
        ts: Time,
        step: DurationSecs,
        samples: &[(Labels, f64)],
    ) -> Result<ChunkInfo, Error> {
        if step <= 0 || self.base_duration % step != 0 {
            return Err(Error::Configuration(format!(
                "scrape step {} does not divide base duration {}",
                step, self.base_duration
            )));
        }

        let jitter = jitter_offset(query_hash, self.base_duration);
        let from = truncate(ts - jitter, self.base_duration) + jitter;
        let columns = (self.base_duration / step) as usize;
        let column = ((ts - from) / step) as usize;
        let column_ts = from + column as i64 * step;

        // Seed the accumulator with the fresh column; the previous file only
        // fills slots the scrape did not provide.
        let mut acc: HashMap<u64, MetricSeries> = HashMap::with_capacity(samples.len());
        for (labels, value) in samples {
            let series = acc
                .entry(labels_fingerprint(labels))
                .or_insert_with(|| MetricSeries::new(labels.clone(), columns));
            series.values[column] = *value;
        }

        let prev = self
            .catalog
            .query_chunks(query_hash)
            .into_iter()
            .find(|c| c.from == from && c.duration == self.base_duration);

        let mut last_ts = column_ts;
        if let Some(prev) = &prev {
            if prev.step == step {
                let mut reader = ChunkReader::open_from_info(prev)?;
                let result = reader.read_metrics(
                    from,
                    from + self.base_duration,
                    step,
                    aggregation::last_value,
                    &mut acc,
                );
                reader.close();
                result?;
                last_ts = last_ts.max(prev.last_ts);
            } else {
                // Scrape interval changed mid-window; the old columns cannot
                // be placed on the new grid
                tracing::warn!(
                    query_hash,
                    old_step = prev.step,
                    new_step = step,
                    "step changed mid-window, dropping previous chunk data"
                );
            }
        }

        let mut writer =
            ChunkWriter::create(from, last_ts, self.base_duration, step, &mut self.buf)?;

        let mut fingerprints: Vec<u64> = acc.keys().copied().collect();
        fingerprints.sort_unstable();
        for fp in fingerprints {
            writer.write_metric(&acc[&fp])?;
        }

        let dir = self.catalog.ensure_query_dir(query_hash)?;
        let info = writer.persist(&dir, query_hash)?;
        metrics::record_chunk_write("ingest");

        let old: Vec<ChunkInfo> = prev.into_iter().collect();
        let unlink = self.catalog.supersede(info.clone(), &old);
        for path in unlink {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete replaced chunk");
            }
        }
        Ok(info)
    }
}

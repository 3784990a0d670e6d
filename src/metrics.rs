//! Metrics and telemetry for the chunk cache
//!
//! This module provides Prometheus metrics for monitoring ingestion,
//! compaction progress, and data integrity.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

lazy_static! {
    // === Compaction ===

    /// Chunks produced by compaction, labeled by rung
    pub static ref COMPACTED_CHUNKS: CounterVec = register_counter_vec!(
        "promcache_compacted_chunks_total",
        "Chunks produced by compaction",
        &["src_duration", "dst_duration"]
    ).unwrap();

    /// Compaction tasks remaining in the current planning cycle
    pub static ref PENDING_COMPACTIONS: Gauge = register_gauge!(
        "promcache_pending_compactions",
        "Compaction tasks remaining in the current planning cycle"
    ).unwrap();

    /// Compaction tasks that failed
    pub static ref COMPACTION_FAILURES: CounterVec = register_counter_vec!(
        "promcache_compaction_failures_total",
        "Compaction tasks that failed, by reason",
        &["reason"]
    ).unwrap();

    /// Compaction tasks skipped because their snapshot went stale
    pub static ref STALE_TASKS: Counter = register_counter!(
        "promcache_stale_compaction_tasks_total",
        "Compaction tasks skipped because sources left the catalog"
    ).unwrap();

    // === Chunk files ===

    /// Chunk files written, by writer
    pub static ref CHUNK_WRITES: CounterVec = register_counter_vec!(
        "promcache_chunk_writes_total",
        "Chunk files published, by writer",
        &["writer"]
    ).unwrap();

    /// Chunk files currently referenced by the catalog
    pub static ref CHUNKS_ON_DISK: Gauge = register_gauge!(
        "promcache_chunks_on_disk",
        "Chunk files currently referenced by the catalog"
    ).unwrap();

    // === Data integrity ===

    /// Corrupt chunk files quarantined at startup
    pub static ref QUARANTINED_CHUNKS: Counter = register_counter!(
        "promcache_quarantined_chunks_total",
        "Corrupt chunk files renamed aside and dropped from the catalog"
    ).unwrap();

    /// Orphaned files removed at startup
    pub static ref ORPHANS_REAPED: Counter = register_counter!(
        "promcache_orphans_reaped_total",
        "Temp files and superseded chunks removed by the startup scan"
    ).unwrap();
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding
/// fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a published chunk file
#[inline]
pub fn record_chunk_write(writer: &str) {
    CHUNK_WRITES.with_label_values(&[writer]).inc();
}

/// Record a completed compaction task
#[inline]
pub fn record_compaction(src_duration: i64, dst_duration: i64) {
    COMPACTED_CHUNKS
        .with_label_values(&[&src_duration.to_string(), &dst_duration.to_string()])
        .inc();
}

/// Record a failed compaction task
#[inline]
pub fn record_compaction_failure(reason: &str) {
    COMPACTION_FAILURES.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_compaction() {
        record_compaction(3600, 14400);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("promcache_compacted_chunks_total"));
    }

    #[test]
    fn test_gather_metrics() {
        PENDING_COMPACTIONS.set(0.0);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("promcache_pending_compactions"));
    }
}

//! Core data types used throughout the chunk cache
//!
//! This module defines the fundamental data structures shared across the
//! system:
//!
//! # Key Types
//!
//! - **`Time`**: integer seconds since the Unix epoch
//! - **`DurationSecs`**: integer seconds; chunk durations and steps
//! - **`Labels`**: ordered label set identifying one series within a query
//! - **`MetricSeries`**: a label set plus a fixed-grid row of samples
//!
//! All time arithmetic is integer arithmetic. Floating point is reserved for
//! sample values only.

use std::collections::BTreeMap;

/// Seconds since the Unix epoch.
pub type Time = i64;

/// A span of time in whole seconds.
///
/// Chunk durations and steps are both expressed in these units; a step is a
/// `DurationSecs` that is strictly positive and divides its chunk's duration.
pub type DurationSecs = i64;

/// Ordered label set for one series.
///
/// `BTreeMap` keeps keys unique and iteration lexicographic, which makes the
/// canonical byte encoding and the fingerprint independent of insertion
/// order.
pub type Labels = BTreeMap<String, String>;

/// Bit pattern encoding a missing sample.
///
/// This is the Prometheus staleness-marker NaN. It is preserved bit-exactly
/// through chunk write/read so that "missing" survives round trips, while
/// still comparing as NaN everywhere arithmetic meets it.
pub const MISSING_SAMPLE_BITS: u64 = 0x7ff0_0000_0000_0002;

/// The missing-sample value.
#[inline]
pub fn missing_sample() -> f64 {
    f64::from_bits(MISSING_SAMPLE_BITS)
}

/// Whether a sample counts as missing for merge purposes.
///
/// Any NaN is treated as missing: NaN produced by arithmetic and the
/// dedicated missing pattern merge identically.
#[inline]
pub fn is_missing(v: f64) -> bool {
    v.is_nan()
}

/// Truncate `ts` down to a multiple of `d`.
///
/// Uses euclidean remainder so pre-epoch timestamps truncate toward minus
/// infinity rather than toward zero.
#[inline]
pub fn truncate(ts: Time, d: DurationSecs) -> Time {
    ts - ts.rem_euclid(d)
}

/// One series within a chunk: a label set and a fixed-grid row of samples.
///
/// `values.len()` always equals the owning chunk's column count
/// (`duration / step`); columns with no data hold the missing sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    /// Label set identifying this series within its query.
    pub labels: Labels,

    /// Sample row aligned on the chunk's time grid.
    pub values: Vec<f64>,
}

impl MetricSeries {
    /// Create a series with `columns` missing samples.
    pub fn new(labels: Labels, columns: usize) -> Self {
        Self {
            labels,
            values: vec![missing_sample(); columns],
        }
    }

    /// Fingerprint of this series' label set.
    pub fn fingerprint(&self) -> u64 {
        labels_fingerprint(&self.labels)
    }
}

/// Calculate the 64-bit fingerprint of a label set.
///
/// Keys are hashed in sorted order (which `Labels` iteration already
/// guarantees), so the fingerprint is independent of how the set was built.
pub fn labels_fingerprint(labels: &Labels) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for (key, value) in labels {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

/// Deterministic pseudo-random jitter for a query hash.
///
/// A pure function of the query hash: the same input always produces the
/// same value, across processes and restarts. Callers reduce it modulo a
/// chunk duration to obtain that duration's alignment offset.
pub fn query_jitter(query_hash: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    query_hash.hash(&mut hasher);
    hasher.finish()
}

/// Per-duration alignment offset for a query, in `[0, duration)`.
///
/// Chunk start timestamps satisfy `(from - offset) % duration == 0`. The
/// offset staggers bucket boundaries across queries so compaction work is
/// spread over wall-clock time instead of spiking at duration multiples.
pub fn jitter_offset(query_hash: &str, duration: DurationSecs) -> DurationSecs {
    (query_jitter(query_hash) % duration as u64) as DurationSecs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate(3700, 3600), 3600);
        assert_eq!(truncate(3600, 3600), 3600);
        assert_eq!(truncate(3599, 3600), 0);
        // Pre-epoch timestamps truncate toward minus infinity
        assert_eq!(truncate(-1, 3600), -3600);
    }

    #[test]
    fn test_missing_sample_roundtrip() {
        let v = missing_sample();
        assert!(is_missing(v));
        assert_eq!(v.to_bits(), MISSING_SAMPLE_BITS);
        // Plain NaN is also missing, but carries different bits
        assert!(is_missing(f64::NAN));
        assert_ne!(f64::NAN.to_bits(), MISSING_SAMPLE_BITS);
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let mut a = Labels::new();
        a.insert("host".to_string(), "web-01".to_string());
        a.insert("dc".to_string(), "us-east".to_string());

        let mut b = Labels::new();
        b.insert("dc".to_string(), "us-east".to_string());
        b.insert("host".to_string(), "web-01".to_string());

        assert_eq!(labels_fingerprint(&a), labels_fingerprint(&b));

        let mut c = a.clone();
        c.insert("host".to_string(), "web-02".to_string());
        assert_ne!(labels_fingerprint(&a), labels_fingerprint(&c));
    }

    #[test]
    fn test_jitter_deterministic() {
        assert_eq!(query_jitter("abc123"), query_jitter("abc123"));
        assert_eq!(jitter_offset("abc123", 3600), jitter_offset("abc123", 3600));

        let off = jitter_offset("abc123", 3600);
        assert!((0..3600).contains(&off));
    }
}

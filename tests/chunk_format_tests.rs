//! Chunk format round-trip tests
//!
//! Writing a set of series into a chunk and reading it back at the chunk's
//! own step must return bit-identical label sets and sample values,
//! including the missing-sample NaN pattern.

use promcache::aggregation;
use promcache::storage::chunk::ChunkInfo;
use promcache::storage::reader::ChunkReader;
use promcache::storage::writer::{ChunkBuf, ChunkWriter};
use promcache::types::{
    is_missing, labels_fingerprint, missing_sample, Labels, MetricSeries, MISSING_SAMPLE_BITS,
};
use std::collections::HashMap;
use tempfile::TempDir;

fn series(pairs: &[(&str, &str)], values: Vec<f64>) -> MetricSeries {
    let mut labels = Labels::new();
    for (k, v) in pairs {
        labels.insert(k.to_string(), v.to_string());
    }
    MetricSeries { labels, values }
}

#[test]
fn test_multi_series_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("q");
    std::fs::create_dir_all(&dir).unwrap();

    let columns = 60usize;
    let mut input = vec![
        series(
            &[("job", "node"), ("instance", "db-1:9100")],
            (0..columns).map(|i| i as f64 * 0.25).collect(),
        ),
        series(
            &[("job", "node"), ("instance", "db-2:9100")],
            (0..columns).map(|i| -(i as f64)).collect(),
        ),
        series(
            &[("job", "postgres")],
            vec![missing_sample(); columns],
        ),
    ];
    // Scatter some gaps and odd values through the first series
    input[0].values[7] = missing_sample();
    input[0].values[13] = f64::INFINITY;
    input[0].values[14] = f64::NEG_INFINITY;
    input[0].values[15] = -0.0;

    let mut buf = ChunkBuf::new();
    let mut writer = ChunkWriter::create(7200, 10740, 3600, 60, &mut buf).unwrap();
    for s in &input {
        writer.write_metric(s).unwrap();
    }
    let info = writer.persist(&dir, "q").unwrap();

    // The file name alone reconstructs the descriptor
    let reparsed = ChunkInfo::from_path(&info.path).unwrap();
    assert_eq!(reparsed, info);

    let mut reader = ChunkReader::open_from_info(&info).unwrap();
    assert_eq!(reader.header().series_count, 3);

    let mut acc = HashMap::new();
    reader
        .read_metrics(7200, 10800, 60, aggregation::last_value, &mut acc)
        .unwrap();
    reader.close();

    assert_eq!(acc.len(), 3);
    for s in &input {
        let got = acc
            .get(&labels_fingerprint(&s.labels))
            .expect("series lost in round trip");
        assert_eq!(got.labels, s.labels);
        assert_eq!(got.values.len(), s.values.len());
        for (i, (w, r)) in s.values.iter().zip(got.values.iter()).enumerate() {
            assert_eq!(
                w.to_bits(),
                r.to_bits(),
                "value {} not bit-identical after round trip",
                i
            );
        }
    }
}

#[test]
fn test_missing_bit_pattern_preserved() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("q");
    std::fs::create_dir_all(&dir).unwrap();

    let mut values = vec![missing_sample(); 60];
    values[30] = 1.0;

    let mut buf = ChunkBuf::new();
    let mut writer = ChunkWriter::create(0, 1800, 3600, 60, &mut buf).unwrap();
    writer
        .write_metric(&series(&[("job", "node")], values))
        .unwrap();
    let info = writer.persist(&dir, "q").unwrap();

    let reader = ChunkReader::open_from_info(&info).unwrap();
    let mut acc = HashMap::new();
    reader
        .read_metrics(0, 3600, 60, aggregation::last_value, &mut acc)
        .unwrap();

    let got = &acc[&labels_fingerprint(&series(&[("job", "node")], vec![]).labels)];
    assert_eq!(got.values[0].to_bits(), MISSING_SAMPLE_BITS);
    assert!(is_missing(got.values[59]));
    assert_eq!(got.values[30], 1.0);
}

#[test]
fn test_empty_chunk_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("q");
    std::fs::create_dir_all(&dir).unwrap();

    let mut buf = ChunkBuf::new();
    let writer = ChunkWriter::create(0, 3540, 3600, 60, &mut buf).unwrap();
    let info = writer.persist(&dir, "q").unwrap();

    let reader = ChunkReader::open_from_info(&info).unwrap();
    assert_eq!(reader.header().series_count, 0);

    let mut acc = HashMap::new();
    reader
        .read_metrics(0, 3600, 60, aggregation::last_value, &mut acc)
        .unwrap();
    assert!(acc.is_empty());
}

#[test]
fn test_large_series_count() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("q");
    std::fs::create_dir_all(&dir).unwrap();

    let mut buf = ChunkBuf::new();
    let mut writer = ChunkWriter::create(0, 3540, 3600, 60, &mut buf).unwrap();
    for i in 0..500 {
        writer
            .write_metric(&series(
                &[("job", "node"), ("cpu", &i.to_string())],
                vec![i as f64; 60],
            ))
            .unwrap();
    }
    let info = writer.persist(&dir, "q").unwrap();

    let reader = ChunkReader::open_from_info(&info).unwrap();
    assert_eq!(reader.header().series_count, 500);

    let mut acc = HashMap::new();
    reader
        .read_metrics(0, 3600, 60, aggregation::last_value, &mut acc)
        .unwrap();
    assert_eq!(acc.len(), 500);
}

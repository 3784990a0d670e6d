//! End-to-end compaction tests
//!
//! These tests cover the full planner -> worker -> catalog pipeline:
//! - Single-level compaction of a fully populated bucket
//! - Incomplete sources and partial buckets staying untouched
//! - Jitter-aligned bucket boundaries
//! - Sample fidelity between sources and destination
//! - Planner idempotence after compaction
//! - Concurrent reads observing either sources or destination, never a mix
//! - The background service end to end

use promcache::aggregation;
use promcache::catalog::ChunkCatalog;
use promcache::services::compactor::{compact, plan_tasks, CompactionTask, Compactor};
use promcache::services::{CompactionConfig, CompactionService, Service};
use promcache::storage::chunk::ChunkInfo;
use promcache::storage::writer::{ChunkBuf, ChunkWriter};
use promcache::types::{
    is_missing, jitter_offset, labels_fingerprint, DurationSecs, Labels, MetricSeries, Time,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

fn labels(job: &str) -> Labels {
    let mut l = Labels::new();
    l.insert("job".to_string(), job.to_string());
    l
}

/// Publish one complete chunk whose sample at column i is `from + i * step`
fn publish_complete(
    data_dir: &Path,
    query_hash: &str,
    from: Time,
    duration: DurationSecs,
    step: DurationSecs,
) -> ChunkInfo {
    let dir = data_dir.join(query_hash);
    std::fs::create_dir_all(&dir).unwrap();
    let mut buf = ChunkBuf::new();
    let mut writer =
        ChunkWriter::create(from, from + duration - step, duration, step, &mut buf).unwrap();
    let columns = (duration / step) as usize;
    let values: Vec<f64> = (0..columns).map(|i| (from + i as i64 * step) as f64).collect();
    writer
        .write_metric(&MetricSeries {
            labels: labels("node"),
            values,
        })
        .unwrap();
    writer.persist(&dir, query_hash).unwrap()
}

/// Publish an incomplete chunk missing its final column
fn publish_incomplete(
    data_dir: &Path,
    query_hash: &str,
    from: Time,
    duration: DurationSecs,
    step: DurationSecs,
) -> ChunkInfo {
    let dir = data_dir.join(query_hash);
    std::fs::create_dir_all(&dir).unwrap();
    let mut buf = ChunkBuf::new();
    let mut writer =
        ChunkWriter::create(from, from + duration - 2 * step, duration, step, &mut buf).unwrap();
    let columns = (duration / step) as usize;
    let mut values: Vec<f64> = (0..columns).map(|i| (from + i as i64 * step) as f64).collect();
    *values.last_mut().unwrap() = promcache::types::missing_sample();
    writer
        .write_metric(&MetricSeries {
            labels: labels("node"),
            values,
        })
        .unwrap();
    writer.persist(&dir, query_hash).unwrap()
}

fn rung_3600_14400() -> Compactor {
    Compactor {
        src_chunk_duration_seconds: 3600,
        dst_chunk_duration_seconds: 14400,
    }
}

/// Read a range through the catalog the way a query would
fn read_range(
    catalog: &ChunkCatalog,
    query_hash: &str,
    from: Time,
    to: Time,
    step: DurationSecs,
) -> HashMap<u64, MetricSeries> {
    catalog
        .read_range(query_hash, from, to, step, aggregation::last_value)
        .unwrap()
}

#[test]
fn test_single_level_compaction() {
    let tmp = TempDir::new().unwrap();
    let query = "q-single";
    let jitter = jitter_offset(query, 3600);

    let sources: Vec<ChunkInfo> = (0..4)
        .map(|i| publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60))
        .collect();

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    assert_eq!(catalog.query_chunks(query).len(), 4);

    let tasks = plan_tasks(&rung_3600_14400(), query, jitter, &catalog.query_chunks(query));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].dst_chunk_ts, jitter);
    // Sources exactly tile the destination
    assert_eq!(
        tasks[0].src.len() as i64 * 3600,
        tasks[0].compactor.dst_chunk_duration_seconds
    );

    let mut buf = ChunkBuf::new();
    let dst = compact(&catalog, &tasks[0], &mut buf).unwrap();

    let remaining = catalog.query_chunks(query);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].from, jitter);
    assert_eq!(remaining[0].duration, 14400);
    assert_eq!(remaining[0].step, 60);
    assert_eq!(remaining[0].last_ts, jitter + 14400 - 60);
    assert!(remaining[0].is_complete());
    assert!(dst.path.exists());

    for src in &sources {
        assert!(!src.path.exists(), "source file survived compaction");
    }
}

#[test]
fn test_incomplete_source_blocks_bucket() {
    let tmp = TempDir::new().unwrap();
    let query = "q-incomplete";
    let jitter = jitter_offset(query, 3600);

    for i in 0..3 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }
    publish_incomplete(tmp.path(), query, jitter + 3 * 3600, 3600, 60);

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    let tasks = plan_tasks(&rung_3600_14400(), query, jitter, &catalog.query_chunks(query));

    assert!(tasks.is_empty());
    assert_eq!(catalog.query_chunks(query).len(), 4);
}

#[test]
fn test_jitter_aligned_bucket() {
    let tmp = TempDir::new().unwrap();
    let query = "q-jittered";
    let jitter = jitter_offset(query, 3600);

    for i in 0..4 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    let tasks = plan_tasks(&rung_3600_14400(), query, jitter, &catalog.query_chunks(query));

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].dst_chunk_ts, jitter);
    assert_eq!((tasks[0].dst_chunk_ts - jitter) % 14400, 0);
}

#[test]
fn test_compaction_preserves_samples() {
    let tmp = TempDir::new().unwrap();
    let query = "q-fidelity";
    let jitter = jitter_offset(query, 3600);

    for i in 0..4 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    let before = read_range(&catalog, query, jitter, jitter + 14400, 60);

    let tasks = plan_tasks(&rung_3600_14400(), query, jitter, &catalog.query_chunks(query));
    let mut buf = ChunkBuf::new();
    compact(&catalog, &tasks[0], &mut buf).unwrap();

    let after = read_range(&catalog, query, jitter, jitter + 14400, 60);

    let fp = labels_fingerprint(&labels("node"));
    let (before, after) = (&before[&fp], &after[&fp]);
    assert_eq!(before.values.len(), after.values.len());
    for (i, (b, a)) in before.values.iter().zip(after.values.iter()).enumerate() {
        assert_eq!(
            b.to_bits(),
            a.to_bits(),
            "sample {} changed across compaction",
            i
        );
        assert!(!is_missing(*a), "sample {} went missing", i);
    }
}

#[test]
fn test_planner_idempotent_after_compaction() {
    let tmp = TempDir::new().unwrap();
    let query = "q-idem";
    let jitter = jitter_offset(query, 3600);

    for i in 0..4 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    let rung = rung_3600_14400();
    let tasks = plan_tasks(&rung, query, jitter, &catalog.query_chunks(query));
    assert_eq!(tasks.len(), 1);

    let mut buf = ChunkBuf::new();
    compact(&catalog, &tasks[0], &mut buf).unwrap();

    // Unchanged catalog, second pass: nothing left to do
    let again = plan_tasks(&rung, query, jitter, &catalog.query_chunks(query));
    assert!(again.is_empty());
}

#[test]
fn test_two_rung_ladder() {
    let tmp = TempDir::new().unwrap();
    let query = "q-ladder";
    let jitter = jitter_offset(query, 3600);

    // Twelve hours of base chunks
    for i in 0..12 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    let rungs = [
        rung_3600_14400(),
        Compactor {
            src_chunk_duration_seconds: 14400,
            dst_chunk_duration_seconds: 43200,
        },
    ];
    let mut buf = ChunkBuf::new();

    // First pass compacts the base chunks into three 4h chunks
    let tasks = plan_tasks(&rungs[0], query, jitter, &catalog.query_chunks(query));
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        compact(&catalog, task, &mut buf).unwrap();
    }

    // Second rung now sees a full bucket of 4h chunks
    let tasks = plan_tasks(&rungs[1], query, jitter, &catalog.query_chunks(query));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].dst_chunk_ts, jitter);
    compact(&catalog, &tasks[0], &mut buf).unwrap();

    let remaining = catalog.query_chunks(query);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].duration, 43200);
    assert!(remaining[0].is_complete());

    // Samples survived both hops
    let acc = read_range(&catalog, query, jitter, jitter + 43200, 60);
    let series = &acc[&labels_fingerprint(&labels("node"))];
    assert_eq!(series.values.len(), 720);
    for (i, v) in series.values.iter().enumerate() {
        assert_eq!(*v, (jitter + i as i64 * 60) as f64);
    }
}

#[test]
fn test_concurrent_reads_see_consistent_data() {
    let tmp = TempDir::new().unwrap();
    let query = "q-concurrent";
    let jitter = jitter_offset(query, 3600);

    for i in 0..4 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = Arc::new(ChunkCatalog::open(tmp.path()).unwrap());
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let reader_catalog = catalog.clone();
    let reader_stop = stop.clone();
    let reader = std::thread::spawn(move || {
        let fp = labels_fingerprint(&labels("node"));
        let mut passes = 0u32;
        while !reader_stop.load(std::sync::atomic::Ordering::Relaxed) {
            let acc = read_range(&reader_catalog, query, jitter, jitter + 14400, 60);
            let series = acc.get(&fp).expect("series disappeared mid-compaction");
            assert_eq!(series.values.len(), 240);
            for (i, v) in series.values.iter().enumerate() {
                let expected = (jitter + i as i64 * 60) as f64;
                assert_eq!(
                    *v, expected,
                    "column {} saw {} instead of {}: mixed source/destination read",
                    i, v, expected
                );
            }
            passes += 1;
        }
        passes
    });

    let tasks = plan_tasks(
        &rung_3600_14400(),
        query,
        jitter,
        &catalog.query_chunks(query),
    );
    let mut buf = ChunkBuf::new();
    compact(&catalog, &tasks[0], &mut buf).unwrap();

    // Let the reader observe the post-compaction state too
    std::thread::sleep(std::time::Duration::from_millis(50));
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let passes = reader.join().unwrap();
    assert!(passes > 0, "reader never completed a pass");
}

#[test]
fn test_stale_task_sources_detected() {
    let tmp = TempDir::new().unwrap();
    let query = "q-stale";
    let jitter = jitter_offset(query, 3600);

    for i in 0..4 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = ChunkCatalog::open(tmp.path()).unwrap();
    let tasks = plan_tasks(&rung_3600_14400(), query, jitter, &catalog.query_chunks(query));
    let task: CompactionTask = tasks.into_iter().next().unwrap();

    // Another actor compacts the bucket first
    let mut buf = ChunkBuf::new();
    compact(&catalog, &task, &mut buf).unwrap();

    // The stale task's sources are no longer referenced
    let stale = task
        .src
        .iter()
        .any(|s| !catalog.contains(query, &s.path));
    assert!(stale);
}

#[tokio::test]
async fn test_compaction_service_end_to_end() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let tmp = TempDir::new().unwrap();
    let query = "q-service";
    let jitter = jitter_offset(query, 3600);

    for i in 0..4 {
        publish_complete(tmp.path(), query, jitter + i * 3600, 3600, 60);
    }

    let catalog = Arc::new(ChunkCatalog::open(tmp.path()).unwrap());
    let config = CompactionConfig {
        interval_seconds: 1,
        workers_num: 2,
        compactors: vec![rung_3600_14400()],
    };
    let service = Arc::new(CompactionService::new(config, catalog.clone()).unwrap());

    let (tx, rx) = broadcast::channel(1);
    let handle = {
        let service = service.clone();
        tokio::spawn(async move { service.start(rx).await })
    };

    // Wait for the first cycle to land
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let chunks = catalog.query_chunks(query);
        if chunks.len() == 1 && chunks[0].duration == 14400 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "compaction service never compacted the bucket"
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_service_shutdown_without_work() {
    let tmp = TempDir::new().unwrap();
    let catalog = Arc::new(ChunkCatalog::open(tmp.path()).unwrap());
    let service = Arc::new(
        CompactionService::new(CompactionConfig::default(), catalog).unwrap(),
    );

    let (tx, rx) = broadcast::channel(1);
    let handle = {
        let service = service.clone();
        tokio::spawn(async move { service.start(rx).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send(()).unwrap();
    assert!(handle.await.unwrap().is_ok());
}

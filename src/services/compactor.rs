//! Compaction Service
//!
//! Merges adjacent, fully populated chunks into wider ones so that file
//! count stays bounded and range reads touch fewer files:
//!
//! - A planner runs on a fixed interval, snapshots the catalog, and groups
//!   each query's complete chunks into jitter-aligned destination buckets.
//! - Only full buckets become tasks; partial buckets are retried next cycle.
//! - A fixed pool of workers consumes tasks from a bounded channel, each
//!   owning a reusable scratch buffer.
//!
//! A task either fully succeeds (destination published, sources unlinked) or
//! fully fails (destination discarded, sources and catalog untouched).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant};

use crate::aggregation;
use crate::catalog::ChunkCatalog;
use crate::error::CompactionError;
use crate::metrics;
use crate::storage::chunk::ChunkInfo;
use crate::storage::reader::ChunkReader;
use crate::storage::writer::{ChunkBuf, ChunkWriter};
use crate::types::{jitter_offset, truncate, DurationSecs, Time};

use super::framework::{Service, ServiceError, ServiceStatus};

// ============================================================================
// Configuration
// ============================================================================

/// One rung of the compaction ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compactor {
    /// Duration of the chunks this rung consumes, in seconds
    pub src_chunk_duration_seconds: DurationSecs,

    /// Duration of the chunk this rung produces, in seconds
    pub dst_chunk_duration_seconds: DurationSecs,
}

/// Configuration for the compaction service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Seconds between planning cycles
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Number of concurrent compaction workers
    #[serde(default = "default_workers_num")]
    pub workers_num: usize,

    /// Ordered compaction ladder; may emit tasks at several rungs per cycle
    #[serde(default = "default_compactors")]
    pub compactors: Vec<Compactor>,
}

fn default_interval_seconds() -> u64 {
    600
}
fn default_workers_num() -> usize {
    1
}
fn default_compactors() -> Vec<Compactor> {
    vec![
        Compactor {
            src_chunk_duration_seconds: 3600,
            dst_chunk_duration_seconds: 4 * 3600,
        },
        Compactor {
            src_chunk_duration_seconds: 4 * 3600,
            dst_chunk_duration_seconds: 12 * 3600,
        },
    ]
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            workers_num: default_workers_num(),
            compactors: default_compactors(),
        }
    }
}

impl CompactionConfig {
    /// Planning interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Modulus reducing a query's raw jitter to its alignment offset
    ///
    /// The narrowest source duration in the ladder. Every rung uses the same
    /// offset so that a rung's output chunks land exactly on the next rung's
    /// bucket boundaries.
    pub fn jitter_modulus(&self) -> DurationSecs {
        self.compactors
            .iter()
            .map(|c| c.src_chunk_duration_seconds)
            .min()
            .unwrap_or(3600)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.workers_num == 0 {
            return Err("compaction.workers_num must be >= 1".to_string());
        }
        if self.interval_seconds == 0 {
            return Err("compaction.interval_seconds must be > 0".to_string());
        }
        for c in &self.compactors {
            if c.src_chunk_duration_seconds <= 0 {
                return Err(format!(
                    "compactor src duration must be > 0, got {}",
                    c.src_chunk_duration_seconds
                ));
            }
            if c.dst_chunk_duration_seconds <= c.src_chunk_duration_seconds {
                return Err(format!(
                    "compactor dst duration {} must exceed src duration {}",
                    c.dst_chunk_duration_seconds, c.src_chunk_duration_seconds
                ));
            }
            if c.dst_chunk_duration_seconds % c.src_chunk_duration_seconds != 0 {
                return Err(format!(
                    "compactor dst duration {} is not a multiple of src duration {}",
                    c.dst_chunk_duration_seconds, c.src_chunk_duration_seconds
                ));
            }
        }
        // Every rung must sit on the narrowest rung's grid, or the shared
        // jitter offset cannot align bucket boundaries with chunk starts
        let modulus = self.jitter_modulus();
        for c in &self.compactors {
            if c.src_chunk_duration_seconds % modulus != 0 {
                return Err(format!(
                    "compactor src duration {} is not a multiple of the narrowest src duration {}",
                    c.src_chunk_duration_seconds, modulus
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tasks and planning
// ============================================================================

/// One unit of compaction work: merge `src` into a single destination chunk
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Query whose chunks are being merged
    pub query_hash: String,

    /// Start timestamp of the destination chunk
    pub dst_chunk_ts: Time,

    /// Source chunks; together they tile the destination window
    pub src: Vec<ChunkInfo>,

    /// The ladder rung that produced this task
    pub compactor: Compactor,
}

impl fmt::Display for CompactionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src: Vec<String> = self.src.iter().map(|s| s.from.to_string()).collect();
        write!(
            f,
            "compaction task {} [{}]:{} -> {}:{}",
            self.query_hash,
            src.join(","),
            self.compactor.src_chunk_duration_seconds,
            self.dst_chunk_ts,
            self.compactor.dst_chunk_duration_seconds,
        )
    }
}

/// Group one query's chunks into destination buckets for one ladder rung
///
/// Only complete chunks of exactly the rung's source duration participate.
/// A bucket becomes a task only when it holds every source chunk the
/// destination needs (`dst_duration / src_duration` of them); partial
/// buckets wait for a later cycle.
///
/// `jitter` is the query's alignment offset; it must be smaller than every
/// source duration in the ladder (the service derives it from the narrowest
/// rung), which makes the reduction below a no-op on canonical configs.
pub fn plan_tasks(
    compactor: &Compactor,
    query_hash: &str,
    jitter: DurationSecs,
    chunks: &[ChunkInfo],
) -> Vec<CompactionTask> {
    let src_duration = compactor.src_chunk_duration_seconds;
    let dst_duration = compactor.dst_chunk_duration_seconds;
    let jitter = jitter % src_duration;

    let mut buckets: HashMap<Time, Vec<ChunkInfo>> = HashMap::new();
    for chunk in chunks {
        if chunk.duration != src_duration {
            continue;
        }
        if !chunk.is_complete() {
            continue;
        }
        let dst_ts = truncate(chunk.from - jitter, dst_duration) + jitter;
        buckets.entry(dst_ts).or_default().push(chunk.clone());
    }

    let needed = (dst_duration / src_duration) as usize;
    let mut tasks: Vec<CompactionTask> = buckets
        .into_iter()
        .filter(|(_, src)| src.len() == needed)
        .map(|(dst_chunk_ts, src)| CompactionTask {
            query_hash: query_hash.to_string(),
            dst_chunk_ts,
            src,
            compactor: *compactor,
        })
        .collect();
    tasks.sort_by_key(|t| t.dst_chunk_ts);
    tasks
}

// ============================================================================
// Task execution
// ============================================================================

/// Execute one compaction task
///
/// Reads every source into an accumulator, writes the destination through
/// the caller's scratch buffer, publishes it (fsync before the catalog sees
/// it), swaps the catalog under one exclusive guard, and unlinks the sources
/// outside the lock. Any failure before the swap leaves sources and catalog
/// untouched.
pub fn compact(
    catalog: &ChunkCatalog,
    task: &CompactionTask,
    buf: &mut ChunkBuf,
) -> Result<ChunkInfo, CompactionError> {
    if task.src.is_empty() {
        return Err(CompactionError::EmptySources);
    }
    let mut src = task.src.clone();
    src.sort_by_key(|c| c.from);

    let step = src[0].step;
    for s in &src[1..] {
        if s.step != step {
            return Err(CompactionError::StepMismatch {
                first: step,
                other: s.step,
            });
        }
    }

    let dst_duration = task.compactor.dst_chunk_duration_seconds;
    let dst_from = task.dst_chunk_ts;

    let mut acc = HashMap::new();
    for info in &src {
        let mut reader = ChunkReader::open_from_info(info)?;
        let result = reader.read_metrics(
            dst_from,
            dst_from + dst_duration,
            step,
            aggregation::last_value,
            &mut acc,
        );
        reader.close();
        result?;
    }

    let mut writer = ChunkWriter::create(
        dst_from,
        dst_from + dst_duration - step,
        dst_duration,
        step,
        buf,
    )?;
    let mut fingerprints: Vec<u64> = acc.keys().copied().collect();
    fingerprints.sort_unstable();
    for fp in fingerprints {
        writer.write_metric(&acc[&fp])?;
    }

    let dir = catalog.ensure_query_dir(&task.query_hash)?;
    let info = writer.persist(&dir, &task.query_hash)?;
    metrics::record_chunk_write("compaction");

    let unlink = catalog.supersede(info.clone(), &src);
    for path in unlink {
        tracing::info!(path = %path.display(), "deleting chunk after compaction");
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete chunk");
        }
    }

    metrics::record_compaction(
        task.compactor.src_chunk_duration_seconds,
        task.compactor.dst_chunk_duration_seconds,
    );
    Ok(info)
}

// ============================================================================
// Service
// ============================================================================

/// Background service planning and executing compaction
pub struct CompactionService {
    config: CompactionConfig,
    catalog: Arc<ChunkCatalog>,
    status: RwLock<ServiceStatus>,
}

impl CompactionService {
    /// Create a new compaction service
    pub fn new(config: CompactionConfig, catalog: Arc<ChunkCatalog>) -> Result<Self, ServiceError> {
        config
            .validate()
            .map_err(ServiceError::InitializationFailed)?;
        Ok(Self {
            config,
            catalog,
            status: RwLock::new(ServiceStatus::Stopped),
        })
    }

    /// Plan one cycle and feed the tasks to the workers
    ///
    /// The snapshot is cloned before planning, so no catalog lock is held
    /// while tasks are generated or sent. The pending gauge tracks how many
    /// tasks of this cycle are still waiting to be handed over.
    async fn run_cycle(&self, tx: &mpsc::Sender<CompactionTask>) {
        tracing::info!("compaction iteration started");
        let snapshot = self.catalog.read_snapshot();
        let modulus = self.config.jitter_modulus();

        let mut tasks = Vec::new();
        for (query_hash, chunks) in &snapshot {
            let jitter = jitter_offset(query_hash, modulus);
            for compactor in &self.config.compactors {
                tasks.extend(plan_tasks(compactor, query_hash, jitter, chunks));
            }
        }

        let total = tasks.len();
        for (i, task) in tasks.into_iter().enumerate() {
            metrics::PENDING_COMPACTIONS.set((total - i - 1) as f64);
            if tx.send(task).await.is_err() {
                // Workers are gone; shutdown is in progress
                return;
            }
        }
    }
}

/// Worker loop: drain tasks until the channel closes
///
/// The chunk reads, the destination write, and the fsyncs in `compact` are
/// blocking filesystem calls, so each task runs on the blocking thread pool;
/// the runtime workers driving the planner's select loop stay free.
async fn worker_loop(
    id: usize,
    catalog: Arc<ChunkCatalog>,
    rx: Arc<Mutex<mpsc::Receiver<CompactionTask>>>,
) {
    tracing::info!(worker = id, "compaction worker started");
    let mut buf = ChunkBuf::new();

    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else { break };

        // The task was planned from a snapshot; if any source has left the
        // catalog since, the bucket was already handled elsewhere.
        let stale = task
            .src
            .iter()
            .any(|s| !catalog.contains(&task.query_hash, &s.path));
        if stale {
            tracing::info!(task = %task, "skipping stale compaction task");
            metrics::STALE_TASKS.inc();
            continue;
        }

        let started = Instant::now();
        let io_catalog = Arc::clone(&catalog);
        let scratch = std::mem::take(&mut buf);
        let joined = tokio::task::spawn_blocking(move || {
            let mut scratch = scratch;
            let result = compact(&io_catalog, &task, &mut scratch);
            (result, scratch, task)
        })
        .await;

        let (result, scratch, task) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::record_compaction_failure("panic");
                tracing::error!(worker = id, error = %e, "compaction task panicked");
                buf = ChunkBuf::new();
                continue;
            }
        };
        buf = scratch;

        match result {
            Ok(_) => {
                tracing::info!(
                    task = %task,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "compaction task done"
                );
            }
            Err(e) => {
                metrics::record_compaction_failure(failure_reason(&e));
                tracing::error!(task = %task, error = %e, "compaction task failed");
            }
        }
    }
    tracing::info!(worker = id, "compaction worker stopped");
}

fn failure_reason(e: &CompactionError) -> &'static str {
    match e {
        CompactionError::EmptySources => "empty_sources",
        CompactionError::StepMismatch { .. } => "step_mismatch",
        CompactionError::Chunk(_) => "chunk",
        CompactionError::Io(_) => "io",
    }
}

#[async_trait::async_trait]
impl Service for CompactionService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;

        if self.config.compactors.is_empty() {
            tracing::warn!("no compactors configured, deactivating compaction");
            let _ = shutdown.recv().await;
            *self.status.write() = ServiceStatus::Stopped;
            return Ok(());
        }

        let workers_num = self.config.workers_num;
        let (tx, rx) = mpsc::channel::<CompactionTask>(workers_num);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(workers_num);
        for id in 0..workers_num {
            workers.push(tokio::spawn(worker_loop(
                id,
                self.catalog.clone(),
                rx.clone(),
            )));
        }

        let mut tick = interval(self.config.interval());
        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("compaction service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "compaction shutdown receiver lagged");
                        }
                    }
                }
                _ = tick.tick() => {
                    self.run_cycle(&tx).await;
                }
            }
        }

        // Closing the channel lets workers drain in-flight tasks and exit
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "compaction"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

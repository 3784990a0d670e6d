//! Chunk catalog: the in-memory index of chunks on disk
//!
//! A process-wide mapping `query_hash -> QueryData`, guarded by a
//! reader-writer lock. The catalog is the source of truth for readers:
//! a file that is on disk but not referenced here does not exist as far as
//! queries are concerned.
//!
//! On startup the catalog scans the data directory and rebuilds itself from
//! chunk file names, reading only the fixed header of each file to verify it
//! is what its name claims. The scan also repairs the directory: temp files
//! are unlinked, corrupt chunks are quarantined, duplicate and superseded
//! chunks are reaped.
//!
//! All mutation paths hold the exclusive guard only for the in-memory swap;
//! file I/O happens strictly outside the lock.

use crate::error::Error;
use crate::metrics;
use crate::storage::chunk::{
    ChunkHeader, ChunkInfo, CHUNK_SUFFIX, HEADER_LEN, QUARANTINE_SUFFIX, TMP_MARKER,
};
use crate::storage::directory::DirLock;
use crate::storage::reader::ChunkReader;
use crate::types::Time;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Per-query state held by the catalog
#[derive(Debug, Default)]
pub struct QueryData {
    /// Chunk descriptors keyed by file path
    pub chunks_on_disk: HashMap<PathBuf, ChunkInfo>,
}

/// In-memory index mapping query hashes to their chunks on disk
#[derive(Debug)]
pub struct ChunkCatalog {
    data_dir: PathBuf,
    data: RwLock<HashMap<String, QueryData>>,
    _dir_lock: DirLock,
}

impl ChunkCatalog {
    /// Acquire the data directory and rebuild the catalog from disk
    ///
    /// Fails fast if another process holds the directory or the directory
    /// cannot be read.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let data_dir = data_dir.into();
        let dir_lock = DirLock::acquire(&data_dir)?;
        let data = Self::scan(&data_dir)?;

        let total: usize = data.values().map(|q| q.chunks_on_disk.len()).sum();
        metrics::CHUNKS_ON_DISK.set(total as f64);
        tracing::info!(
            data_dir = %data_dir.display(),
            queries = data.len(),
            chunks = total,
            "chunk catalog loaded"
        );

        Ok(Self {
            data_dir,
            data: RwLock::new(data),
            _dir_lock: dir_lock,
        })
    }

    /// Root of the data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding one query's chunks, created if absent
    pub fn ensure_query_dir(&self, query_hash: &str) -> std::io::Result<PathBuf> {
        let dir = self.data_dir.join(query_hash);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Cloned point-in-time view of every chunk in the catalog
    ///
    /// Taken under the shared guard; callers (the planner above all) work on
    /// the clone and never hold the lock while generating tasks.
    pub fn read_snapshot(&self) -> Vec<(String, Vec<ChunkInfo>)> {
        let data = self.data.read();
        data.iter()
            .map(|(hash, q)| (hash.clone(), q.chunks_on_disk.values().cloned().collect()))
            .collect()
    }

    /// Cloned descriptors of one query's chunks
    pub fn query_chunks(&self, query_hash: &str) -> Vec<ChunkInfo> {
        let data = self.data.read();
        data.get(query_hash)
            .map(|q| q.chunks_on_disk.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a chunk file is still referenced by the catalog
    pub fn contains(&self, query_hash: &str, path: &Path) -> bool {
        let data = self.data.read();
        data.get(query_hash)
            .map(|q| q.chunks_on_disk.contains_key(path))
            .unwrap_or(false)
    }

    /// Chunks overlapping `[from, to)` for a query, widest duration first
    ///
    /// Sources are ordered so that, merged first-writer-wins, a reader never
    /// double-counts: where a wide chunk and its not-yet-unlinked sources
    /// both cover a timestamp, the wide chunk's value lands first and the
    /// narrow one is ignored.
    pub fn plan_read(&self, query_hash: &str, from: Time, to: Time) -> Vec<ChunkInfo> {
        let mut chunks: Vec<ChunkInfo> = {
            let data = self.data.read();
            match data.get(query_hash) {
                Some(q) => q
                    .chunks_on_disk
                    .values()
                    .filter(|c| c.overlaps(from, to))
                    .cloned()
                    .collect(),
                None => return Vec::new(),
            }
        };
        chunks.sort_by(|a, b| b.duration.cmp(&a.duration).then(a.from.cmp(&b.from)));
        chunks
    }

    /// Read `[from, to)` for a query at `step`, merging across its chunks
    ///
    /// Chunks are merged first-writer-wins in `plan_read` order, so wider
    /// chunks shadow any sources they superseded. If a planned chunk
    /// vanishes before it can be opened (compaction unlinked it between the
    /// snapshot and the open), the whole pass restarts from a fresh
    /// snapshot; a partially merged accumulator is never returned.
    pub fn read_range<F>(
        &self,
        query_hash: &str,
        from: Time,
        to: Time,
        step: i64,
        fold: F,
    ) -> Result<HashMap<u64, crate::types::MetricSeries>, Error>
    where
        F: Fn(f64, f64) -> f64 + Copy,
    {
        const MAX_ATTEMPTS: usize = 3;

        'attempt: for _ in 0..MAX_ATTEMPTS {
            let plan = self.plan_read(query_hash, from, to);
            let mut acc = HashMap::new();
            for info in &plan {
                let mut reader = match ChunkReader::open_from_info(info) {
                    Ok(reader) => reader,
                    Err(crate::error::ChunkError::Io(e))
                        if e.kind() == std::io::ErrorKind::NotFound
                            && !self.contains(query_hash, &info.path) =>
                    {
                        // Superseded after the snapshot; replan
                        continue 'attempt;
                    }
                    Err(e) => return Err(e.into()),
                };
                let result = reader.read_metrics(from, to, step, fold, &mut acc);
                reader.close();
                result?;
            }
            return Ok(acc);
        }
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("chunks for {} kept vanishing mid-read", query_hash),
        )))
    }

    /// Insert a chunk descriptor; idempotent by path
    pub fn register(&self, info: ChunkInfo) {
        let mut data = self.data.write();
        let q = data.entry(info.query_hash.clone()).or_default();
        if q.chunks_on_disk.insert(info.path.clone(), info).is_none() {
            metrics::CHUNKS_ON_DISK.inc();
        }
    }

    /// Swap a destination chunk in and its sources out, atomically
    ///
    /// Under one exclusive guard: `new` is inserted and every chunk in `old`
    /// is removed. Returns the paths of the chunks actually removed; the
    /// caller unlinks those files after the guard is released.
    ///
    /// If the query's entry has vanished (evicted mid-task), the destination
    /// is still published under a fresh entry and no unlink work is
    /// returned; the files the caller meant to remove become orphans for the
    /// next startup scan.
    pub fn supersede(&self, new: ChunkInfo, old: &[ChunkInfo]) -> Vec<PathBuf> {
        let query_hash = new.query_hash.clone();
        let mut removed = Vec::new();
        let inserted;

        {
            let mut data = self.data.write();
            match data.get_mut(&query_hash) {
                Some(q) => {
                    inserted = q.chunks_on_disk.insert(new.path.clone(), new).is_none();
                    for info in old {
                        if q.chunks_on_disk.remove(&info.path).is_some() {
                            removed.push(info.path.clone());
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        query_hash = %query_hash,
                        "query data not found during publication; sources left for the reaper"
                    );
                    let q = data.entry(query_hash).or_default();
                    inserted = q.chunks_on_disk.insert(new.path.clone(), new).is_none();
                }
            }
        }

        metrics::CHUNKS_ON_DISK.add(inserted as i64 as f64 - removed.len() as f64);
        removed
    }

    /// Drop a query and all its chunk references; files stay on disk
    pub fn evict_query(&self, query_hash: &str) -> usize {
        let mut data = self.data.write();
        let removed = data
            .remove(query_hash)
            .map(|q| q.chunks_on_disk.len())
            .unwrap_or(0);
        metrics::CHUNKS_ON_DISK.sub(removed as f64);
        removed
    }

    /// Rebuild catalog state from the data directory
    fn scan(data_dir: &Path) -> Result<HashMap<String, QueryData>, Error> {
        let mut data = HashMap::new();

        for entry in std::fs::read_dir(data_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() {
                // Only temp leftovers are expected next to the query dirs
                if file_name_contains(&path, TMP_MARKER) {
                    reap(&path, "orphaned temp file");
                }
                continue;
            }

            let query_hash = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    tracing::warn!(path = %path.display(), "skipping non-UTF8 directory name");
                    continue;
                }
            };

            let chunks = Self::scan_query_dir(&path)?;
            if !chunks.is_empty() {
                data.insert(
                    query_hash,
                    QueryData {
                        chunks_on_disk: chunks,
                    },
                );
            }
        }
        Ok(data)
    }

    /// Scan one query directory, repairing as it goes
    fn scan_query_dir(dir: &Path) -> Result<HashMap<PathBuf, ChunkInfo>, Error> {
        let mut chunks: Vec<ChunkInfo> = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            if file_name_contains(&path, TMP_MARKER) {
                reap(&path, "orphaned temp file");
                continue;
            }
            if file_name_ends_with(&path, QUARANTINE_SUFFIX) {
                continue;
            }
            if !file_name_ends_with(&path, CHUNK_SUFFIX) {
                tracing::warn!(path = %path.display(), "unrecognized file in query directory");
                continue;
            }

            let info = match ChunkInfo::from_path(&path) {
                Ok(info) => info,
                Err(e) => {
                    quarantine(&path, &format!("unparseable file name: {}", e));
                    continue;
                }
            };
            if let Err(e) = Self::verify_header(&info) {
                quarantine(&path, &e.to_string());
                continue;
            }
            chunks.push(info);
        }

        // Invariant repair: one file per (from, duration), larger last_ts wins
        chunks.sort_by(|a, b| {
            (a.from, a.duration, a.last_ts).cmp(&(b.from, b.duration, b.last_ts))
        });
        let mut deduped: Vec<ChunkInfo> = Vec::with_capacity(chunks.len());
        for info in chunks {
            match deduped.last() {
                Some(prev) if prev.from == info.from && prev.duration == info.duration => {
                    let loser = deduped.pop().unwrap();
                    reap(&loser.path, "duplicate chunk with older last_ts");
                    deduped.push(info);
                }
                _ => deduped.push(info),
            }
        }

        // Supersession repair: a chunk covered by a wider-duration chunk was
        // already compacted away; its unlink just never happened.
        let mut kept: HashMap<PathBuf, ChunkInfo> = HashMap::with_capacity(deduped.len());
        for info in &deduped {
            let covered = deduped
                .iter()
                .any(|other| other.duration > info.duration && other.covers(info));
            if covered {
                reap(&info.path, "superseded by a wider chunk");
            } else {
                kept.insert(info.path.clone(), info.clone());
            }
        }
        Ok(kept)
    }

    /// Check that a file's header agrees with its name
    ///
    /// Reads only the fixed header; chunk bodies are never decoded during
    /// the startup scan.
    fn verify_header(info: &ChunkInfo) -> Result<(), Error> {
        let mut file = std::fs::File::open(&info.path)?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(|e| Error::Chunk(e.into()))?;
        let header = ChunkHeader::from_bytes(&buf)?;
        if !info.matches_header(&header) {
            return Err(Error::Chunk(crate::error::ChunkError::InvalidHeader(
                format!("file name {} disagrees with header", info.path.display()),
            )));
        }
        Ok(())
    }
}

fn file_name_contains(path: &Path, needle: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(needle))
        .unwrap_or(false)
}

fn file_name_ends_with(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(suffix))
        .unwrap_or(false)
}

/// Unlink a file the scan decided is garbage
fn reap(path: &Path, reason: &str) {
    tracing::info!(path = %path.display(), reason, "removing file");
    match std::fs::remove_file(path) {
        Ok(()) => metrics::ORPHANS_REAPED.inc(),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

/// Rename a corrupt chunk aside so it is never scanned again
fn quarantine(path: &Path, reason: &str) {
    let mut target = path.as_os_str().to_os_string();
    target.push(QUARANTINE_SUFFIX);
    tracing::warn!(path = %path.display(), reason, "quarantining corrupt chunk");
    match std::fs::rename(path, &target) {
        Ok(()) => metrics::QUARANTINED_CHUNKS.inc(),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to quarantine"),
    }
}

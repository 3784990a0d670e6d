//! Storage layer: the on-disk chunk format and its access paths
//!
//! Chunks are immutable files holding a fixed-duration, fixed-step sample
//! matrix for one query. This module owns their binary format and the three
//! ways code touches them:
//!
//! ```text
//! ChunkWriter ──persist──▶ <query_hash>/<from>-<last_ts>-<duration>-<step>.chunk
//!                                            │
//! ChunkReader ◀──mmap─────────────────────────┘
//! ```
//!
//! - [`chunk`] — header layout, file-name metadata, label encoding
//! - [`writer`] — buffered chunk assembly and atomic publish
//! - [`reader`] — validated memory-mapped reads with resampling
//! - [`directory`] — data-directory creation and the process-exclusive lock

pub mod chunk;
pub mod directory;
pub mod reader;
pub mod writer;

pub use chunk::{ChunkHeader, ChunkInfo, CHUNK_MAGIC, CHUNK_VERSION};
pub use directory::DirLock;
pub use reader::ChunkReader;
pub use writer::{ChunkBuf, ChunkWriter};

//! Error types for the chunk cache

use thiserror::Error;

/// Main error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk encode/decode or I/O error
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Compaction task error
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data directory is held by another process
    #[error("data directory is locked by another process: {0}")]
    AlreadyLocked(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Chunk file errors
///
/// Covers both the write path (shape validation, atomic publish) and the
/// read path (header validation, bounds checks, resampling).
#[derive(Error, Debug)]
pub enum ChunkError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid magic number in header
    #[error("invalid magic number: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic {
        /// The magic number a valid chunk carries
        expected: u32,
        /// The magic number found in the file
        actual: u32,
    },

    /// Unsupported chunk format version
    #[error("unsupported version: {0} (max supported: {1})")]
    UnsupportedVersion(u8, u8),

    /// File is shorter than its header claims
    #[error("truncated chunk file: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Size implied by the header
        expected: u64,
        /// Actual file size
        actual: u64,
    },

    /// Header fields violate a chunk invariant
    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),

    /// Series row length does not match the chunk's column count
    #[error("series has {got} values, chunk holds {want} columns")]
    InvalidShape {
        /// Column count of the chunk (`duration / step`)
        want: usize,
        /// Length of the offered series row
        got: usize,
    },

    /// Chunk's step cannot serve the requested step
    ///
    /// The chunk's columns are coarser than the requested grid, or the
    /// requested step is not a multiple of the chunk's.
    #[error("chunk step {chunk_step}s cannot be resampled to requested step {requested}s")]
    IncompatibleStep {
        /// Step of the chunk on disk
        chunk_step: i64,
        /// Step the reader asked for
        requested: i64,
    },

    /// File name does not parse as chunk metadata
    #[error("invalid chunk file name: {0}")]
    InvalidFileName(String),

    /// Label-index block failed to decode
    #[error("corrupted label index: {0}")]
    CorruptLabels(String),

    /// A label key or value exceeds the encodable length
    #[error("label component too long: {0} bytes")]
    LabelTooLong(usize),
}

/// Compaction task errors
///
/// A task either fully succeeds or fully fails; none of these leave a
/// partially published destination behind.
#[derive(Error, Debug)]
pub enum CompactionError {
    /// Task carried no source chunks
    #[error("no source chunks")]
    EmptySources,

    /// Source chunks disagree on step
    #[error("source chunks disagree on step: {first}s vs {other}s")]
    StepMismatch {
        /// Step of the first source
        first: i64,
        /// Conflicting step found in a later source
        other: i64,
    },

    /// Reading or writing a chunk failed
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

//! promcache - on-disk time-series chunk cache with background compaction
//!
//! This library keeps recently scraped Prometheus samples available for
//! low-latency range reads:
//! - Scrapes land in base-duration chunk files, one per query and window
//! - An in-memory catalog indexes every chunk without opening bodies
//! - Background compaction merges adjacent complete chunks into wider ones,
//!   bounding file count while preserving sample values bit-exactly
//!
//! The scraper feeding samples in and the "world constructor" reading them
//! out are in-process collaborators, not part of this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregation;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod services;
pub mod storage;
pub mod types;

// Re-export main types
pub use catalog::ChunkCatalog;
pub use config::Config;
pub use error::{Error, Result};
pub use ingest::Ingester;
pub use services::{CompactionConfig, CompactionService};
pub use storage::{ChunkInfo, ChunkReader, ChunkWriter};
pub use types::{DurationSecs, Labels, MetricSeries, Time};

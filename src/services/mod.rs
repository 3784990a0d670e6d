//! Background Services Module
//!
//! Provides the background side of the cache: the compaction service that
//! keeps chunk count bounded, and the small framework it runs on.
//!
//! ```text
//! ┌──────────┐  interval   ┌─────────────────┐  bounded channel  ┌─────────┐
//! │ Catalog  │──snapshot──▶│CompactionPlanner│──────tasks───────▶│ Workers │
//! └──────────┘             └─────────────────┘                   └────┬────┘
//!      ▲                                                              │
//!      └───────────────supersede (exclusive guard)────────────────────┘
//! ```

pub mod compactor;
pub mod framework;

pub use compactor::{CompactionConfig, CompactionService, CompactionTask, Compactor};
pub use framework::{Service, ServiceError, ServiceStatus};

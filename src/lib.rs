//! # Map Tracker
//!
//! Continuous activity tracker for a catalog of game maps.
//!
//! The tracker samples per-entity activity metrics from a rate-limited
//! upstream, records how entities move through curated ranked listings,
//! down-samples history as it ages, and keeps a denormalized per-entity
//! summary current.
//!
//! ## Architecture
//!
//! ```text
//! Classifier ──► TierBoard ──► TieredCollector (hot / warm / cold rotation)
//!                                   │
//!                                   ▼
//!  ListingPoller ──► Store ◄── Compactor
//!                      │
//!                      ▼
//!              SummaryCalculator
//! ```
//!
//! Each component runs on its own [`Scheduler`] with an independent cadence.

pub mod collector;
pub mod compaction;
pub mod config;
pub mod error;
pub mod listing;
pub mod pacer;
pub mod provider;
pub mod records;
pub mod scheduler;
pub mod store;
pub mod summary;
pub mod tiers;
pub mod types;

pub use collector::{CycleStats, FileCheckpointStore, RotationCursor, TieredCollector};
pub use compaction::{CompactionPolicy, CompactionReport, Compactor, Threshold};
pub use config::{CollectorConfig, PopulationSource, WorkerConfig};
pub use error::{CheckpointError, ProviderError, StoreError, TaskError};
pub use listing::{diff, ListingPoller};
pub use pacer::Pacer;
pub use scheduler::{PeriodicTask, RunStats, Scheduler, SchedulerConfig};
pub use store::{Document, Filter, MemoryStore, SqliteStore, Store};
pub use summary::SummaryCalculator;
pub use tiers::{TierBoard, TierClassifier};
pub use types::{EntityId, Granularity, Tier};

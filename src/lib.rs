//! Engagement analytics and ranking for posts, comments and communities.
//!
//! A [`Recorder`] turns engagement events into counter and window updates on
//! an [`EntityStore`], then refreshes the entity's scores. The
//! [`RankingService`] lists entities by a stored score, and the
//! [`MaintenanceJob`] rotates windows and refreshes scores that went stale.
//! [`Engine`] wires all of it from a [`Config`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulse::{EngagementEvent, Entity, EntityKey, EntityStore, MemoryStore, Recorder, ScoringParams};
//!
//! # fn main() -> pulse::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! store.create(&Entity::new(EntityKey::post("p1"), chrono::Utc::now()))?;
//! let recorder = Recorder::new(store, ScoringParams::default());
//! recorder.record(&EntityKey::post("p1"), EngagementEvent::View, Some("u1"))?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod buckets;
pub mod cli;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod model;
pub mod perf;
pub mod queue;
pub mod ranking;
pub mod recorder;
pub mod scoring;
pub mod store;

pub use buckets::{ActivityBuckets, Granularity};
pub use cli::*;
pub use config::{Config, RecomputeMode};
pub use engine::Engine;
pub use error::{PulseError, Result};
pub use maintenance::{MaintenanceJob, MaintenanceReport};
pub use model::*;
pub use queue::RecomputeQueue;
pub use ranking::RankingService;
pub use recorder::{Recorder, ScoreRefresher};
pub use scoring::ScoringParams;
pub use store::{EntityStore, MemoryStore, SqliteStore};

/// File name of the database inside [`default_data_dir`].
pub const DEFAULT_DB_NAME: &str = "pulse.db";

/// `<local data dir>/pulse`, or `./pulse` when the platform has none.
#[must_use]
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("pulse")
}

#[must_use]
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join(DEFAULT_DB_NAME)
}

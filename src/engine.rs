//! Wires a store, the recorder, ranking and maintenance from a [`Config`].

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, RecomputeMode};
use crate::error::{PulseError, Result};
use crate::maintenance::MaintenanceJob;
use crate::model::{Entity, EntityKey};
use crate::perf::{self, Timer};
use crate::queue::RecomputeQueue;
use crate::ranking::RankingService;
use crate::recorder::{Recorder, ScoreRefresher};
use crate::store::{EntityStore, MemoryStore, SqliteStore};

/// Everything a caller needs, sharing one store.
pub struct Engine {
    store: Arc<dyn EntityStore>,
    recorder: Recorder,
    ranking: RankingService,
    maintenance: Arc<MaintenanceJob>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("recorder", &self.recorder)
            .field("maintenance", &self.maintenance)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the SQLite database named by `config`, creating its directory.
    ///
    /// # Errors
    ///
    /// Path, database or schema errors.
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.db_path();
        Self::open_at(&path, config)
    }

    /// Open the SQLite database at `path`.
    ///
    /// # Errors
    ///
    /// Path, database or schema errors.
    pub fn open_at(path: &Path, config: &Config) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| PulseError::path_error("create database directory", parent, err))?;
        }
        let timer = Timer::start(perf::STORAGE_OPEN);
        let store = SqliteStore::open(path)?;
        timer.stop();
        info!(path = %path.display(), "opened database");
        Self::with_store(Arc::new(store), config)
    }

    /// Engine over a fresh [`MemoryStore`].
    ///
    /// # Errors
    ///
    /// Only if recompute workers cannot be spawned.
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// Engine over any store.
    ///
    /// # Errors
    ///
    /// Only if recompute workers cannot be spawned.
    pub fn with_store(store: Arc<dyn EntityStore>, config: &Config) -> Result<Self> {
        let params = config.scoring.params();
        let refresher = ScoreRefresher::new(Arc::clone(&store), params);

        let mut recorder = Recorder::new(Arc::clone(&store), params)
            .with_transaction_timeout(config.maintenance.transaction_timeout());
        if config.scoring.recompute_mode == RecomputeMode::Queued {
            let queue = RecomputeQueue::start(refresher.clone(), config.scoring.workers())?;
            recorder = recorder.with_queue(queue);
        }

        let ranking = RankingService::new(
            Arc::clone(&store),
            config.maintenance.refresh_interval(),
        );
        let maintenance = Arc::new(MaintenanceJob::new(
            Arc::clone(&store),
            refresher,
            config.maintenance.clone(),
        ));

        Ok(Self {
            store,
            recorder,
            ranking,
            maintenance,
        })
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    #[must_use]
    pub const fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    #[must_use]
    pub const fn ranking(&self) -> &RankingService {
        &self.ranking
    }

    #[must_use]
    pub const fn maintenance(&self) -> &Arc<MaintenanceJob> {
        &self.maintenance
    }

    /// Register a new entity.
    ///
    /// # Errors
    ///
    /// `InvalidInput`, `AlreadyExists`, or `NotFound` for a missing parent
    /// community.
    pub fn create(&self, entity: &Entity) -> Result<()> {
        crate::timed!(perf::CREATE_ENTITY, self.store.create(entity))
    }

    /// # Errors
    ///
    /// `NotFound` or store errors.
    pub fn entity(&self, key: &EntityKey) -> Result<Entity> {
        self.store.fetch_required(key)
    }

    /// Drain queued recomputes and stop the workers.
    pub fn shutdown(self) {
        self.recorder.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngagementEvent, EntityKind, ScoreField, Scope, SortOrder};

    #[test]
    fn queued_engine_scores_after_shutdown() {
        let mut config = Config::default();
        config.scoring.recompute_mode = RecomputeMode::Queued;
        config.scoring.recompute_workers = 2;
        let engine = Engine::in_memory(&config).unwrap();
        let key = EntityKey::post("p1");
        engine
            .create(&Entity::new(key.clone(), chrono::Utc::now()))
            .unwrap();
        engine
            .recorder()
            .record(&key, EngagementEvent::Share, Some("u1"))
            .unwrap();

        let store = Arc::clone(engine.store());
        engine.shutdown();
        let post = store.fetch_required(&key).unwrap();
        assert_eq!(post.analytics().scored_revision(), post.analytics().revision());
    }

    #[test]
    fn sqlite_engine_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pulse.db");
        let engine = Engine::open_at(&path, &Config::default()).unwrap();
        assert!(path.exists());

        engine
            .create(&Entity::new(EntityKey::post("p1"), chrono::Utc::now()))
            .unwrap();
        let ranked = engine
            .ranking()
            .top_by_score(
                EntityKind::Post,
                &Scope::default(),
                ScoreField::Hot,
                SortOrder::Descending,
                5,
            )
            .unwrap();
        assert_eq!(ranked.len(), 1);
    }
}

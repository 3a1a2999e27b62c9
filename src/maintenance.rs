//! Periodic maintenance: window rotation, stale-score refresh and cleanup.
//!
//! A run is idempotent and bounded by the batch cap and the run deadline, so
//! it can be scheduled as often as needed. Only one run executes at a time
//! per [`MaintenanceJob`]; a second caller gets `AlreadyRunning`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::MaintenanceConfig;
use crate::error::{PulseError, Result};
use crate::logging::OperationGuard;
use crate::perf::{self, Timer};
use crate::ranking::RankingService;
use crate::recorder::{RefreshOutcome, ScoreRefresher};
use crate::store::EntityStore;

/// One entity the run could not refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub entity: String,
    pub error_kind: &'static str,
    pub message: String,
}

/// Summary of a maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Expired windows rotated, one per entity and granularity.
    pub rotated: usize,
    /// Size of the stale batch selected.
    pub selected: usize,
    pub refreshed: usize,
    /// Entities another writer had already refreshed.
    pub superseded: usize,
    /// Left for the next run once the deadline passed.
    pub skipped: usize,
    pub failures: Vec<BatchFailure>,
    /// Entities pruned by the cleanup pass, when enabled.
    pub pruned: Option<usize>,
    pub duration_ms: u64,
}

impl MaintenanceReport {
    /// The per-entity failures folded into one error, if there were any.
    #[must_use]
    pub fn failure_error(&self) -> Option<PulseError> {
        let first = self.failures.first()?;
        Some(PulseError::PartialBatchFailure {
            failed: self.failures.len(),
            total: self.selected,
            first: format!("{}: {}", first.entity, first.message),
        })
    }
}

enum ItemOutcome {
    Refreshed(RefreshOutcome),
    Skipped,
    Failed(BatchFailure),
}

/// Rotation, refresh and cleanup over one store.
pub struct MaintenanceJob {
    store: Arc<dyn EntityStore>,
    ranking: RankingService,
    refresher: ScoreRefresher,
    config: MaintenanceConfig,
    running: Mutex<()>,
}

impl std::fmt::Debug for MaintenanceJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceJob")
            .field("config", &self.config)
            .field("running", &self.running.is_locked())
            .finish_non_exhaustive()
    }
}

impl MaintenanceJob {
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore>,
        refresher: ScoreRefresher,
        config: MaintenanceConfig,
    ) -> Self {
        let ranking = RankingService::new(Arc::clone(&store), config.refresh_interval());
        Self {
            store,
            ranking,
            refresher,
            config,
            running: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Run one maintenance pass as of `now`.
    ///
    /// Per-entity refresh failures are collected in the report and never
    /// abort the batch; see [`MaintenanceReport::failure_error`].
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if another pass holds this job.
    /// - Store errors from rotation, batch selection or cleanup.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let Some(_running) = self.running.try_lock() else {
            return Err(PulseError::AlreadyRunning);
        };

        let op = OperationGuard::new("maintenance");
        match self.run_locked(now) {
            Ok(report) => {
                op.complete();
                Ok(report)
            }
            Err(err) => {
                op.fail(&err);
                Err(err)
            }
        }
    }

    fn run_locked(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let timer = Timer::start(perf::MAINTENANCE_RUN);
        let started = Instant::now();
        let deadline = self.config.run_deadline();

        let mut report = MaintenanceReport {
            rotated: self.store.rotate_windows(now)?,
            ..MaintenanceReport::default()
        };

        let cutoff = now - self.config.activity_lookback();
        let batch = self
            .ranking
            .entities_requiring_score_update(cutoff, self.config.batch_cap, now)?;
        report.selected = batch.len();

        let outcomes: Vec<ItemOutcome> = batch
            .par_iter()
            .map(|entity| {
                if started.elapsed() >= deadline {
                    return ItemOutcome::Skipped;
                }
                match self.refresher.refresh(&entity.key, now) {
                    Ok(outcome) => ItemOutcome::Refreshed(outcome),
                    Err(err) => ItemOutcome::Failed(BatchFailure {
                        entity: entity.key.to_string(),
                        error_kind: err.error_kind(),
                        message: err.to_string(),
                    }),
                }
            })
            .collect();

        for outcome in outcomes {
            match outcome {
                ItemOutcome::Refreshed(RefreshOutcome::Stored) => report.refreshed += 1,
                ItemOutcome::Refreshed(RefreshOutcome::Superseded) => report.superseded += 1,
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::Failed(failure) => {
                    warn!(
                        entity = %failure.entity,
                        error = %failure.message,
                        "maintenance refresh failed"
                    );
                    report.failures.push(failure);
                }
            }
        }
        if report.skipped > 0 {
            warn!(
                skipped = report.skipped,
                deadline_secs = deadline.as_secs(),
                "maintenance deadline reached, deferring the rest"
            );
        }

        if let Some(days) = self.config.cleanup_older_than_days {
            report.pruned = Some(self.ranking.cleanup_old_analytics(days, now)?);
        }

        report.duration_ms = u64::try_from(timer.stop().as_millis()).unwrap_or(u64::MAX);
        info!(
            rotated = report.rotated,
            selected = report.selected,
            refreshed = report.refreshed,
            superseded = report.superseded,
            skipped = report.skipped,
            failed = report.failures.len(),
            "maintenance run finished"
        );
        Ok(report)
    }

    /// Run `run_once` every `interval` on a background thread until the
    /// returned handle is stopped.
    ///
    /// # Errors
    ///
    /// `Io` if the thread cannot be spawned.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Result<MaintenanceHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("pulse-maintenance".to_string())
            .spawn(move || {
                let mut runs = 0_u64;
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            runs += 1;
                            match self.run_once(Utc::now()) {
                                Ok(report) => debug!(run = runs, ?report, "scheduled maintenance"),
                                Err(PulseError::AlreadyRunning) => {
                                    debug!(run = runs, "previous maintenance still running");
                                }
                                Err(err) => error!(run = runs, error = %err, "scheduled maintenance failed"),
                            }
                        }
                    }
                }
                runs
            })?;

        info!(interval_secs = interval.as_secs(), "maintenance scheduled");
        Ok(MaintenanceHandle {
            stop_tx,
            handle: Some(handle),
        })
    }
}

/// Handle to a scheduled maintenance thread.
#[derive(Debug)]
pub struct MaintenanceHandle {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<u64>>,
}

impl MaintenanceHandle {
    /// Stop the schedule, wait for an in-flight run, and return how many
    /// ticks were handled.
    pub fn stop(mut self) -> u64 {
        self.signal_and_join()
    }

    fn signal_and_join(&mut self) -> u64 {
        let _ = self.stop_tx.try_send(());
        let Some(handle) = self.handle.take() else {
            return 0;
        };
        handle.join().unwrap_or_else(|_| {
            error!("maintenance thread panicked");
            0
        })
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngagementEvent, Entity, EntityKey};
    use crate::recorder::Recorder;
    use crate::scoring::ScoringParams;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn job_over(store: &Arc<MemoryStore>, config: MaintenanceConfig) -> MaintenanceJob {
        let refresher = ScoreRefresher::new(store.clone(), ScoringParams::default());
        MaintenanceJob::new(store.clone(), refresher, config)
    }

    fn seed(store: &Arc<MemoryStore>, count: usize, active_at: DateTime<Utc>) {
        for i in 0..count {
            let key = EntityKey::post(format!("p{i}"));
            store.create(&Entity::new(key.clone(), t0())).unwrap();
            // Record without refreshing so the entity stays stale.
            let mut inc = crate::store::Increment::at(active_at);
            inc.counters.total_views = 1;
            inc.buckets.views = 1;
            store.apply_increment(&key, &inc).unwrap();
        }
    }

    #[test]
    fn run_refreshes_stale_entities_up_to_the_cap() {
        let store = Arc::new(MemoryStore::new());
        let now = t0() + ChronoDuration::minutes(30);
        seed(&store, 5, now - ChronoDuration::minutes(10));

        let config = MaintenanceConfig {
            batch_cap: 3,
            ..MaintenanceConfig::default()
        };
        let job = job_over(&store, config);

        let first = job.run_once(now).unwrap();
        assert_eq!(first.selected, 3);
        assert_eq!(first.refreshed, 3);
        assert!(first.failures.is_empty());
        assert!(first.failure_error().is_none());

        let second = job.run_once(now).unwrap();
        assert_eq!(second.refreshed, 2, "freshly scored entities are not picked again");

        let third = job.run_once(now).unwrap();
        assert_eq!(third.selected, 0);
    }

    #[test]
    fn run_is_idempotent_for_rotation() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 2, t0());
        let job = job_over(&store, MaintenanceConfig::default());
        let later = t0() + ChronoDuration::hours(2);

        let first = job.run_once(later).unwrap();
        assert!(first.rotated > 0);
        let second = job.run_once(later).unwrap();
        assert_eq!(second.rotated, 0);
    }

    #[test]
    fn concurrent_run_reports_already_running() {
        let store = Arc::new(MemoryStore::new());
        let job = job_over(&store, MaintenanceConfig::default());
        let _held = job.running.lock();
        let err = job.run_once(t0()).unwrap_err();
        assert_eq!(err.error_kind(), "AlreadyRunning");
    }

    #[test]
    fn expired_deadline_skips_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let now = t0() + ChronoDuration::minutes(30);
        seed(&store, 4, now - ChronoDuration::minutes(5));
        let config = MaintenanceConfig {
            run_deadline_secs: 0,
            ..MaintenanceConfig::default()
        };
        let report = job_over(&store, config).run_once(now).unwrap();
        assert_eq!(report.selected, 4);
        assert_eq!(report.skipped, 4);
        assert_eq!(report.refreshed, 0);
    }

    #[test]
    fn cleanup_runs_when_configured() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 2, t0());
        let config = MaintenanceConfig {
            cleanup_older_than_days: Some(30),
            ..MaintenanceConfig::default()
        };
        let report = job_over(&store, config)
            .run_once(t0() + ChronoDuration::days(45))
            .unwrap();
        assert_eq!(report.pruned, Some(2));
    }

    #[test]
    fn failures_fold_into_partial_batch_error() {
        let report = MaintenanceReport {
            selected: 3,
            failures: vec![BatchFailure {
                entity: "post:x".into(),
                error_kind: "StoreError",
                message: "disk full".into(),
            }],
            ..MaintenanceReport::default()
        };
        let err = report.failure_error().unwrap();
        assert_eq!(err.error_kind(), "PartialBatchFailure");
        assert!(err.to_string().contains("post:x"));
    }

    #[test]
    fn scheduled_runs_stop_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Recorder::new(store.clone(), ScoringParams::default());
        store.create(&Entity::new(EntityKey::post("a"), Utc::now())).unwrap();
        recorder
            .record_view(&EntityKey::post("a"), Some("u1"))
            .unwrap();

        let job = Arc::new(job_over(&store, MaintenanceConfig::default()));
        let handle = job.spawn(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let runs = handle.stop();
        assert!(runs >= 1);
    }
}

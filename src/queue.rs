//! Background score recomputation.
//!
//! Worker threads drain a crossbeam channel of entity keys. A key that is
//! already waiting is not enqueued twice; the worker removes it from the
//! pending set before reading, so events landing during a refresh schedule
//! another one.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{PulseError, Result};
use crate::model::EntityKey;
use crate::recorder::{RefreshOutcome, ScoreRefresher};

/// Counts reported by a worker when the queue shuts down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub stored: u64,
    pub superseded: u64,
    pub failed: u64,
}

impl QueueStats {
    fn merge(&mut self, other: Self) {
        self.stored += other.stored;
        self.superseded += other.superseded;
        self.failed += other.failed;
    }
}

type Job = (EntityKey, DateTime<Utc>);

/// Deduplicating recompute queue with a fixed worker pool.
pub struct RecomputeQueue {
    tx: Option<Sender<Job>>,
    pending: Arc<Mutex<HashSet<EntityKey>>>,
    workers: Vec<JoinHandle<QueueStats>>,
}

impl std::fmt::Debug for RecomputeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecomputeQueue")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl RecomputeQueue {
    /// Spawn `workers` threads (at least one) refreshing through `refresher`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a worker thread cannot be spawned.
    pub fn start(refresher: ScoreRefresher, workers: usize) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let refresher = refresher.clone();
            let handle = thread::Builder::new()
                .name(format!("pulse-recompute-{index}"))
                .spawn(move || worker_loop(&refresher, &rx, &pending))?;
            handles.push(handle);
        }
        debug!(workers = handles.len(), "recompute queue started");

        Ok(Self {
            tx: Some(tx),
            pending,
            workers: handles,
        })
    }

    /// Schedule a refresh of `key` as of `at`.
    ///
    /// Returns `false` if the key was already pending or the queue is closed.
    pub fn enqueue(&self, key: EntityKey, at: DateTime<Utc>) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if !self.pending.lock().insert(key.clone()) {
            return false;
        }
        if tx.send((key.clone(), at)).is_err() {
            self.pending.lock().remove(&key);
            return false;
        }
        true
    }

    /// Keys waiting for a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close the channel, let the workers drain it and wait for them.
    pub fn shutdown(mut self) -> QueueStats {
        self.close()
    }

    fn close(&mut self) -> QueueStats {
        drop(self.tx.take());
        let mut stats = QueueStats::default();
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(worker) => stats.merge(worker),
                Err(_) => warn!("recompute worker panicked"),
            }
        }
        debug!(?stats, "recompute queue stopped");
        stats
    }
}

impl Drop for RecomputeQueue {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.close();
        }
    }
}

fn worker_loop(
    refresher: &ScoreRefresher,
    rx: &Receiver<Job>,
    pending: &Mutex<HashSet<EntityKey>>,
) -> QueueStats {
    let mut stats = QueueStats::default();
    for (key, at) in rx {
        pending.lock().remove(&key);
        match refresher.refresh(&key, at) {
            Ok(RefreshOutcome::Stored) => stats.stored += 1,
            Ok(RefreshOutcome::Superseded) => stats.superseded += 1,
            Err(PulseError::NotFound { .. }) => {
                debug!(entity = %key, "entity vanished before refresh");
                stats.failed += 1;
            }
            Err(err) => {
                warn!(entity = %key, error = %err, "queued score refresh failed");
                stats.failed += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngagementEvent, Entity};
    use crate::recorder::Recorder;
    use crate::scoring::ScoringParams;
    use crate::store::{EntityStore, MemoryStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn queued_refreshes_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b", "c"] {
            store.create(&Entity::new(EntityKey::post(id), t0())).unwrap();
        }
        let refresher = ScoreRefresher::new(store.clone(), ScoringParams::default());
        let queue = RecomputeQueue::start(refresher, 2).unwrap();
        let recorder =
            Recorder::new(store.clone(), ScoringParams::default()).with_queue(queue);

        for id in ["a", "b", "c"] {
            recorder
                .record_at(&EntityKey::post(id), EngagementEvent::Comment, Some("u1"), t0())
                .unwrap();
        }
        recorder.shutdown();

        for id in ["a", "b", "c"] {
            let post = store.fetch_required(&EntityKey::post(id)).unwrap();
            assert_eq!(post.analytics().scored_revision(), 1, "post {id}");
        }
    }

    #[test]
    fn duplicate_keys_are_not_enqueued_twice() {
        let store = Arc::new(MemoryStore::new());
        store.create(&Entity::new(EntityKey::post("a"), t0())).unwrap();
        let refresher = ScoreRefresher::new(store.clone(), ScoringParams::default());

        // No workers: jobs stay in the channel until drained by hand.
        let (tx, rx) = unbounded::<Job>();
        let queue = RecomputeQueue {
            tx: Some(tx),
            pending: Arc::new(Mutex::new(HashSet::new())),
            workers: Vec::new(),
        };
        assert!(queue.enqueue(EntityKey::post("a"), t0()));
        assert!(!queue.enqueue(EntityKey::post("a"), t0()));
        assert_eq!(queue.pending(), 1);
        assert_eq!(rx.len(), 1);

        let stats = worker_loop_once(&refresher, &rx, &queue.pending);
        assert_eq!(stats.stored, 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn missing_entities_count_as_failures() {
        let store = Arc::new(MemoryStore::new());
        let refresher = ScoreRefresher::new(store, ScoringParams::default());
        let queue = RecomputeQueue::start(refresher, 1).unwrap();
        assert!(queue.enqueue(EntityKey::post("ghost"), t0()));
        let stats = queue.shutdown();
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn closed_queue_rejects_work() {
        let store = Arc::new(MemoryStore::new());
        let refresher = ScoreRefresher::new(store, ScoringParams::default());
        let mut queue = RecomputeQueue::start(refresher, 1).unwrap();
        queue.close();
        assert!(!queue.enqueue(EntityKey::post("a"), t0()));
    }

    fn worker_loop_once(
        refresher: &ScoreRefresher,
        rx: &Receiver<Job>,
        pending: &Mutex<HashSet<EntityKey>>,
    ) -> QueueStats {
        let (tx, local) = unbounded::<Job>();
        while let Ok(job) = rx.try_recv() {
            tx.send(job).unwrap();
        }
        drop(tx);
        worker_loop(refresher, &local, pending)
    }
}

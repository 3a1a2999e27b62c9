//! Ranked listings and maintenance selection queries.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::error::{PulseError, Result};
use crate::model::{Entity, EntityKind, EntityQuery, ScoreField, Scope, SortKey, SortOrder};
use crate::perf::{self, Timer};
use crate::store::EntityStore;

/// Largest page a ranked listing returns.
pub const MAX_RANKED_LIMIT: usize = 1000;

/// Read side of the engine.
#[derive(Clone)]
pub struct RankingService {
    store: Arc<dyn EntityStore>,
    refresh_interval: Duration,
}

impl std::fmt::Debug for RankingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankingService")
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl RankingService {
    /// `refresh_interval` is how old persisted scores may get before an
    /// active entity is handed back to maintenance.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            refresh_interval,
        }
    }

    /// Active entities of `kind` within `scope`, ordered by `field`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `limit` is zero or above [`MAX_RANKED_LIMIT`],
    /// store errors otherwise.
    pub fn top_by_score(
        &self,
        kind: EntityKind,
        scope: &Scope,
        field: ScoreField,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        if limit == 0 || limit > MAX_RANKED_LIMIT {
            return Err(PulseError::invalid_input(format!(
                "limit must be between 1 and {MAX_RANKED_LIMIT}, got {limit}"
            )));
        }
        if let (Some(after), Some(before)) = (scope.created_after, scope.created_before) {
            if after >= before {
                return Err(PulseError::invalid_input(
                    "created_after must be earlier than created_before",
                ));
            }
        }

        let timer = Timer::start(perf::TOP_BY_SCORE);
        let mut query = EntityQuery::ranked(kind, field, limit);
        query.scope = scope.clone();
        query.order = order;
        let entities = self.store.query(&query)?;
        timer.stop();

        debug!(%kind, %field, returned = entities.len(), "ranked listing");
        Ok(entities)
    }

    /// Entities active since `cutoff` whose scores are missing, older than
    /// the refresh interval, or behind their counters, most recently active
    /// first, at most `batch_cap`.
    ///
    /// # Errors
    ///
    /// Store errors only.
    pub fn entities_requiring_score_update(
        &self,
        cutoff: DateTime<Utc>,
        batch_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entity>> {
        if batch_cap == 0 {
            return Ok(Vec::new());
        }
        let timer = Timer::start(perf::STALE_SELECTION);
        let query = EntityQuery {
            kind: None,
            status: None,
            scope: Scope::default(),
            active_after: Some(cutoff),
            scored_before: Some(now - self.refresh_interval),
            sort: SortKey::LastActivity,
            order: SortOrder::Descending,
            limit: batch_cap,
            offset: 0,
        };
        let entities = self.store.query(&query)?;
        timer.stop();
        Ok(entities)
    }

    /// Drop bucket rows and actor sets for entities created more than
    /// `older_than_days` before `now`. Counters and scores survive.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for zero days, store errors otherwise.
    pub fn cleanup_old_analytics(&self, older_than_days: u32, now: DateTime<Utc>) -> Result<usize> {
        if older_than_days == 0 {
            return Err(PulseError::invalid_input(
                "cleanup needs a retention of at least one day",
            ));
        }
        let timer = Timer::start(perf::CLEANUP);
        let created_before = now - Duration::days(i64::from(older_than_days));
        let pruned = self.store.prune_analytics(created_before)?;
        timer.stop();
        info!(pruned, older_than_days, "pruned old analytics");
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngagementEvent, EntityKey, EntityStatus, VoteType};
    use crate::recorder::Recorder;
    use crate::scoring::ScoringParams;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, Recorder, RankingService) {
        let store = Arc::new(MemoryStore::new());
        let recorder = Recorder::new(store.clone(), ScoringParams::default());
        let ranking = RankingService::new(store.clone(), Duration::hours(1));
        (store, recorder, ranking)
    }

    fn upvote(recorder: &Recorder, key: &EntityKey, times: usize, at: DateTime<Utc>) {
        for i in 0..times {
            let actor = format!("u{i}");
            recorder
                .record_at(key, EngagementEvent::Vote(VoteType::Up), Some(&actor), at)
                .unwrap();
        }
    }

    #[test]
    fn top_by_score_orders_and_scopes() {
        let (store, recorder, ranking) = setup();
        store
            .create(&Entity::new(EntityKey::community("rust"), t0()))
            .unwrap();
        for (id, community) in [("a", Some("rust")), ("b", Some("rust")), ("c", None)] {
            let mut entity = Entity::new(EntityKey::post(id), t0());
            if let Some(community) = community {
                entity = entity.with_community(community);
            }
            store.create(&entity).unwrap();
        }
        upvote(&recorder, &EntityKey::post("a"), 2, t0());
        upvote(&recorder, &EntityKey::post("b"), 5, t0());
        upvote(&recorder, &EntityKey::post("c"), 9, t0());

        let scoped = ranking
            .top_by_score(
                EntityKind::Post,
                &Scope::community("rust"),
                ScoreField::NetVotes,
                SortOrder::Descending,
                10,
            )
            .unwrap();
        let ids: Vec<_> = scoped.iter().map(|e| e.key.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);

        let all = ranking
            .top_by_score(
                EntityKind::Post,
                &Scope::default(),
                ScoreField::NetVotes,
                SortOrder::Ascending,
                2,
            )
            .unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.key.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn top_by_score_skips_inactive_entities() {
        let (store, recorder, ranking) = setup();
        store.create(&Entity::new(EntityKey::post("live"), t0())).unwrap();
        store
            .create(&Entity::new(EntityKey::post("gone"), t0()).with_status(EntityStatus::Removed))
            .unwrap();
        upvote(&recorder, &EntityKey::post("gone"), 3, t0());

        let ranked = ranking
            .top_by_score(
                EntityKind::Post,
                &Scope::default(),
                ScoreField::Hot,
                SortOrder::Descending,
                10,
            )
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].key.id, "live");
    }

    #[test]
    fn top_by_score_rejects_bad_limits() {
        let (_store, _recorder, ranking) = setup();
        for limit in [0, MAX_RANKED_LIMIT + 1] {
            let err = ranking
                .top_by_score(
                    EntityKind::Post,
                    &Scope::default(),
                    ScoreField::Hot,
                    SortOrder::Descending,
                    limit,
                )
                .unwrap_err();
            assert_eq!(err.error_kind(), "InvalidInput");
        }
    }

    #[test]
    fn stale_selection_filters_caps_and_orders() {
        let (store, recorder, ranking) = setup();
        let now = t0() + Duration::hours(10);
        for id in ["old", "p1", "p2", "p3", "fresh"] {
            store.create(&Entity::new(EntityKey::post(id), t0())).unwrap();
        }
        // "old" was last active before the lookback cutoff.
        recorder
            .record_at(&EntityKey::post("old"), EngagementEvent::View, None, t0())
            .unwrap();
        for (offset, id) in [(7, "p1"), (8, "p2"), (9, "p3")] {
            recorder
                .record_at(
                    &EntityKey::post(id),
                    EngagementEvent::View,
                    None,
                    t0() + Duration::hours(offset),
                )
                .unwrap();
        }
        // "fresh" was scored a moment ago.
        recorder
            .record_at(
                &EntityKey::post("fresh"),
                EngagementEvent::View,
                None,
                now - Duration::minutes(5),
            )
            .unwrap();

        // p3 was scored exactly one refresh interval ago, which is not stale yet.
        let cutoff = now - Duration::hours(6);
        let stale = ranking
            .entities_requiring_score_update(cutoff, 10, now)
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|e| e.key.id.as_str()).collect();
        assert_eq!(ids, ["p2", "p1"]);

        let capped = ranking
            .entities_requiring_score_update(cutoff, 1, now)
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].key.id, "p2");
    }

    #[test]
    fn unscored_entities_are_stale() {
        let (store, _recorder, ranking) = setup();
        store.create(&Entity::new(EntityKey::post("new"), t0())).unwrap();
        let cutoff = t0() - Duration::hours(1);
        let stale = ranking
            .entities_requiring_score_update(cutoff, 10, t0())
            .unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn cleanup_prunes_only_old_entities() {
        let (store, _recorder, ranking) = setup();
        let now = t0() + Duration::days(40);
        store.create(&Entity::new(EntityKey::post("old"), t0())).unwrap();
        store
            .create(&Entity::new(EntityKey::post("new"), now - Duration::days(2)))
            .unwrap();

        assert_eq!(ranking.cleanup_old_analytics(30, now).unwrap(), 1);
        let old = store.fetch_required(&EntityKey::post("old")).unwrap();
        assert!(old.analytics().is_pruned());
        let new = store.fetch_required(&EntityKey::post("new")).unwrap();
        assert!(!new.analytics().is_pruned());

        let err = ranking.cleanup_old_analytics(0, now).unwrap_err();
        assert_eq!(err.error_kind(), "InvalidInput");
    }
}

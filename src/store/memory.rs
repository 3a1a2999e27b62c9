//! In-process entity store.
//!
//! A single `parking_lot::RwLock` guards all entities and actor sets, so every
//! operation (including multi-entity batches) is trivially atomic. Batches wait
//! at most their timeout for the write lock.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{
    ActorSet, EntityStore, Increment, IncrementOutcome, ScoreUpdate, active_set_name,
    apply_to_state, weekly_window_start,
};
use crate::Result;
use crate::buckets::Granularity;
use crate::error::PulseError;
use crate::model::{Entity, EntityKey, EntityKind, EntityQuery};

type SetKey = (EntityKey, String);

#[derive(Debug, Default)]
struct Inner {
    entities: HashMap<EntityKey, Entity>,
    sets: HashMap<SetKey, HashSet<String>>,
}

impl Inner {
    fn insert_actor(&mut self, key: &EntityKey, set_name: String, actor: &str) -> bool {
        self.sets
            .entry((key.clone(), set_name))
            .or_default()
            .insert(actor.to_string())
    }

    fn apply(&mut self, key: &EntityKey, increment: &Increment) -> Result<IncrementOutcome> {
        let entity = self.entities.get(key).ok_or_else(|| key.not_found())?;
        let week_start = weekly_window_start(entity.analytics.buckets.as_ref(), increment.at);

        let first_seen = increment
            .unique
            .as_ref()
            .map(|unique| self.insert_actor(key, unique.set.set_name(), &unique.actor));
        let active_new = increment
            .active_member
            .as_deref()
            .is_some_and(|actor| self.insert_actor(key, active_set_name(week_start), actor));

        let entity = self.entities.get_mut(key).ok_or_else(|| key.not_found())?;
        Ok(apply_to_state(
            &mut entity.analytics,
            increment,
            first_seen,
            active_new,
        ))
    }

    fn drop_sets(&mut self, key: &EntityKey, only_active: bool) {
        self.sets
            .retain(|(owner, name), _| owner != key || (only_active && !name.starts_with("active:")));
    }
}

/// Store backed by process memory. Cheap to create; data is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityStore for MemoryStore {
    fn create(&self, entity: &Entity) -> Result<()> {
        entity.key.validate()?;
        let entity = entity.registered();
        let mut inner = self.inner.write();
        if inner.entities.contains_key(&entity.key) {
            return Err(PulseError::already_exists(
                entity.key.kind.as_str(),
                entity.key.id.clone(),
            ));
        }
        if let Some(parent) = entity.parent_community() {
            if !inner.entities.contains_key(&parent) {
                return Err(parent.not_found());
            }
            if entity.key.kind == EntityKind::Post {
                let mut credit = Increment::at(entity.analytics.created_at);
                credit.posts_created = 1;
                inner.apply(&parent, &credit)?;
            }
        }
        inner.entities.insert(entity.key.clone(), entity);
        Ok(())
    }

    fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.inner.read().entities.get(key).cloned())
    }

    fn apply_increment(&self, key: &EntityKey, increment: &Increment) -> Result<IncrementOutcome> {
        self.inner.write().apply(key, increment)
    }

    fn apply_increments(
        &self,
        batch: &[(EntityKey, Increment)],
        timeout: Duration,
    ) -> Result<Vec<IncrementOutcome>> {
        let mut inner = self.inner.try_write_for(timeout).ok_or_else(|| {
            PulseError::transaction_aborted(format!(
                "could not acquire store lock within {}ms",
                timeout.as_millis()
            ))
        })?;
        if let Some((missing, _)) = batch
            .iter()
            .find(|(key, _)| !inner.entities.contains_key(key))
        {
            return Err(missing.not_found());
        }
        batch
            .iter()
            .map(|(key, increment)| inner.apply(key, increment))
            .collect()
    }

    fn insert_actor(&self, key: &EntityKey, set: ActorSet, actor: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(key) {
            return Err(key.not_found());
        }
        Ok(inner.insert_actor(key, set.set_name(), actor))
    }

    fn store_scores(&self, key: &EntityKey, update: &ScoreUpdate) -> Result<bool> {
        let mut inner = self.inner.write();
        let entity = inner.entities.get_mut(key).ok_or_else(|| key.not_found())?;
        let state = &mut entity.analytics;
        if !update.supersedes(state) {
            debug!(entity = %key, revision = update.revision, "rejected stale score write");
            return Ok(false);
        }
        state.scores = update.scores;
        state.scored_revision = update.revision;
        state.last_score_update_at = Some(update.computed_at);
        Ok(true)
    }

    fn query(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let inner = self.inner.read();
        let mut matched: Vec<&Entity> = inner
            .entities
            .values()
            .filter(|entity| query.matches(entity))
            .collect();
        matched.sort_by(|a, b| query.compare(a, b));
        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    fn rotate_windows(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut rotated = 0;
        let mut week_rolled = Vec::new();
        for entity in inner.entities.values_mut() {
            let state = &mut entity.analytics;
            let Some(buckets) = state.buckets.as_mut().filter(|b| b.needs_rotation(now)) else {
                continue;
            };
            let week_expired = buckets.current(Granularity::SevenDays).is_expired(now);
            rotated += buckets.rotate(now);
            if week_expired {
                if let Some(stats) = state.community.as_mut() {
                    stats.active_members_week = 0;
                    week_rolled.push(entity.key.clone());
                }
            }
        }
        for key in &week_rolled {
            inner.drop_sets(key, true);
        }
        Ok(rotated)
    }

    fn prune_analytics(&self, created_before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut pruned = Vec::new();
        for entity in inner.entities.values_mut() {
            let state = &mut entity.analytics;
            if state.pruned || state.created_at >= created_before {
                continue;
            }
            state.buckets = None;
            state.pruned = true;
            pruned.push(entity.key.clone());
        }
        for key in &pruned {
            inner.drop_sets(key, false);
        }
        Ok(pruned.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScoreField;
    use crate::store::UniqueActor;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).single().unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create(&Entity::new(EntityKey::community("rust"), t0()))
            .unwrap();
        store
            .create(&Entity::new(EntityKey::post("p1"), t0()).with_community("rust"))
            .unwrap();
        store
    }

    #[test]
    fn create_rejects_duplicates_and_orphans() {
        let store = seeded();
        let dup = store.create(&Entity::new(EntityKey::post("p1"), t0()));
        assert_eq!(dup.unwrap_err().error_kind(), "AlreadyExists");

        let orphan = store.create(&Entity::new(EntityKey::post("p2"), t0()).with_community("nope"));
        assert_eq!(orphan.unwrap_err().error_kind(), "NotFound");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn creating_a_post_credits_its_community() {
        let store = seeded();
        let community = store.fetch_required(&EntityKey::community("rust")).unwrap();
        assert_eq!(community.analytics().community().unwrap().post_count, 1);
        let buckets = community.analytics().buckets().unwrap();
        assert_eq!(buckets.current(Granularity::OneDay).counts.posts, 1);
    }

    #[test]
    fn set_insertion_reports_existing_members() {
        let store = seeded();
        let key = EntityKey::post("p1");
        assert!(store.insert_actor(&key, ActorSet::Viewers, "u1").unwrap());
        assert!(!store.insert_actor(&key, ActorSet::Viewers, "u1").unwrap());
        assert!(store.insert_actor(&key, ActorSet::Engagers, "u1").unwrap());
    }

    #[test]
    fn batch_with_missing_entity_applies_nothing() {
        let store = seeded();
        let mut inc = Increment::at(t0());
        inc.counters.total_views = 1;
        let batch = vec![
            (EntityKey::post("p1"), inc.clone()),
            (EntityKey::community("ghost"), inc),
        ];
        let err = store
            .apply_increments(&batch, Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.error_kind(), "NotFound");
        let post = store.fetch_required(&EntityKey::post("p1")).unwrap();
        assert_eq!(post.analytics().counters().total_views, 0);
    }

    #[test]
    fn batch_times_out_when_lock_is_held() {
        let store = seeded();
        let _guard = store.inner.read();
        let batch = vec![(EntityKey::post("p1"), Increment::at(t0()))];
        let err = store
            .apply_increments(&batch, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.error_kind(), "TransactionAborted");
    }

    #[test]
    fn weekly_rotation_resets_active_members() {
        let store = seeded();
        let key = EntityKey::community("rust");
        let mut inc = Increment::at(t0());
        inc.active_member = Some("u1".into());
        store.apply_increment(&key, &inc).unwrap();
        store.apply_increment(&key, &inc).unwrap();
        let stats = *store.fetch_required(&key).unwrap().analytics().community().unwrap();
        assert_eq!(stats.active_members_week, 1);

        let next_week = t0() + ChronoDuration::days(7);
        assert!(store.rotate_windows(next_week).unwrap() > 0);
        let mut inc = Increment::at(next_week);
        inc.active_member = Some("u1".into());
        store.apply_increment(&key, &inc).unwrap();
        let stats = *store.fetch_required(&key).unwrap().analytics().community().unwrap();
        assert_eq!(stats.active_members_week, 1);
    }

    #[test]
    fn prune_drops_sets_and_buckets() {
        let store = seeded();
        let key = EntityKey::post("p1");
        let mut inc = Increment::at(t0());
        inc.unique = Some(UniqueActor {
            set: ActorSet::Viewers,
            actor: "u1".into(),
        });
        store.apply_increment(&key, &inc).unwrap();

        assert_eq!(store.prune_analytics(t0() + ChronoDuration::days(1)).unwrap(), 2);
        assert_eq!(store.prune_analytics(t0() + ChronoDuration::days(1)).unwrap(), 0);
        let post = store.fetch_required(&key).unwrap();
        assert!(post.analytics().is_pruned());
        assert!(post.analytics().buckets().is_none());
        assert!(store.insert_actor(&key, ActorSet::Viewers, "u1").unwrap());
    }

    #[test]
    fn query_respects_limit_and_offset() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create(&Entity::new(EntityKey::post(format!("p{i}")), t0() + ChronoDuration::hours(i)))
                .unwrap();
        }
        let mut query = EntityQuery::ranked(EntityKind::Post, ScoreField::Hot, 2);
        query.offset = 1;
        let page = store.query(&query).unwrap();
        assert_eq!(page.len(), 2);
    }
}

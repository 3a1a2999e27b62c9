//! Event recorder.
//!
//! One operation per interaction kind. Each call validates its input, turns
//! the event into an [`Increment`], applies it atomically (together with the
//! parent community's credit, when there is one) and then triggers a score
//! refresh, either inline or through the [`RecomputeQueue`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{PulseError, Result};
use crate::model::{
    EngagementEvent, EntityKey, EntityKind, MembershipChange, ReactionType, VoteType,
};
use crate::perf::{self, Timer};
use crate::queue::RecomputeQueue;
use crate::scoring::{self, ScoringParams};
use crate::store::{
    ActorSet, DEFAULT_TRANSACTION_TIMEOUT, EntityStore, Increment, IncrementOutcome, ScoreUpdate,
    UniqueActor,
};

/// Attempts before a lost score-write race is left to the winner.
pub const MAX_REFRESH_ATTEMPTS: usize = 3;

/// Result of a score refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Scores were written.
    Stored,
    /// A newer computation was already persisted.
    Superseded,
}

/// Read, recompute and conditionally write an entity's scores.
#[derive(Clone)]
pub struct ScoreRefresher {
    store: Arc<dyn EntityStore>,
    params: ScoringParams,
}

impl std::fmt::Debug for ScoreRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreRefresher")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ScoreRefresher {
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, params: ScoringParams) -> Self {
        Self { store, params }
    }

    #[must_use]
    pub const fn params(&self) -> &ScoringParams {
        &self.params
    }

    /// Recompute `key` as of `now`, or as of the entity's last score update
    /// if that is later. A late event (one whose timestamp precedes the last
    /// refresh) is thus folded into scores at the newer instant instead of
    /// being turned away by the freshness check.
    ///
    /// A rejected write means another writer stored scores for a newer
    /// revision or instant; the read is retried up to
    /// [`MAX_REFRESH_ATTEMPTS`] times before deferring to it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity is gone, store errors otherwise.
    pub fn refresh(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<RefreshOutcome> {
        let timer = Timer::start(perf::RECOMPUTE);
        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            let entity = self.store.fetch_required(key)?;
            let state = entity.analytics();
            let at = state.last_score_update_at().map_or(now, |last| last.max(now));
            let update = ScoreUpdate {
                scores: scoring::recompute(state, key.kind, at, &self.params),
                revision: state.revision(),
                computed_at: at,
            };
            if self.store.store_scores(key, &update)? {
                timer.stop();
                return Ok(RefreshOutcome::Stored);
            }
            debug!(entity = %key, attempt, "score write rejected, re-reading");
        }
        timer.stop();
        debug!(entity = %key, "newer scores already stored");
        Ok(RefreshOutcome::Superseded)
    }
}

/// How the recorder refreshes scores after a write.
enum Recompute {
    Sync,
    Queued(RecomputeQueue),
}

/// Write side of the engine.
pub struct Recorder {
    store: Arc<dyn EntityStore>,
    refresher: ScoreRefresher,
    recompute: Recompute,
    transaction_timeout: Duration,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("queued", &matches!(self.recompute, Recompute::Queued(_)))
            .field("transaction_timeout", &self.transaction_timeout)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Recorder that refreshes scores inline.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, params: ScoringParams) -> Self {
        let refresher = ScoreRefresher::new(Arc::clone(&store), params);
        Self {
            store,
            refresher,
            recompute: Recompute::Sync,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    /// Hand refreshes to `queue` instead of running them inline.
    #[must_use]
    pub fn with_queue(mut self, queue: RecomputeQueue) -> Self {
        self.recompute = Recompute::Queued(queue);
        self
    }

    #[must_use]
    pub const fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn refresher(&self) -> &ScoreRefresher {
        &self.refresher
    }

    /// Stop the recompute queue, if any, after draining it.
    pub fn shutdown(self) {
        if let Recompute::Queued(queue) = self.recompute {
            queue.shutdown();
        }
    }

    // -------------------------------------------------------------------------
    // One operation per event kind
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_view(&self, key: &EntityKey, actor: Option<&str>) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::View, actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_vote(
        &self,
        key: &EntityKey,
        vote: VoteType,
        actor: Option<&str>,
    ) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Vote(vote), actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_comment(&self, key: &EntityKey, actor: Option<&str>) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Comment, actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_share(&self, key: &EntityKey, actor: Option<&str>) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Share, actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_save(&self, key: &EntityKey, actor: Option<&str>) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Save, actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_report(&self, key: &EntityKey, actor: Option<&str>) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Report, actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_click(&self, key: &EntityKey, actor: Option<&str>) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Click, actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_reaction(
        &self,
        key: &EntityKey,
        reaction: ReactionType,
        actor: Option<&str>,
    ) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::Reaction(reaction), actor)
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_member_join(&self, key: &EntityKey, actor: &str) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::MemberJoin, Some(actor))
    }

    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record_member_leave(&self, key: &EntityKey, actor: &str) -> Result<IncrementOutcome> {
        self.record(key, EngagementEvent::MemberLeave, Some(actor))
    }

    /// Record `event` happening now.
    ///
    /// # Errors
    ///
    /// See [`Recorder::record_at`].
    pub fn record(
        &self,
        key: &EntityKey,
        event: EngagementEvent,
        actor: Option<&str>,
    ) -> Result<IncrementOutcome> {
        self.record_at(key, event, actor, Utc::now())
    }

    /// Record `event` as having happened at `at`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a blank id or actor, or a membership event on
    ///   anything but a community. Nothing is mutated.
    /// - `NotFound` if the entity (or its parent community) does not exist.
    /// - `TransactionAborted` if the combined entity + community write timed out.
    /// - `Store` for backend failures.
    pub fn record_at(
        &self,
        key: &EntityKey,
        event: EngagementEvent,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<IncrementOutcome> {
        let timer = Timer::start(perf::RECORD_EVENT);
        validate(key, event, actor)?;

        let entity = self.store.fetch_required(key)?;
        let increment = increment_for(key.kind, event, actor, at);
        let parent = entity.parent_community();

        let outcome = match (&parent, community_credit(event, actor, at)) {
            (Some(community), Some(credit)) => {
                let batch = [(key.clone(), increment), (community.clone(), credit)];
                let outcomes = self.store.apply_increments(&batch, self.transaction_timeout)?;
                outcomes.into_iter().next().unwrap_or_default()
            }
            _ => self.store.apply_increment(key, &increment)?,
        };
        debug!(
            entity = %key,
            event = %event.event_type(),
            revision = outcome.revision,
            "recorded event"
        );

        timer.stop();

        self.after_write(key, at);
        if let Some(community) = parent {
            self.after_write(&community, at);
        }
        Ok(outcome)
    }

    /// Refresh scores after a successful write.
    ///
    /// The event is already persisted, so a failed refresh is logged and left
    /// to the maintenance job rather than reported to the caller.
    fn after_write(&self, key: &EntityKey, at: DateTime<Utc>) {
        match &self.recompute {
            Recompute::Sync => {
                if let Err(err) = self.refresher.refresh(key, at) {
                    warn!(entity = %key, error = %err, "score refresh failed");
                }
            }
            Recompute::Queued(queue) => {
                queue.enqueue(key.clone(), at);
            }
        }
    }
}

fn validate(key: &EntityKey, event: EngagementEvent, actor: Option<&str>) -> Result<()> {
    key.validate()?;
    if actor.is_some_and(|a| a.trim().is_empty()) {
        return Err(PulseError::invalid_input("acting user id must not be empty"));
    }
    if event.is_membership() {
        if key.kind != EntityKind::Community {
            return Err(PulseError::invalid_input(format!(
                "{} events only apply to communities, not {}",
                event.event_type(),
                key.kind
            )));
        }
        if actor.is_none() {
            return Err(PulseError::invalid_input(format!(
                "{} requires an acting user",
                event.event_type()
            )));
        }
    }
    Ok(())
}

fn engager(actor: Option<&str>) -> Option<UniqueActor> {
    actor.map(|actor| UniqueActor {
        set: ActorSet::Engagers,
        actor: actor.to_string(),
    })
}

/// Increment applied to the entity the event targets.
#[must_use]
pub fn increment_for(
    kind: EntityKind,
    event: EngagementEvent,
    actor: Option<&str>,
    at: DateTime<Utc>,
) -> Increment {
    let mut inc = Increment::at(at);
    match event {
        EngagementEvent::View => {
            inc.counters.total_views = 1;
            inc.buckets.views = 1;
            inc.unique = actor.map(|actor| UniqueActor {
                set: ActorSet::Viewers,
                actor: actor.to_string(),
            });
        }
        EngagementEvent::Vote(VoteType::Up) => {
            inc.counters.total_upvotes = 1;
            inc.buckets.upvotes = 1;
            inc.unique = engager(actor);
        }
        EngagementEvent::Vote(VoteType::Down) => {
            inc.counters.total_downvotes = 1;
            inc.buckets.downvotes = 1;
            inc.unique = engager(actor);
        }
        EngagementEvent::Comment => {
            inc.counters.total_comments = 1;
            inc.buckets.comments = 1;
            inc.unique = engager(actor);
        }
        EngagementEvent::Share => {
            inc.counters.total_shares = 1;
            inc.buckets.shares = 1;
            inc.unique = engager(actor);
        }
        EngagementEvent::Save => {
            inc.counters.total_saves = 1;
            inc.buckets.saves = 1;
            inc.unique = engager(actor);
        }
        EngagementEvent::Report => {
            inc.counters.total_reports = 1;
            inc.buckets.reports = 1;
        }
        EngagementEvent::Click => {
            inc.counters.total_clicks = 1;
            inc.buckets.clicks = 1;
        }
        EngagementEvent::Reaction(reaction) => {
            inc.counters.total_reactions = 1;
            inc.reaction = Some(reaction);
            inc.unique = engager(actor);
        }
        EngagementEvent::MemberJoin => {
            inc.membership = Some(MembershipChange::Joined);
            inc.buckets.joins = 1;
        }
        EngagementEvent::MemberLeave => {
            inc.membership = Some(MembershipChange::Left);
        }
    }
    if kind == EntityKind::Community && event != EngagementEvent::MemberLeave {
        inc.active_member = actor.map(str::to_string);
    }
    inc
}

/// Credit passed on to the parent community, for the events it tracks.
#[must_use]
pub fn community_credit(
    event: EngagementEvent,
    actor: Option<&str>,
    at: DateTime<Utc>,
) -> Option<Increment> {
    let mut inc = Increment::at(at);
    match event {
        EngagementEvent::View => {
            inc.counters.total_views = 1;
            inc.buckets.views = 1;
        }
        EngagementEvent::Vote(VoteType::Up) => {
            inc.counters.total_upvotes = 1;
            inc.buckets.upvotes = 1;
        }
        EngagementEvent::Comment => {
            inc.counters.total_comments = 1;
            inc.buckets.comments = 1;
        }
        EngagementEvent::Share => {
            inc.counters.total_shares = 1;
            inc.buckets.shares = 1;
        }
        _ => return None,
    }
    inc.active_member = actor.map(str::to_string);
    Some(inc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, Recorder) {
        let store = Arc::new(MemoryStore::new());
        store
            .create(&Entity::new(EntityKey::community("rust"), t0()))
            .unwrap();
        store
            .create(&Entity::new(EntityKey::post("p1"), t0()).with_community("rust"))
            .unwrap();
        let recorder = Recorder::new(store.clone(), ScoringParams::default());
        (store, recorder)
    }

    #[test]
    fn unique_views_count_each_actor_once() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        for _ in 0..3 {
            recorder
                .record_at(&key, EngagementEvent::View, Some("u1"), t0())
                .unwrap();
        }
        recorder
            .record_at(&key, EngagementEvent::View, None, t0())
            .unwrap();

        let post = store.fetch_required(&key).unwrap();
        assert_eq!(post.analytics().counters().total_views, 4);
        assert_eq!(post.analytics().counters().unique_views, 1);
    }

    #[test]
    fn votes_only_increment() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        recorder
            .record_at(&key, EngagementEvent::Vote(VoteType::Up), Some("u1"), t0())
            .unwrap();
        recorder
            .record_at(&key, EngagementEvent::Vote(VoteType::Down), Some("u2"), t0())
            .unwrap();
        recorder
            .record_at(&key, EngagementEvent::Vote(VoteType::Down), Some("u3"), t0())
            .unwrap();

        let post = store.fetch_required(&key).unwrap();
        let counters = post.analytics().counters();
        assert_eq!((counters.total_upvotes, counters.total_downvotes), (1, 2));
        assert_eq!(post.analytics().scores().net_votes, -1);
        assert_eq!(counters.unique_engagers, 3);
    }

    #[test]
    fn parent_community_is_credited() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        recorder
            .record_at(&key, EngagementEvent::View, Some("u1"), t0())
            .unwrap();
        recorder
            .record_at(&key, EngagementEvent::Vote(VoteType::Up), Some("u1"), t0())
            .unwrap();
        recorder
            .record_at(&key, EngagementEvent::Save, Some("u1"), t0())
            .unwrap();

        let community = store.fetch_required(&EntityKey::community("rust")).unwrap();
        let state = community.analytics();
        assert_eq!(state.counters().total_views, 1);
        assert_eq!(state.counters().total_upvotes, 1);
        assert_eq!(state.counters().total_saves, 0, "saves stay on the post");
        assert_eq!(state.community().unwrap().active_members_week, 1);
        assert!(state.last_score_update_at().is_some());
    }

    #[test]
    fn sync_recompute_stores_scores() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        let at = t0() + ChronoDuration::hours(2);
        recorder
            .record_at(&key, EngagementEvent::Comment, Some("u1"), at)
            .unwrap();
        let post = store.fetch_required(&key).unwrap();
        let state = post.analytics();
        assert_eq!(state.scored_revision(), state.revision());
        assert_eq!(state.last_score_update_at(), Some(at));
        assert!((state.scores().age_in_hours - 2.0).abs() < 1e-9);
    }

    #[test]
    fn membership_on_post_is_rejected_without_mutation() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        let err = recorder
            .record_at(&key, EngagementEvent::MemberJoin, Some("u1"), t0())
            .unwrap_err();
        assert_eq!(err.error_kind(), "InvalidInput");
        assert_eq!(store.fetch_required(&key).unwrap().analytics().revision(), 0);
    }

    #[test]
    fn blank_ids_are_rejected() {
        let (_store, recorder) = setup();
        let err = recorder
            .record_at(&EntityKey::post("  "), EngagementEvent::View, None, t0())
            .unwrap_err();
        assert_eq!(err.error_kind(), "InvalidInput");
        let err = recorder
            .record_at(&EntityKey::post("p1"), EngagementEvent::View, Some(""), t0())
            .unwrap_err();
        assert_eq!(err.error_kind(), "InvalidInput");
    }

    #[test]
    fn unknown_entity_is_not_found() {
        let (_store, recorder) = setup();
        let err = recorder
            .record_view(&EntityKey::post("missing"), None)
            .unwrap_err();
        assert_eq!(err.error_kind(), "NotFound");
    }

    #[test]
    fn join_and_leave_track_members() {
        let (store, recorder) = setup();
        let key = EntityKey::community("rust");
        let joined = recorder
            .record_at(&key, EngagementEvent::MemberJoin, Some("u1"), t0())
            .unwrap();
        assert_eq!(joined.member_count, Some(1));
        recorder
            .record_at(&key, EngagementEvent::MemberJoin, Some("u2"), t0())
            .unwrap();
        let left = recorder
            .record_at(&key, EngagementEvent::MemberLeave, Some("u1"), t0())
            .unwrap();
        assert_eq!(left.member_count, Some(1));

        let stats = *store
            .fetch_required(&key)
            .unwrap()
            .analytics()
            .community()
            .unwrap();
        assert_eq!(stats.member_count, 1);
        assert_eq!(stats.active_members_week, 2);
    }

    #[test]
    fn reactions_are_tallied_per_type() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        recorder
            .record_at(&key, EngagementEvent::Reaction(ReactionType::Love), Some("u1"), t0())
            .unwrap();
        recorder
            .record_at(&key, EngagementEvent::Reaction(ReactionType::Love), Some("u1"), t0())
            .unwrap();
        let post = store.fetch_required(&key).unwrap();
        assert_eq!(post.analytics().reactions().get(ReactionType::Love), 2);
        assert_eq!(post.analytics().counters().total_reactions, 2);
        assert_eq!(post.analytics().counters().unique_engagers, 1);
    }

    #[test]
    fn late_refresh_keeps_the_newer_instant() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        let refresher = recorder.refresher();
        let later = t0() + ChronoDuration::hours(1);
        assert_eq!(refresher.refresh(&key, later).unwrap(), RefreshOutcome::Stored);
        assert_eq!(refresher.refresh(&key, t0()).unwrap(), RefreshOutcome::Stored);
        let post = store.fetch_required(&key).unwrap();
        assert_eq!(post.analytics().last_score_update_at(), Some(later));
    }

    #[test]
    fn late_event_is_reflected_in_scores() {
        let (store, recorder) = setup();
        let key = EntityKey::post("p1");
        let later = t0() + ChronoDuration::hours(2);
        recorder
            .record_at(&key, EngagementEvent::View, Some("u1"), later)
            .unwrap();
        recorder
            .record_at(
                &key,
                EngagementEvent::Vote(VoteType::Up),
                Some("u2"),
                t0() + ChronoDuration::hours(1),
            )
            .unwrap();

        let post = store.fetch_required(&key).unwrap();
        let state = post.analytics();
        assert_eq!(state.scored_revision(), state.revision());
        assert_eq!(state.last_score_update_at(), Some(later));
        assert_eq!(state.scores().net_votes, 1);
    }

    /// Store whose score writes always lose the freshness race.
    struct Contended(MemoryStore);

    impl EntityStore for Contended {
        fn create(&self, entity: &Entity) -> Result<()> {
            self.0.create(entity)
        }
        fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>> {
            self.0.fetch(key)
        }
        fn apply_increment(&self, key: &EntityKey, increment: &Increment) -> Result<IncrementOutcome> {
            self.0.apply_increment(key, increment)
        }
        fn apply_increments(
            &self,
            batch: &[(EntityKey, Increment)],
            timeout: Duration,
        ) -> Result<Vec<IncrementOutcome>> {
            self.0.apply_increments(batch, timeout)
        }
        fn insert_actor(&self, key: &EntityKey, set: ActorSet, actor: &str) -> Result<bool> {
            self.0.insert_actor(key, set, actor)
        }
        fn store_scores(&self, _key: &EntityKey, _update: &ScoreUpdate) -> Result<bool> {
            Ok(false)
        }
        fn query(&self, query: &crate::model::EntityQuery) -> Result<Vec<Entity>> {
            self.0.query(query)
        }
        fn rotate_windows(&self, now: DateTime<Utc>) -> Result<usize> {
            self.0.rotate_windows(now)
        }
        fn prune_analytics(&self, created_before: DateTime<Utc>) -> Result<usize> {
            self.0.prune_analytics(created_before)
        }
    }

    #[test]
    fn refresher_defers_after_repeated_rejections() {
        let store = Arc::new(Contended(MemoryStore::new()));
        store.create(&Entity::new(EntityKey::post("p1"), t0())).unwrap();
        let refresher = ScoreRefresher::new(store, ScoringParams::default());
        assert_eq!(
            refresher.refresh(&EntityKey::post("p1"), t0()).unwrap(),
            RefreshOutcome::Superseded
        );
    }
}

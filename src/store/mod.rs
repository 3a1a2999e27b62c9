//! Entity store interface.
//!
//! The engine never talks to a database directly; it goes through the narrow
//! [`EntityStore`] trait: atomic increments with optional unique-actor set
//! insertion, conditional score writes, filtered/sorted queries, bulk window
//! rotation and pruning. Two implementations ship with the crate:
//! [`MemoryStore`] for tests and embedding, [`SqliteStore`] for persistence.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::buckets::{ActivityBuckets, BucketCounts, Granularity};
use crate::model::{
    AnalyticsState, Counters, DerivedScores, Entity, EntityKey, EntityQuery, MembershipChange,
    ReactionType,
};
use crate::scoring::next_growth_rate;

/// Default bound on a multi-entity transaction.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Named per-entity set of actor ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorSet {
    Viewers,
    Engagers,
    /// Active members of the 7-day window starting at the given instant.
    ActiveMembers(DateTime<Utc>),
}

impl ActorSet {
    /// Key of this set inside the entity's set keyspace.
    #[must_use]
    pub fn set_name(&self) -> String {
        match self {
            Self::Viewers => "viewers".to_string(),
            Self::Engagers => "engagers".to_string(),
            Self::ActiveMembers(start) => active_set_name(*start),
        }
    }
}

pub(crate) fn active_set_name(window_start: DateTime<Utc>) -> String {
    format!("active:{}", window_start.timestamp_millis())
}

/// Actor to add to a uniqueness set as part of an increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueActor {
    /// `Viewers` gates `unique_views`, `Engagers` gates `unique_engagers`.
    pub set: ActorSet,
    pub actor: String,
}

/// One atomic mutation of an entity's analytics.
#[derive(Debug, Clone, PartialEq)]
pub struct Increment {
    /// Counter deltas. Unique counters are ignored here and driven by `unique`.
    pub counters: Counters,
    pub buckets: BucketCounts,
    pub reaction: Option<ReactionType>,
    pub unique: Option<UniqueActor>,
    /// Community only: actor seen in the current weekly window.
    pub active_member: Option<String>,
    /// Community only.
    pub membership: Option<MembershipChange>,
    /// Community only: posts created inside it.
    pub posts_created: u64,
    pub at: DateTime<Utc>,
}

impl Increment {
    /// Empty increment that only touches `last_activity_at` and the revision.
    #[must_use]
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            counters: Counters::default(),
            buckets: BucketCounts::default(),
            reaction: None,
            unique: None,
            active_member: None,
            membership: None,
            posts_created: 0,
            at,
        }
    }
}

/// What an applied increment changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementOutcome {
    /// Revision after the increment.
    pub revision: u64,
    /// `Some(true)` if the unique actor was new to its set.
    pub first_seen: Option<bool>,
    /// Community membership after a join/leave.
    pub member_count: Option<u64>,
}

/// Scores to persist, conditional on freshness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreUpdate {
    pub scores: DerivedScores,
    /// Counter revision the scores were computed from.
    pub revision: u64,
    pub computed_at: DateTime<Utc>,
}

impl ScoreUpdate {
    /// Whether this update may overwrite the scores currently in `state`.
    #[must_use]
    pub fn supersedes(&self, state: &AnalyticsState) -> bool {
        self.supersedes_at(state.scored_revision, state.last_score_update_at)
    }

    /// Freshness check against the persisted revision and update time.
    #[must_use]
    pub fn supersedes_at(&self, scored_revision: u64, last_update: Option<DateTime<Utc>>) -> bool {
        self.revision >= scored_revision
            && last_update.is_none_or(|previous| self.computed_at >= previous)
    }
}

/// Persistence seam for entities and their analytics.
///
/// Every method is atomic on its own. Implementations must be shareable
/// across threads: the maintenance job and the recompute queue call in
/// concurrently.
pub trait EntityStore: Send + Sync {
    /// Register a new entity. A post created inside a community credits the
    /// community's post count in the same transaction.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the key is taken, `NotFound` if the parent
    /// community does not exist.
    fn create(&self, entity: &Entity) -> Result<()>;

    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Backend failures only; a missing entity is `Ok(None)`.
    fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>>;

    /// Apply one increment atomically.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity does not exist.
    fn apply_increment(&self, key: &EntityKey, increment: &Increment) -> Result<IncrementOutcome>;

    /// Apply several increments in a single transaction bounded by `timeout`.
    /// Either every increment lands or none does.
    ///
    /// # Errors
    ///
    /// `TransactionAborted` on timeout, `NotFound` if any entity is missing.
    fn apply_increments(
        &self,
        batch: &[(EntityKey, Increment)],
        timeout: Duration,
    ) -> Result<Vec<IncrementOutcome>>;

    /// Insert `actor` into a set. Returns `true` if it was not there before.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity does not exist.
    fn insert_actor(&self, key: &EntityKey, set: ActorSet, actor: &str) -> Result<bool>;

    /// Conditionally persist scores. Returns `false` for a stale write.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity does not exist.
    fn store_scores(&self, key: &EntityKey, update: &ScoreUpdate) -> Result<bool>;

    /// Filtered, sorted, paginated listing.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn query(&self, query: &EntityQuery) -> Result<Vec<Entity>>;

    /// Rotate every expired activity window. Returns rotated window count.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn rotate_windows(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Drop actor sets and buckets of entities created before `created_before`,
    /// keeping counters and scores. Returns the number of entities pruned.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn prune_analytics(&self, created_before: DateTime<Utc>) -> Result<usize>;

    /// Like [`fetch`](Self::fetch) but a missing entity is an error.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity does not exist.
    fn fetch_required(&self, key: &EntityKey) -> Result<Entity> {
        self.fetch(key)?.ok_or_else(|| key.not_found())
    }
}

/// Apply `increment` to an in-memory state once set membership is known.
///
/// `first_seen` is the result of the unique-actor insertion, `active_new` the
/// result of the weekly active-member insertion.
pub(crate) fn apply_to_state(
    state: &mut AnalyticsState,
    increment: &Increment,
    first_seen: Option<bool>,
    active_new: bool,
) -> IncrementOutcome {
    state.counters.add(&effective_counters(increment, first_seen));

    if let Some(reaction) = increment.reaction {
        state.reactions.increment(reaction);
    }

    let buckets = state
        .buckets
        .get_or_insert_with(|| ActivityBuckets::starting_at(increment.at));
    buckets.record(&bucket_delta(increment));
    state.pruned = false;

    let mut member_count = None;
    if let Some(stats) = state.community.as_mut() {
        stats.post_count = stats.post_count.saturating_add(increment.posts_created);
        if active_new {
            stats.active_members_week = stats.active_members_week.saturating_add(1);
        }
        if let Some(change) = increment.membership {
            stats.member_count = match change {
                MembershipChange::Joined => stats.member_count.saturating_add(1),
                MembershipChange::Left => stats.member_count.saturating_sub(1),
            };
            stats.growth_rate = next_growth_rate(stats.growth_rate, stats.member_count, change);
            member_count = Some(stats.member_count);
        }
    }

    if increment.at > state.last_activity_at {
        state.last_activity_at = increment.at;
    }
    state.revision = state.revision.saturating_add(1);

    IncrementOutcome {
        revision: state.revision,
        first_seen,
        member_count,
    }
}

/// Counter deltas with the unique counters driven by set membership.
pub(crate) fn effective_counters(increment: &Increment, first_seen: Option<bool>) -> Counters {
    let mut counters = increment.counters;
    counters.unique_views = 0;
    counters.unique_engagers = 0;
    if first_seen == Some(true) {
        match increment.unique.as_ref().map(|u| u.set) {
            Some(ActorSet::Viewers) => counters.unique_views = 1,
            Some(ActorSet::Engagers) => counters.unique_engagers = 1,
            _ => {}
        }
    }
    counters
}

pub(crate) fn bucket_delta(increment: &Increment) -> BucketCounts {
    let mut delta = increment.buckets;
    delta.posts = delta.posts.saturating_add(increment.posts_created);
    delta
}

/// Start of the current weekly window, used to name the active-member set.
pub(crate) fn weekly_window_start(buckets: Option<&ActivityBuckets>, at: DateTime<Utc>) -> DateTime<Utc> {
    buckets.map_or(at, |b| b.current(Granularity::SevenDays).window_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn unique_counter_only_moves_for_new_actors() {
        let mut state = AnalyticsState::new(EntityKind::Post, t0());
        let mut inc = Increment::at(t0());
        inc.counters.total_views = 1;
        inc.counters.unique_views = 7;
        inc.unique = Some(UniqueActor {
            set: ActorSet::Viewers,
            actor: "u1".into(),
        });

        apply_to_state(&mut state, &inc, Some(true), false);
        apply_to_state(&mut state, &inc, Some(false), false);
        assert_eq!(state.counters.total_views, 2);
        assert_eq!(state.counters.unique_views, 1);
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn membership_updates_growth_rate() {
        let mut state = AnalyticsState::new(EntityKind::Community, t0());
        let mut inc = Increment::at(t0());
        inc.membership = Some(MembershipChange::Joined);
        let outcome = apply_to_state(&mut state, &inc, None, true);

        let stats = state.community.unwrap();
        assert_eq!(outcome.member_count, Some(1));
        assert_eq!(stats.active_members_week, 1);
        assert!((stats.growth_rate - 0.3).abs() < 1e-12);
    }

    #[test]
    fn last_activity_never_moves_backwards() {
        let mut state = AnalyticsState::new(EntityKind::Post, t0());
        apply_to_state(&mut state, &Increment::at(t0() + ChronoDuration::hours(2)), None, false);
        apply_to_state(&mut state, &Increment::at(t0() + ChronoDuration::hours(1)), None, false);
        assert_eq!(state.last_activity_at, t0() + ChronoDuration::hours(2));
    }

    #[test]
    fn pruned_state_gets_fresh_buckets() {
        let mut state = AnalyticsState::new(EntityKind::Post, t0());
        state.buckets = None;
        state.pruned = true;
        let mut inc = Increment::at(t0() + ChronoDuration::days(40));
        inc.buckets.views = 1;
        apply_to_state(&mut state, &inc, None, false);
        let buckets = state.buckets.as_ref().unwrap();
        assert_eq!(buckets.current(Granularity::OneHour).counts.views, 1);
        assert_eq!(buckets.current(Granularity::OneHour).window_start, inc.at);
        assert!(!state.pruned);
    }

    #[test]
    fn score_update_freshness() {
        let mut state = AnalyticsState::new(EntityKind::Post, t0());
        state.revision = 3;
        state.scored_revision = 2;
        state.last_score_update_at = Some(t0() + ChronoDuration::minutes(5));

        let mut update = ScoreUpdate {
            scores: DerivedScores::default(),
            revision: 3,
            computed_at: t0() + ChronoDuration::minutes(6),
        };
        assert!(update.supersedes(&state));
        update.revision = 1;
        assert!(!update.supersedes(&state), "older revision");
        update.revision = 3;
        update.computed_at = t0();
        assert!(!update.supersedes(&state), "older computation time");
    }

    #[test]
    fn actor_set_names() {
        assert_eq!(ActorSet::Viewers.set_name(), "viewers");
        assert_eq!(
            ActorSet::ActiveMembers(t0()).set_name(),
            format!("active:{}", t0().timestamp_millis())
        );
    }
}

//! Score calculator.
//!
//! Pure, deterministic functions from raw counters, bucket snapshots and the
//! current time to the composite ranking scores. Nothing in here touches a
//! store or the clock; call sites pass `now` explicitly so that recomputing
//! the same inputs always yields the same output.
//!
//! Zero denominators never produce NaN or infinity. [`ratio`] reports "no
//! data" as `None`, and persisted scores collapse that to `0.0`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buckets::{ActivityBuckets, Granularity, Metric};
use crate::model::{AnalyticsState, Counters, DerivedScores, EntityKind, MembershipChange};

/// Fixed epoch reference (seconds) shared by every hot score.
pub const HOT_SCORE_ANCHOR: i64 = 1_134_028_003;

/// Seconds of recency worth one order of magnitude of net votes.
pub const HOT_SCORE_DIVISOR: f64 = 45_000.0;

/// Minimum vote count before controversy is reported.
pub const CONTROVERSY_MIN_VOTES: u64 = 10;

/// Entities older than this never rise.
pub const RISING_WINDOW_HOURS: f64 = 48.0;

/// Smoothing factor kept from the previous community growth rate.
pub const GROWTH_SMOOTHING: f64 = 0.7;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Tunables for the calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    pub hot_score_anchor: i64,
    pub controversy_min_votes: u64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            hot_score_anchor: HOT_SCORE_ANCHOR,
            controversy_min_votes: CONTROVERSY_MIN_VOTES,
        }
    }
}

// =============================================================================
// Building blocks
// =============================================================================

/// `numerator / denominator`, or `None` when there is no data.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator != 0).then(|| numerator as f64 / denominator as f64)
}

#[allow(clippy::cast_precision_loss)]
fn log10_floor1(value: u64) -> f64 {
    (value.max(1) as f64).log10()
}

fn finite(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Fractional hours between `created_at` and `now`, never negative.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn age_in_hours(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = now.signed_duration_since(created_at).num_milliseconds().max(0);
    millis as f64 / MILLIS_PER_HOUR
}

#[must_use]
pub fn age_penalty(age_hours: f64) -> f64 {
    1.0 / (1.0 + age_hours / 24.0)
}

#[must_use]
pub fn freshness_boost(age_hours: f64) -> f64 {
    if age_hours < 1.0 {
        2.0
    } else if age_hours < 6.0 {
        1.5
    } else if age_hours < 24.0 {
        1.2
    } else {
        1.0
    }
}

/// Share of upvotes among all votes; 0 without votes.
#[must_use]
pub fn upvote_ratio(upvotes: u64, downvotes: u64) -> f64 {
    ratio(upvotes, upvotes.saturating_add(downvotes)).unwrap_or(0.0)
}

/// `4 r (1 - r)`: 1.0 for a perfect split, 0 below `min_votes`.
#[must_use]
pub fn controversy(upvotes: u64, downvotes: u64, min_votes: u64) -> f64 {
    if upvotes.saturating_add(downvotes) < min_votes {
        return 0.0;
    }
    let r = upvote_ratio(upvotes, downvotes);
    4.0 * r * (1.0 - r)
}

/// Log-scaled net votes plus a linear recency term.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn hot_score(net_votes: i64, created_at: DateTime<Utc>, anchor: i64) -> f64 {
    let sign = match net_votes.signum() {
        1 => 1.0,
        -1 => -1.0,
        _ => 0.0,
    };
    let order = log10_floor1(net_votes.unsigned_abs());
    let epoch_seconds = created_at.timestamp_millis() as f64 / 1000.0;
    sign * order + (epoch_seconds - anchor as f64) / HOT_SCORE_DIVISOR
}

#[must_use]
pub fn trending_score(views: u64, engagement: u64, age_hours: f64) -> f64 {
    (log10_floor1(views) + 2.0 * log10_floor1(engagement))
        * (-age_hours / 24.0).exp()
        * freshness_boost(age_hours)
}

/// Mean of the five normalized quality signals.
#[must_use]
pub fn quality_score(counters: &Counters) -> f64 {
    let views = counters.total_views;
    let comment_to_view = ratio(counters.total_comments, views).unwrap_or(0.0);
    let share_to_view = ratio(counters.total_shares, views).unwrap_or(0.0);
    let save_to_view = ratio(counters.total_saves, views).unwrap_or(0.0);
    let engagement_rate = ratio(counters.total_engagement(), views).unwrap_or(0.0);
    let upvotes = upvote_ratio(counters.total_upvotes, counters.total_downvotes);

    let signals = [
        comment_to_view * 100.0,
        share_to_view * 200.0,
        save_to_view * 150.0,
        upvotes * 100.0,
        (engagement_rate * 100.0).min(50.0),
    ];
    signals.iter().sum::<f64>() / 5.0
}

#[must_use]
pub fn virality_score(shares: u64, view_velocity_1h: f64, view_momentum: f64) -> f64 {
    log10_floor1(shares) * 20.0 + view_velocity_1h * 2.0 + view_momentum.max(0.0) * 5.0
}

#[must_use]
pub fn popularity_score(views: u64, engagement: u64, quality: f64) -> f64 {
    log10_floor1(views) * 10.0 + log10_floor1(engagement) * 15.0 + quality * 0.5
}

#[must_use]
pub fn rising_score(age_hours: f64, engagement_momentum: f64, engagement_velocity_1h: f64) -> f64 {
    if age_hours >= RISING_WINDOW_HOURS {
        return 0.0;
    }
    ((RISING_WINDOW_HOURS - age_hours) / RISING_WINDOW_HOURS)
        * (engagement_momentum.max(0.0) * 10.0 + engagement_velocity_1h * 5.0)
}

// =============================================================================
// Community variant
// =============================================================================

/// Coarser community-level scores.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommunityScores {
    pub engagement: f64,
    pub trending: f64,
    pub quality: f64,
}

/// Weighted recent activity from the current 24h window, capped at 100.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn recent_activity_score(buckets: Option<&ActivityBuckets>) -> f64 {
    let Some(buckets) = buckets else {
        return 0.0;
    };
    let counts = &buckets.current(Granularity::OneDay).counts;
    let total = counts.posts as f64 * 5.0
        + counts.comments as f64 * 2.0
        + counts.upvotes as f64
        + counts.views as f64 / 10.0
        + counts.shares as f64 * 3.0;
    (total / 10.0).min(100.0)
}

/// `max(1, 30 / age_days)`, with the age floored at one day.
#[must_use]
pub fn community_age_bonus(age_hours: f64) -> f64 {
    let age_days = (age_hours / 24.0).max(1.0);
    (30.0 / age_days).max(1.0)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn community_scores(state: &AnalyticsState, now: DateTime<Utc>) -> CommunityScores {
    let counters = &state.counters;
    let stats = state.community.unwrap_or_default();
    let likes = counters.total_upvotes;

    let interactions = likes
        .saturating_add(counters.total_comments)
        .saturating_add(counters.total_shares);
    let engagement =
        (10.0 * interactions as f64 / stats.member_count.max(1) as f64).min(100.0);

    let age_hours = age_in_hours(state.created_at, now);
    let trending = recent_activity_score(state.buckets.as_ref()) * community_age_bonus(age_hours);

    let member_retention = ratio(stats.active_members_week, stats.member_count).unwrap_or(0.0);
    let post_quality = ratio(likes, stats.post_count).unwrap_or(0.0);
    let quality = (member_retention * 50.0 + post_quality * 5.0).min(100.0);

    CommunityScores {
        engagement: finite(engagement),
        trending: finite(trending),
        quality: finite(quality),
    }
}

/// Exponentially smoothed growth after a join or leave.
///
/// `member_count_after` is the membership once the change is applied.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn next_growth_rate(previous: f64, member_count_after: u64, change: MembershipChange) -> f64 {
    let step = 1.0 / member_count_after.max(1) as f64;
    let signed = match change {
        MembershipChange::Joined => step,
        MembershipChange::Left => -step,
    };
    finite(GROWTH_SMOOTHING * previous + (1.0 - GROWTH_SMOOTHING) * signed)
}

// =============================================================================
// Full recompute
// =============================================================================

/// Derive every score for an entity at instant `now`.
#[must_use]
pub fn recompute(
    state: &AnalyticsState,
    kind: EntityKind,
    now: DateTime<Utc>,
    params: &ScoringParams,
) -> DerivedScores {
    let counters = &state.counters;
    let age = age_in_hours(state.created_at, now);
    let engagement = counters.total_engagement();

    let buckets = state.buckets.as_ref();
    let velocity = |g: Granularity, metric: Metric| buckets.map_or(0.0, |b| b.velocity(g, metric));
    let momentum = |metric: Metric| buckets.map_or(0.0, |b| b.momentum(metric));

    let view_velocity_1h = velocity(Granularity::OneHour, Metric::Views);
    let view_velocity_6h = velocity(Granularity::SixHours, Metric::Views);
    let engagement_velocity_1h = velocity(Granularity::OneHour, Metric::Engagement);
    let engagement_velocity_6h = velocity(Granularity::SixHours, Metric::Engagement);
    let view_momentum = momentum(Metric::Views);
    let engagement_momentum = momentum(Metric::Engagement);

    let quality = quality_score(counters);
    let net_votes = counters.net_votes();

    let mut scores = DerivedScores {
        engagement_rate: ratio(engagement, counters.total_views).unwrap_or(0.0),
        upvote_ratio: upvote_ratio(counters.total_upvotes, counters.total_downvotes),
        controversy_score: controversy(
            counters.total_upvotes,
            counters.total_downvotes,
            params.controversy_min_votes,
        ),
        net_votes,
        hot_score: hot_score(net_votes, state.created_at, params.hot_score_anchor),
        trending_score: trending_score(counters.total_views, engagement, age),
        quality_score: quality,
        virality_score: virality_score(counters.total_shares, view_velocity_1h, view_momentum),
        popularity_score: popularity_score(counters.total_views, engagement, quality),
        rising_score: rising_score(age, engagement_momentum, engagement_velocity_1h),
        engagement_score: 0.0,
        view_velocity_1h,
        view_velocity_6h,
        engagement_velocity_1h,
        engagement_velocity_6h,
        view_momentum,
        engagement_momentum,
        age_in_hours: age,
        age_penalty: age_penalty(age),
        freshness_boost: freshness_boost(age),
    };

    if kind == EntityKind::Community {
        let community = community_scores(state, now);
        scores.engagement_score = community.engagement;
        scores.trending_score = community.trending;
        scores.quality_score = community.quality;
    }

    sanitize(scores)
}

/// Recompute in place and mark the state as scored at `now`.
pub fn apply(state: &mut AnalyticsState, kind: EntityKind, now: DateTime<Utc>, params: &ScoringParams) {
    state.scores = recompute(state, kind, now, params);
    state.last_score_update_at = Some(now);
    state.scored_revision = state.revision;
}

fn sanitize(mut scores: DerivedScores) -> DerivedScores {
    for value in [
        &mut scores.engagement_rate,
        &mut scores.upvote_ratio,
        &mut scores.controversy_score,
        &mut scores.hot_score,
        &mut scores.trending_score,
        &mut scores.quality_score,
        &mut scores.virality_score,
        &mut scores.popularity_score,
        &mut scores.rising_score,
        &mut scores.engagement_score,
        &mut scores.view_velocity_1h,
        &mut scores.view_velocity_6h,
        &mut scores.engagement_velocity_1h,
        &mut scores.engagement_velocity_6h,
        &mut scores.view_momentum,
        &mut scores.engagement_momentum,
        &mut scores.age_in_hours,
        &mut scores.age_penalty,
        &mut scores.freshness_boost,
    ] {
        *value = finite(*value);
    }
    scores
}

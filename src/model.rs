//! Data models for tracked entities and their analytics state.
//!
//! An [`Entity`] (post, comment or community) owns exactly one
//! [`AnalyticsState`]. The state's fields are crate-private: raw counters only
//! move through the recorder and the stores, derived scores only through the
//! score calculator. Everything here is plain data and serializes to camelCase
//! JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buckets::ActivityBuckets;
use crate::error::{PulseError, unknown_value};

// =============================================================================
// Entity identity
// =============================================================================

/// Kind of tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Comment,
    Community,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Post, Self::Comment, Self::Community];

    pub const NAMES: &'static [&'static str] = &["post", "comment", "community"];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Community => "community",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "post" | "posts" => Ok(Self::Post),
            "comment" | "comments" => Ok(Self::Comment),
            "community" | "communities" => Ok(Self::Community),
            other => Err(unknown_value("entity type", other, Self::NAMES)),
        }
    }
}

/// Fully qualified entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn post(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Post, id)
    }

    pub fn comment(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Comment, id)
    }

    pub fn community(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Community, id)
    }

    /// Reject blank ids before anything touches the store.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::InvalidInput`] if the id is empty or whitespace.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(PulseError::invalid_input(format!(
                "{} id must not be empty",
                self.kind
            )));
        }
        Ok(())
    }

    pub(crate) fn not_found(&self) -> PulseError {
        PulseError::not_found(self.kind.as_str(), self.id.clone())
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Moderation/visibility status. Only `Active` entities are ranked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    Hidden,
    Removed,
    Archived,
}

impl EntityStatus {
    pub const NAMES: &'static [&'static str] = &["active", "hidden", "removed", "archived"];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Hidden => "hidden",
            Self::Removed => "removed",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for EntityStatus {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "hidden" => Ok(Self::Hidden),
            "removed" => Ok(Self::Removed),
            "archived" => Ok(Self::Archived),
            other => Err(unknown_value("status", other, Self::NAMES)),
        }
    }
}

// =============================================================================
// Raw counters
// =============================================================================

/// Raw lifetime counters. Non-decreasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Counters {
    pub total_views: u64,
    pub unique_views: u64,
    pub total_upvotes: u64,
    pub total_downvotes: u64,
    pub total_comments: u64,
    pub total_shares: u64,
    pub total_saves: u64,
    pub total_reports: u64,
    pub total_clicks: u64,
    pub unique_engagers: u64,
    pub total_reactions: u64,
}

impl Counters {
    /// upvotes + downvotes + comments + shares
    #[must_use]
    pub const fn total_engagement(&self) -> u64 {
        self.total_upvotes
            .saturating_add(self.total_downvotes)
            .saturating_add(self.total_comments)
            .saturating_add(self.total_shares)
    }

    #[must_use]
    pub const fn total_votes(&self) -> u64 {
        self.total_upvotes.saturating_add(self.total_downvotes)
    }

    /// Net score (a.k.a. synergy). Never stored, always derived.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn net_votes(&self) -> i64 {
        self.total_upvotes as i64 - self.total_downvotes as i64
    }

    pub(crate) fn add(&mut self, delta: &Self) {
        self.total_views = self.total_views.saturating_add(delta.total_views);
        self.unique_views = self.unique_views.saturating_add(delta.unique_views);
        self.total_upvotes = self.total_upvotes.saturating_add(delta.total_upvotes);
        self.total_downvotes = self.total_downvotes.saturating_add(delta.total_downvotes);
        self.total_comments = self.total_comments.saturating_add(delta.total_comments);
        self.total_shares = self.total_shares.saturating_add(delta.total_shares);
        self.total_saves = self.total_saves.saturating_add(delta.total_saves);
        self.total_reports = self.total_reports.saturating_add(delta.total_reports);
        self.total_clicks = self.total_clicks.saturating_add(delta.total_clicks);
        self.unique_engagers = self.unique_engagers.saturating_add(delta.unique_engagers);
        self.total_reactions = self.total_reactions.saturating_add(delta.total_reactions);
    }
}

/// Per-type reaction totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionCounts {
    pub like: u64,
    pub love: u64,
    pub laugh: u64,
    pub wow: u64,
    pub sad: u64,
    pub angry: u64,
}

impl ReactionCounts {
    #[must_use]
    pub const fn get(&self, reaction: ReactionType) -> u64 {
        match reaction {
            ReactionType::Like => self.like,
            ReactionType::Love => self.love,
            ReactionType::Laugh => self.laugh,
            ReactionType::Wow => self.wow,
            ReactionType::Sad => self.sad,
            ReactionType::Angry => self.angry,
        }
    }

    pub(crate) fn increment(&mut self, reaction: ReactionType) {
        let slot = match reaction {
            ReactionType::Like => &mut self.like,
            ReactionType::Love => &mut self.love,
            ReactionType::Laugh => &mut self.laugh,
            ReactionType::Wow => &mut self.wow,
            ReactionType::Sad => &mut self.sad,
            ReactionType::Angry => &mut self.angry,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Community-only membership statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommunityStats {
    /// The one reversible counter: decremented on leave.
    pub member_count: u64,
    /// Distinct actors seen in the current 7-day window.
    pub active_members_week: u64,
    pub post_count: u64,
    /// Exponentially smoothed join/leave rate.
    pub growth_rate: f64,
}

// =============================================================================
// Derived scores
// =============================================================================

/// Scores produced by [`crate::scoring::recompute`]. Never written by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DerivedScores {
    pub engagement_rate: f64,
    pub upvote_ratio: f64,
    pub controversy_score: f64,
    pub net_votes: i64,
    pub hot_score: f64,
    pub trending_score: f64,
    pub quality_score: f64,
    pub virality_score: f64,
    pub popularity_score: f64,
    pub rising_score: f64,
    pub engagement_score: f64,
    pub view_velocity_1h: f64,
    pub view_velocity_6h: f64,
    pub engagement_velocity_1h: f64,
    pub engagement_velocity_6h: f64,
    pub view_momentum: f64,
    pub engagement_momentum: f64,
    pub age_in_hours: f64,
    pub age_penalty: f64,
    pub freshness_boost: f64,
}

impl DerivedScores {
    /// Value of the named ranking field.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get(&self, field: ScoreField) -> f64 {
        match field {
            ScoreField::Hot => self.hot_score,
            ScoreField::Trending => self.trending_score,
            ScoreField::Rising => self.rising_score,
            ScoreField::Quality => self.quality_score,
            ScoreField::Virality => self.virality_score,
            ScoreField::Popularity => self.popularity_score,
            ScoreField::Controversy => self.controversy_score,
            ScoreField::EngagementRate => self.engagement_rate,
            ScoreField::Engagement => self.engagement_score,
            ScoreField::UpvoteRatio => self.upvote_ratio,
            ScoreField::NetVotes => self.net_votes as f64,
            ScoreField::ViewVelocity => self.view_velocity_1h,
        }
    }
}

// =============================================================================
// Analytics state
// =============================================================================

/// Engagement analytics embedded in every entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsState {
    pub(crate) counters: Counters,
    pub(crate) reactions: ReactionCounts,
    pub(crate) community: Option<CommunityStats>,
    /// `None` once pruned by cleanup.
    pub(crate) buckets: Option<ActivityBuckets>,
    pub(crate) scores: DerivedScores,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity_at: DateTime<Utc>,
    pub(crate) last_score_update_at: Option<DateTime<Utc>>,
    /// Bumped on every counter mutation.
    pub(crate) revision: u64,
    /// Revision the persisted scores were computed from.
    pub(crate) scored_revision: u64,
    pub(crate) pruned: bool,
}

impl AnalyticsState {
    /// Zeroed state for an entity created at `created_at`.
    #[must_use]
    pub fn new(kind: EntityKind, created_at: DateTime<Utc>) -> Self {
        Self {
            counters: Counters::default(),
            reactions: ReactionCounts::default(),
            community: (kind == EntityKind::Community).then(CommunityStats::default),
            buckets: Some(ActivityBuckets::starting_at(created_at)),
            scores: DerivedScores::default(),
            created_at,
            last_activity_at: created_at,
            last_score_update_at: None,
            revision: 0,
            scored_revision: 0,
            pruned: false,
        }
    }

    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub const fn reactions(&self) -> &ReactionCounts {
        &self.reactions
    }

    #[must_use]
    pub const fn community(&self) -> Option<&CommunityStats> {
        self.community.as_ref()
    }

    #[must_use]
    pub const fn buckets(&self) -> Option<&ActivityBuckets> {
        self.buckets.as_ref()
    }

    #[must_use]
    pub const fn scores(&self) -> &DerivedScores {
        &self.scores
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    #[must_use]
    pub const fn last_score_update_at(&self) -> Option<DateTime<Utc>> {
        self.last_score_update_at
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub const fn scored_revision(&self) -> u64 {
        self.scored_revision
    }

    #[must_use]
    pub const fn is_pruned(&self) -> bool {
        self.pruned
    }

    /// Builder used by tests and fixtures to seed counters directly.
    #[cfg(test)]
    pub(crate) fn with_counters(mut self, counters: Counters) -> Self {
        self.counters = counters;
        self
    }
}

/// A post, comment or community with its analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub key: EntityKey,
    /// Parent community credited alongside this entity's events.
    pub community_id: Option<String>,
    pub author_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: EntityStatus,
    pub(crate) analytics: AnalyticsState,
}

impl Entity {
    /// New active entity with zeroed analytics.
    #[must_use]
    pub fn new(key: EntityKey, created_at: DateTime<Utc>) -> Self {
        let analytics = AnalyticsState::new(key.kind, created_at);
        Self {
            key,
            community_id: None,
            author_id: None,
            tags: Vec::new(),
            status: EntityStatus::Active,
            analytics,
        }
    }

    /// Copy of this entity as a store registers it: descriptive fields kept,
    /// analytics reset to the zeroed state for its creation time.
    #[must_use]
    pub fn registered(&self) -> Self {
        Self {
            analytics: AnalyticsState::new(self.key.kind, self.analytics.created_at),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_community(mut self, community_id: impl Into<String>) -> Self {
        self.community_id = Some(community_id.into());
        self
    }

    #[must_use]
    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn analytics(&self) -> &AnalyticsState {
        &self.analytics
    }

    /// Parent community key, if this is a post/comment inside a community.
    #[must_use]
    pub fn parent_community(&self) -> Option<EntityKey> {
        if self.key.kind == EntityKind::Community {
            return None;
        }
        self.community_id.as_ref().map(EntityKey::community)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Direction of a vote. Votes only ever increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    pub const NAMES: &'static [&'static str] = &["up", "down"];
}

impl std::str::FromStr for VoteType {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" | "upvote" | "+1" => Ok(Self::Up),
            "down" | "downvote" | "-1" => Ok(Self::Down),
            other => Err(unknown_value("vote type", other, Self::NAMES)),
        }
    }
}

/// Supported reaction emoji.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionType {
    Like,
    Love,
    Laugh,
    Wow,
    Sad,
    Angry,
}

impl ReactionType {
    pub const ALL: [Self; 6] = [
        Self::Like,
        Self::Love,
        Self::Laugh,
        Self::Wow,
        Self::Sad,
        Self::Angry,
    ];

    pub const NAMES: &'static [&'static str] = &["like", "love", "laugh", "wow", "sad", "angry"];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Love => "love",
            Self::Laugh => "laugh",
            Self::Wow => "wow",
            Self::Sad => "sad",
            Self::Angry => "angry",
        }
    }
}

impl std::str::FromStr for ReactionType {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == lower)
            .ok_or_else(|| unknown_value("reaction type", &lower, Self::NAMES))
    }
}

/// Event discriminant, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
    Vote,
    Comment,
    Share,
    Save,
    Report,
    Click,
    Reaction,
    MemberJoin,
    MemberLeave,
}

impl EventType {
    pub const NAMES: &'static [&'static str] = &[
        "view",
        "vote",
        "comment",
        "share",
        "save",
        "report",
        "click",
        "reaction",
        "member_join",
        "member_leave",
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Vote => "vote",
            Self::Comment => "comment",
            Self::Share => "share",
            Self::Save => "save",
            Self::Report => "report",
            Self::Click => "click",
            Self::Reaction => "reaction",
            Self::MemberJoin => "member_join",
            Self::MemberLeave => "member_leave",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "view" => Ok(Self::View),
            "vote" => Ok(Self::Vote),
            "comment" => Ok(Self::Comment),
            "share" => Ok(Self::Share),
            "save" => Ok(Self::Save),
            "report" => Ok(Self::Report),
            "click" => Ok(Self::Click),
            "reaction" | "react" => Ok(Self::Reaction),
            "member_join" | "join" => Ok(Self::MemberJoin),
            "member_leave" | "leave" => Ok(Self::MemberLeave),
            other => Err(unknown_value("event type", other, Self::NAMES)),
        }
    }
}

/// An interaction with its event-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngagementEvent {
    View,
    Vote(VoteType),
    Comment,
    Share,
    Save,
    Report,
    Click,
    Reaction(ReactionType),
    MemberJoin,
    MemberLeave,
}

impl EngagementEvent {
    #[must_use]
    pub const fn event_type(self) -> EventType {
        match self {
            Self::View => EventType::View,
            Self::Vote(_) => EventType::Vote,
            Self::Comment => EventType::Comment,
            Self::Share => EventType::Share,
            Self::Save => EventType::Save,
            Self::Report => EventType::Report,
            Self::Click => EventType::Click,
            Self::Reaction(_) => EventType::Reaction,
            Self::MemberJoin => EventType::MemberJoin,
            Self::MemberLeave => EventType::MemberLeave,
        }
    }

    /// Build an event from its wire name plus optional vote/reaction payload.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::InvalidInput`] if the payload required by the
    /// event type is missing or unparseable.
    pub fn from_parts(
        event_type: EventType,
        vote_type: Option<&str>,
        reaction_type: Option<&str>,
    ) -> crate::Result<Self> {
        let vote: Option<VoteType> = vote_type.map(str::parse).transpose()?;
        let reaction: Option<ReactionType> = reaction_type.map(str::parse).transpose()?;
        Self::with_payload(event_type, vote, reaction)
    }

    /// Typed form of [`EngagementEvent::from_parts`]. Payloads the event
    /// type does not use are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::InvalidInput`] if a vote or reaction event lacks
    /// its payload.
    pub fn with_payload(
        event_type: EventType,
        vote: Option<VoteType>,
        reaction: Option<ReactionType>,
    ) -> crate::Result<Self> {
        Ok(match event_type {
            EventType::View => Self::View,
            EventType::Vote => Self::Vote(
                vote.ok_or_else(|| PulseError::invalid_input("vote event requires a vote type"))?,
            ),
            EventType::Comment => Self::Comment,
            EventType::Share => Self::Share,
            EventType::Save => Self::Save,
            EventType::Report => Self::Report,
            EventType::Click => Self::Click,
            EventType::Reaction => Self::Reaction(reaction.ok_or_else(|| {
                PulseError::invalid_input("reaction event requires a reaction type")
            })?),
            EventType::MemberJoin => Self::MemberJoin,
            EventType::MemberLeave => Self::MemberLeave,
        })
    }

    /// Join/leave only make sense on communities.
    #[must_use]
    pub const fn is_membership(self) -> bool {
        matches!(self, Self::MemberJoin | Self::MemberLeave)
    }
}

/// Direction of a community membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Joined,
    Left,
}

// =============================================================================
// Ranking queries
// =============================================================================

/// Score fields an entity can be ranked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreField {
    Hot,
    Trending,
    Rising,
    Quality,
    Virality,
    Popularity,
    Controversy,
    EngagementRate,
    /// Community engagement score.
    Engagement,
    UpvoteRatio,
    NetVotes,
    ViewVelocity,
}

impl ScoreField {
    pub const ALL: [Self; 12] = [
        Self::Hot,
        Self::Trending,
        Self::Rising,
        Self::Quality,
        Self::Virality,
        Self::Popularity,
        Self::Controversy,
        Self::EngagementRate,
        Self::Engagement,
        Self::UpvoteRatio,
        Self::NetVotes,
        Self::ViewVelocity,
    ];

    pub const NAMES: &'static [&'static str] = &[
        "hot",
        "trending",
        "rising",
        "quality",
        "virality",
        "popularity",
        "controversy",
        "engagement_rate",
        "engagement",
        "upvote_ratio",
        "net_votes",
        "view_velocity",
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Trending => "trending",
            Self::Rising => "rising",
            Self::Quality => "quality",
            Self::Virality => "virality",
            Self::Popularity => "popularity",
            Self::Controversy => "controversy",
            Self::EngagementRate => "engagement_rate",
            Self::Engagement => "engagement",
            Self::UpvoteRatio => "upvote_ratio",
            Self::NetVotes => "net_votes",
            Self::ViewVelocity => "view_velocity",
        }
    }
}

impl std::fmt::Display for ScoreField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScoreField {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .to_lowercase()
            .replace('-', "_")
            .trim_end_matches("_score")
            .to_string();
        match normalized.as_str() {
            "hot" => Ok(Self::Hot),
            "trending" => Ok(Self::Trending),
            "rising" => Ok(Self::Rising),
            "quality" => Ok(Self::Quality),
            "virality" | "viral" => Ok(Self::Virality),
            "popularity" | "popular" => Ok(Self::Popularity),
            "controversy" | "controversial" => Ok(Self::Controversy),
            "engagement_rate" => Ok(Self::EngagementRate),
            "engagement" => Ok(Self::Engagement),
            "upvote_ratio" => Ok(Self::UpvoteRatio),
            "net_votes" | "synergy" | "top" => Ok(Self::NetVotes),
            "view_velocity" => Ok(Self::ViewVelocity),
            other => Err(unknown_value("score field", other, Self::NAMES)),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

impl std::str::FromStr for SortOrder {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desc" | "descending" => Ok(Self::Descending),
            "asc" | "ascending" => Ok(Self::Ascending),
            other => Err(unknown_value("sort order", other, &["desc", "asc"])),
        }
    }
}

/// What a store query sorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Score(ScoreField),
    LastActivity,
    CreatedAt,
}

/// Optional narrowing of a ranking query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scope {
    pub community_id: Option<String>,
    pub author_id: Option<String>,
    /// Entity must carry every listed tag.
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl Scope {
    #[must_use]
    pub fn community(id: impl Into<String>) -> Self {
        Self {
            community_id: Some(id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn author(id: impl Into<String>) -> Self {
        Self {
            author_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Whether `entity` falls inside this scope.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(community) = &self.community_id {
            let own = entity.key.kind == EntityKind::Community && &entity.key.id == community;
            if !own && entity.community_id.as_ref() != Some(community) {
                return false;
            }
        }
        if let Some(author) = &self.author_id {
            if entity.author_id.as_ref() != Some(author) {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| entity.tags.contains(tag)) {
            return false;
        }
        let created = entity.analytics.created_at;
        if self.created_after.is_some_and(|after| created < after) {
            return false;
        }
        if self.created_before.is_some_and(|before| created >= before) {
            return false;
        }
        true
    }
}

/// Filtered, sorted, paginated read against an entity store.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityQuery {
    pub kind: Option<EntityKind>,
    pub status: Option<EntityStatus>,
    pub scope: Scope,
    /// Keep entities with `last_activity_at > active_after`.
    pub active_after: Option<DateTime<Utc>>,
    /// Keep entities whose scores are stale: never scored, scored before this
    /// instant, or computed from an older counter revision.
    pub scored_before: Option<DateTime<Utc>>,
    pub sort: SortKey,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl EntityQuery {
    /// Active entities of `kind`, best first by `field`.
    #[must_use]
    pub fn ranked(kind: EntityKind, field: ScoreField, limit: usize) -> Self {
        Self {
            kind: Some(kind),
            status: Some(EntityStatus::Active),
            scope: Scope::default(),
            active_after: None,
            scored_before: None,
            sort: SortKey::Score(field),
            order: SortOrder::Descending,
            limit,
            offset: 0,
        }
    }

    /// In-memory predicate equivalent of the store-side filter.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if self.kind.is_some_and(|kind| kind != entity.key.kind) {
            return false;
        }
        if self.status.is_some_and(|status| status != entity.status) {
            return false;
        }
        let analytics = &entity.analytics;
        if self
            .active_after
            .is_some_and(|after| analytics.last_activity_at <= after)
        {
            return false;
        }
        if let Some(before) = self.scored_before {
            let fresh = analytics.last_score_update_at.is_some_and(|at| at >= before);
            if fresh && analytics.scored_revision >= analytics.revision {
                return false;
            }
        }
        self.scope.matches(entity)
    }

    /// Compare two entities by this query's sort key and order.
    #[must_use]
    pub fn compare(&self, a: &Entity, b: &Entity) -> std::cmp::Ordering {
        let ordering = match self.sort {
            SortKey::Score(field) => a
                .analytics
                .scores
                .get(field)
                .total_cmp(&b.analytics.scores.get(field)),
            SortKey::LastActivity => a
                .analytics
                .last_activity_at
                .cmp(&b.analytics.last_activity_at),
            SortKey::CreatedAt => a.analytics.created_at.cmp(&b.analytics.created_at),
        };
        let ordering = match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        // Same tie-break as the SQL backend: kind name, then id.
        ordering
            .then_with(|| a.key.kind.as_str().cmp(b.key.kind.as_str()))
            .then_with(|| a.key.id.cmp(&b.key.id))
    }
}

//! Request and response shapes for the remote interface.
//!
//! Everything here is camelCase JSON. Handlers turn engine errors into
//! [`ErrorBody`] values carrying the stable `error_kind` string, so callers
//! can branch without parsing messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Counters, DerivedScores, EngagementEvent, Entity, EntityKey, EventType, ScoreField, Scope,
    SortOrder,
};
use crate::ranking::RankingService;
use crate::recorder::Recorder;

/// Optional payload of an engagement event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventMetadata {
    pub vote_type: Option<String>,
    pub reaction_type: Option<String>,
}

/// Record one interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEngagementEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acting_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
    /// When the event happened; defaults to the time it is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl RecordEngagementEvent {
    /// Parse the wire strings into typed values.
    ///
    /// # Errors
    ///
    /// `InvalidInput` (with a did-you-mean hint where one exists) for an
    /// unknown entity type, event type, vote type or reaction type.
    pub fn parse(&self) -> Result<(EntityKey, EngagementEvent)> {
        let key = EntityKey::new(self.entity_type.parse()?, self.entity_id.clone());
        let event_type: EventType = self.event_type.parse()?;
        let metadata = self.metadata.clone().unwrap_or_default();
        let event = EngagementEvent::from_parts(
            event_type,
            metadata.vote_type.as_deref(),
            metadata.reaction_type.as_deref(),
        )?;
        Ok((key, event))
    }
}

/// Error shape shared by every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_kind: String,
    pub message: String,
    /// Whether resending the same request may succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl From<&crate::PulseError> for ErrorBody {
    fn from(err: &crate::PulseError) -> Self {
        Self {
            error_kind: err.error_kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Response to [`RecordEngagementEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventResponse {
    Ok { ok: bool },
    Error(ErrorBody),
}

impl EventResponse {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { ok: true })
    }
}

/// Handle a [`RecordEngagementEvent`] request.
#[must_use]
pub fn record_engagement_event(recorder: &Recorder, request: &RecordEngagementEvent) -> EventResponse {
    let result = request.parse().and_then(|(key, event)| {
        let at = request.occurred_at.unwrap_or_else(Utc::now);
        recorder.record_at(&key, event, request.acting_user_id.as_deref(), at)
    });
    match result {
        Ok(_) => EventResponse::Ok { ok: true },
        Err(err) => EventResponse::Error(ErrorBody::from(&err)),
    }
}

/// Fetch a ranked page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRanked {
    pub entity_type: String,
    pub score_field: String,
    #[serde(default)]
    pub scope: Option<Scope>,
    pub limit: usize,
    /// `desc` (default) or `asc`.
    #[serde(default)]
    pub order: Option<String>,
}

/// One row of a ranked page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntity {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Value of the requested score field.
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub counters: Counters,
    pub scores: DerivedScores,
}

impl RankedEntity {
    #[must_use]
    pub fn from_entity(entity: &Entity, field: ScoreField) -> Self {
        let analytics = entity.analytics();
        Self {
            entity_type: entity.key.kind.to_string(),
            entity_id: entity.key.id.clone(),
            community_id: entity.community_id.clone(),
            author_id: entity.author_id.clone(),
            score: analytics.scores().get(field),
            created_at: analytics.created_at(),
            last_activity_at: analytics.last_activity_at(),
            counters: *analytics.counters(),
            scores: *analytics.scores(),
        }
    }
}

/// Response to [`GetRanked`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResponse {
    pub entities: Vec<RankedEntity>,
}

/// Handle a [`GetRanked`] request.
///
/// # Errors
///
/// `InvalidInput` for unknown names or a bad limit, store errors otherwise.
pub fn get_ranked(ranking: &RankingService, request: &GetRanked) -> Result<RankedResponse> {
    let kind = request.entity_type.parse()?;
    let field: ScoreField = request.score_field.parse()?;
    let order = match &request.order {
        Some(raw) => raw.parse()?,
        None => SortOrder::default(),
    };
    let scope = request.scope.clone().unwrap_or_default();
    let entities = ranking.top_by_score(kind, &scope, field, order, request.limit)?;
    Ok(RankedResponse {
        entities: entities
            .iter()
            .map(|entity| RankedEntity::from_entity(entity, field))
            .collect(),
    })
}

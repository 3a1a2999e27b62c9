//! `SQLite` entity store.
//!
//! Counters live as integer columns and are bumped with `UPDATE ... SET x = x + ?`
//! inside an immediate transaction. Activity windows are one row per
//! (entity, granularity, slot) and are incremented with an UPSERT. Actor sets
//! are a `WITHOUT ROWID` table keyed on (entity, set, actor), so `INSERT OR
//! IGNORE` doubles as the "already existed" signal.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use tracing::{debug, info};

use super::{
    ActorSet, DEFAULT_TRANSACTION_TIMEOUT, EntityStore, Increment, IncrementOutcome, ScoreUpdate,
    active_set_name, bucket_delta, effective_counters,
};
use crate::Result;
use crate::buckets::{ActivityBuckets, BucketCounts, BucketSnapshot, Granularity, WindowPair};
use crate::error::PulseError;
use crate::model::{
    AnalyticsState, CommunityStats, Counters, DerivedScores, Entity, EntityKey, EntityKind,
    EntityQuery, MembershipChange, ReactionCounts, ScoreField, SortKey, SortOrder,
};
use crate::scoring::next_growth_rate;

const SCHEMA_VERSION: i32 = 1;

const ENTITY_COLUMNS: &str = "kind, id, community_id, author_id, tags_json, status, \
     created_at, last_activity_at, last_score_update_at, revision, scored_revision, pruned, \
     total_views, unique_views, total_upvotes, total_downvotes, total_comments, total_shares, \
     total_saves, total_reports, total_clicks, unique_engagers, total_reactions, \
     reaction_like, reaction_love, reaction_laugh, reaction_wow, reaction_sad, reaction_angry, \
     member_count, active_members_week, post_count, growth_rate, scores_json";

const BUCKET_COLUMNS: &str =
    "views, upvotes, downvotes, comments, shares, saves, clicks, reports, posts, joins";

/// Sortable column backing a score field.
const fn score_column(field: ScoreField) -> &'static str {
    match field {
        ScoreField::Hot => "hot_score",
        ScoreField::Trending => "trending_score",
        ScoreField::Rising => "rising_score",
        ScoreField::Quality => "quality_score",
        ScoreField::Virality => "virality_score",
        ScoreField::Popularity => "popularity_score",
        ScoreField::Controversy => "controversy_score",
        ScoreField::EngagementRate => "engagement_rate",
        ScoreField::Engagement => "engagement_score",
        ScoreField::UpvoteRatio => "upvote_ratio",
        ScoreField::NetVotes => "net_votes",
        ScoreField::ViewVelocity => "view_velocity_1h",
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn millis_to_utc(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    millis_to_utc(idx, row.get(idx)?)
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|millis| millis_to_utc(idx, millis))
        .transpose()
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = PulseError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Decode an `ENTITY_COLUMNS` row. Buckets are loaded separately.
fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let kind: EntityKind = parsed_at(row, 0)?;
    let community = (kind == EntityKind::Community)
        .then(|| -> rusqlite::Result<CommunityStats> {
            Ok(CommunityStats {
                member_count: count_at(row, 29)?,
                active_members_week: count_at(row, 30)?,
                post_count: count_at(row, 31)?,
                growth_rate: row.get(32)?,
            })
        })
        .transpose()?;

    let analytics = AnalyticsState {
        counters: Counters {
            total_views: count_at(row, 12)?,
            unique_views: count_at(row, 13)?,
            total_upvotes: count_at(row, 14)?,
            total_downvotes: count_at(row, 15)?,
            total_comments: count_at(row, 16)?,
            total_shares: count_at(row, 17)?,
            total_saves: count_at(row, 18)?,
            total_reports: count_at(row, 19)?,
            total_clicks: count_at(row, 20)?,
            unique_engagers: count_at(row, 21)?,
            total_reactions: count_at(row, 22)?,
        },
        reactions: ReactionCounts {
            like: count_at(row, 23)?,
            love: count_at(row, 24)?,
            laugh: count_at(row, 25)?,
            wow: count_at(row, 26)?,
            sad: count_at(row, 27)?,
            angry: count_at(row, 28)?,
        },
        community,
        buckets: None,
        scores: json_at::<DerivedScores>(row, 33)?,
        created_at: time_at(row, 6)?,
        last_activity_at: time_at(row, 7)?,
        last_score_update_at: opt_time_at(row, 8)?,
        revision: count_at(row, 9)?,
        scored_revision: count_at(row, 10)?,
        pruned: row.get::<_, i64>(11)? != 0,
    };

    Ok(Entity {
        key: EntityKey::new(kind, row.get::<_, String>(1)?),
        community_id: row.get(2)?,
        author_id: row.get(3)?,
        tags: json_at(row, 4)?,
        status: parsed_at(row, 5)?,
        analytics,
    })
}

fn counts_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<BucketCounts> {
    Ok(BucketCounts {
        views: count_at(row, first)?,
        upvotes: count_at(row, first + 1)?,
        downvotes: count_at(row, first + 2)?,
        comments: count_at(row, first + 3)?,
        shares: count_at(row, first + 4)?,
        saves: count_at(row, first + 5)?,
        clicks: count_at(row, first + 6)?,
        reports: count_at(row, first + 7)?,
        posts: count_at(row, first + 8)?,
        joins: count_at(row, first + 9)?,
    })
}

fn bucket_params(counts: &BucketCounts) -> [i64; 10] {
    [
        to_i64(counts.views),
        to_i64(counts.upvotes),
        to_i64(counts.downvotes),
        to_i64(counts.comments),
        to_i64(counts.shares),
        to_i64(counts.saves),
        to_i64(counts.clicks),
        to_i64(counts.reports),
        to_i64(counts.posts),
        to_i64(counts.joins),
    ]
}

/// Rewrite raw `SQLite` failures as store errors naming the operation.
fn in_operation<T>(operation: &'static str, entity: impl Display, result: Result<T>) -> Result<T> {
    result.map_err(|err| match err {
        PulseError::Database(source) => {
            if source.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) {
                PulseError::transaction_aborted(format!("{operation} on '{entity}': {source}"))
            } else {
                PulseError::store(operation, entity.to_string(), source)
            }
        }
        other => other,
    })
}

/// Persistent store on a single `SQLite` connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, or was written by a
    /// newer schema version.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path).map_err(|err| {
            PulseError::with_context(format!("Failed to open database at {}", path.display()), err)
        })?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        conn.busy_timeout(DEFAULT_TRANSACTION_TIMEOUT)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let current_version = schema_version(&conn);

        if current_version > SCHEMA_VERSION {
            return Err(PulseError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: current_version,
            });
        }
        if current_version < SCHEMA_VERSION {
            info!(
                "Migrating database from version {} to {}",
                current_version, SCHEMA_VERSION
            );
            create_schema(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Ok(())
    }

    /// Schema version recorded in the database.
    #[must_use]
    pub fn schema_version(&self) -> i32 {
        schema_version(&self.conn.lock())
    }

    /// Entity totals per kind, for status output.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn entity_counts(&self) -> Result<Vec<(EntityKind, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM entities GROUP BY kind")?;
        let rows = stmt.query_map([], |row| Ok((parsed_at::<EntityKind>(row, 0)?, count_at(row, 1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn with_immediate<T>(
        &self,
        operation: &'static str,
        entity: impl Display,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let result = (|| -> Result<T> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })();
        in_operation(operation, entity, result)
    }
}

fn schema_version(conn: &Connection) -> i32 {
    let result: rusqlite::Result<i32> = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| {
            let value: String = row.get(0)?;
            Ok(value.parse().unwrap_or(0))
        },
    );

    // Treat missing meta table as version 0.
    result.unwrap_or_default()
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            community_id TEXT,
            author_id TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            last_activity_at INTEGER NOT NULL,
            last_score_update_at INTEGER,
            revision INTEGER NOT NULL DEFAULT 0,
            scored_revision INTEGER NOT NULL DEFAULT 0,
            pruned INTEGER NOT NULL DEFAULT 0,
            total_views INTEGER NOT NULL DEFAULT 0,
            unique_views INTEGER NOT NULL DEFAULT 0,
            total_upvotes INTEGER NOT NULL DEFAULT 0,
            total_downvotes INTEGER NOT NULL DEFAULT 0,
            total_comments INTEGER NOT NULL DEFAULT 0,
            total_shares INTEGER NOT NULL DEFAULT 0,
            total_saves INTEGER NOT NULL DEFAULT 0,
            total_reports INTEGER NOT NULL DEFAULT 0,
            total_clicks INTEGER NOT NULL DEFAULT 0,
            unique_engagers INTEGER NOT NULL DEFAULT 0,
            total_reactions INTEGER NOT NULL DEFAULT 0,
            reaction_like INTEGER NOT NULL DEFAULT 0,
            reaction_love INTEGER NOT NULL DEFAULT 0,
            reaction_laugh INTEGER NOT NULL DEFAULT 0,
            reaction_wow INTEGER NOT NULL DEFAULT 0,
            reaction_sad INTEGER NOT NULL DEFAULT 0,
            reaction_angry INTEGER NOT NULL DEFAULT 0,
            member_count INTEGER NOT NULL DEFAULT 0,
            active_members_week INTEGER NOT NULL DEFAULT 0,
            post_count INTEGER NOT NULL DEFAULT 0,
            growth_rate REAL NOT NULL DEFAULT 0,
            scores_json TEXT NOT NULL DEFAULT '{}',
            hot_score REAL NOT NULL DEFAULT 0,
            trending_score REAL NOT NULL DEFAULT 0,
            rising_score REAL NOT NULL DEFAULT 0,
            quality_score REAL NOT NULL DEFAULT 0,
            virality_score REAL NOT NULL DEFAULT 0,
            popularity_score REAL NOT NULL DEFAULT 0,
            controversy_score REAL NOT NULL DEFAULT 0,
            engagement_rate REAL NOT NULL DEFAULT 0,
            engagement_score REAL NOT NULL DEFAULT 0,
            upvote_ratio REAL NOT NULL DEFAULT 0,
            net_votes INTEGER NOT NULL DEFAULT 0,
            view_velocity_1h REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (kind, id)
        );

        CREATE INDEX IF NOT EXISTS idx_entities_activity
            ON entities(last_activity_at DESC);
        CREATE INDEX IF NOT EXISTS idx_entities_community ON entities(community_id);
        CREATE INDEX IF NOT EXISTS idx_entities_created ON entities(created_at);
        CREATE INDEX IF NOT EXISTS idx_entities_hot
            ON entities(kind, status, hot_score DESC);
        CREATE INDEX IF NOT EXISTS idx_entities_trending
            ON entities(kind, status, trending_score DESC);

        CREATE TABLE IF NOT EXISTS activity_buckets (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            granularity TEXT NOT NULL,
            slot TEXT NOT NULL CHECK (slot IN ('current', 'previous')),
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            views INTEGER NOT NULL DEFAULT 0,
            upvotes INTEGER NOT NULL DEFAULT 0,
            downvotes INTEGER NOT NULL DEFAULT 0,
            comments INTEGER NOT NULL DEFAULT 0,
            shares INTEGER NOT NULL DEFAULT 0,
            saves INTEGER NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            reports INTEGER NOT NULL DEFAULT 0,
            posts INTEGER NOT NULL DEFAULT 0,
            joins INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (kind, id, granularity, slot)
        );

        CREATE INDEX IF NOT EXISTS idx_buckets_expiry
            ON activity_buckets(slot, window_end);

        CREATE TABLE IF NOT EXISTS actor_sets (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            set_name TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            PRIMARY KEY (kind, id, set_name, actor_id)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

// =============================================================================
// Transaction helpers
// =============================================================================

fn exists(tx: &Transaction<'_>, key: &EntityKey) -> Result<bool> {
    Ok(tx
        .prepare_cached("SELECT 1 FROM entities WHERE kind = ?1 AND id = ?2")?
        .query_row(params![key.kind.as_str(), key.id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn load_buckets(
    conn: &Connection,
    key: &EntityKey,
    fallback: DateTime<Utc>,
) -> Result<Option<ActivityBuckets>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT granularity, slot, window_start, window_end, {BUCKET_COLUMNS}
         FROM activity_buckets WHERE kind = ?1 AND id = ?2"
    ))?;
    let rows = stmt.query_map(params![key.kind.as_str(), key.id], |row| {
        let snapshot = BucketSnapshot {
            window_start: time_at(row, 2)?,
            window_end: time_at(row, 3)?,
            counts: counts_from_row(row, 4)?,
        };
        Ok((
            parsed_at::<Granularity>(row, 0)?,
            row.get::<_, String>(1)? == "current",
            snapshot,
        ))
    })?;

    let mut slots: HashMap<Granularity, (Option<BucketSnapshot>, Option<BucketSnapshot>)> =
        HashMap::new();
    for row in rows {
        let (granularity, is_current, snapshot) = row?;
        let entry = slots.entry(granularity).or_default();
        if is_current {
            entry.0 = Some(snapshot);
        } else {
            entry.1 = Some(snapshot);
        }
    }
    if slots.is_empty() {
        return Ok(None);
    }

    let pairs = slots
        .into_iter()
        .filter_map(|(granularity, (current, previous))| {
            let current = current?;
            Some(WindowPair {
                granularity,
                current,
                previous: previous.unwrap_or_else(|| BucketSnapshot::empty_at(current.window_start)),
            })
        });
    Ok(Some(ActivityBuckets::from_pairs(pairs, fallback)))
}

fn load_entity(conn: &Connection, key: &EntityKey) -> Result<Option<Entity>> {
    let entity = conn
        .prepare_cached(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 AND id = ?2"
        ))?
        .query_row(params![key.kind.as_str(), key.id], entity_from_row)
        .optional()?;
    let Some(mut entity) = entity else {
        return Ok(None);
    };
    entity.analytics.buckets = load_buckets(conn, key, entity.analytics.created_at)?;
    Ok(Some(entity))
}

fn write_buckets(tx: &Transaction<'_>, key: &EntityKey, buckets: &ActivityBuckets) -> Result<()> {
    let mut stmt = tx.prepare_cached(&format!(
        "INSERT OR REPLACE INTO activity_buckets
         (kind, id, granularity, slot, window_start, window_end, {BUCKET_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
    ))?;
    for pair in buckets.pairs() {
        for (slot, snapshot) in [("current", &pair.current), ("previous", &pair.previous)] {
            let [views, up, down, comments, shares, saves, clicks, reports, posts, joins] =
                bucket_params(&snapshot.counts);
            stmt.execute(params![
                key.kind.as_str(),
                key.id,
                pair.granularity.as_str(),
                slot,
                snapshot.window_start.timestamp_millis(),
                snapshot.window_end.timestamp_millis(),
                views,
                up,
                down,
                comments,
                shares,
                saves,
                clicks,
                reports,
                posts,
                joins,
            ])?;
        }
    }
    Ok(())
}

fn write_scores(tx: &Transaction<'_>, key: &EntityKey, scores: &DerivedScores) -> Result<()> {
    let assignments = ScoreField::ALL
        .iter()
        .enumerate()
        .map(|(i, field)| format!("{} = ?{}", score_column(*field), i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE entities SET scores_json = ?1, {assignments} WHERE kind = ?{} AND id = ?{}",
        ScoreField::ALL.len() + 2,
        ScoreField::ALL.len() + 3
    );

    let mut values: Vec<Value> = Vec::with_capacity(ScoreField::ALL.len() + 3);
    values.push(Value::Text(serde_json::to_string(scores)?));
    values.extend(ScoreField::ALL.iter().map(|field| Value::Real(scores.get(*field))));
    values.push(Value::Text(key.kind.as_str().to_string()));
    values.push(Value::Text(key.id.clone()));
    tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    Ok(())
}

fn insert_entity(tx: &Transaction<'_>, entity: &Entity) -> Result<()> {
    let state = &entity.analytics;
    let c = &state.counters;
    let r = &state.reactions;
    let stats = state.community.unwrap_or_default();
    tx.prepare_cached(
        "INSERT INTO entities (
            kind, id, community_id, author_id, tags_json, status,
            created_at, last_activity_at, last_score_update_at, revision, scored_revision, pruned,
            total_views, unique_views, total_upvotes, total_downvotes, total_comments,
            total_shares, total_saves, total_reports, total_clicks, unique_engagers,
            total_reactions, reaction_like, reaction_love, reaction_laugh, reaction_wow,
            reaction_sad, reaction_angry, member_count, active_members_week, post_count,
            growth_rate
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33
        )",
    )?
    .execute(params![
        entity.key.kind.as_str(),
        entity.key.id,
        entity.community_id,
        entity.author_id,
        serde_json::to_string(&entity.tags)?,
        entity.status.as_str(),
        state.created_at.timestamp_millis(),
        state.last_activity_at.timestamp_millis(),
        state.last_score_update_at.map(|at| at.timestamp_millis()),
        to_i64(state.revision),
        to_i64(state.scored_revision),
        i64::from(state.pruned),
        to_i64(c.total_views),
        to_i64(c.unique_views),
        to_i64(c.total_upvotes),
        to_i64(c.total_downvotes),
        to_i64(c.total_comments),
        to_i64(c.total_shares),
        to_i64(c.total_saves),
        to_i64(c.total_reports),
        to_i64(c.total_clicks),
        to_i64(c.unique_engagers),
        to_i64(c.total_reactions),
        to_i64(r.like),
        to_i64(r.love),
        to_i64(r.laugh),
        to_i64(r.wow),
        to_i64(r.sad),
        to_i64(r.angry),
        to_i64(stats.member_count),
        to_i64(stats.active_members_week),
        to_i64(stats.post_count),
        stats.growth_rate,
    ])?;
    write_scores(tx, &entity.key, &state.scores)?;
    if let Some(buckets) = &state.buckets {
        write_buckets(tx, &entity.key, buckets)?;
    }
    Ok(())
}

fn insert_actor_tx(tx: &Transaction<'_>, key: &EntityKey, set_name: &str, actor: &str) -> Result<bool> {
    let inserted = tx
        .prepare_cached(
            "INSERT OR IGNORE INTO actor_sets (kind, id, set_name, actor_id) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![key.kind.as_str(), key.id, set_name, actor])?;
    Ok(inserted == 1)
}

/// Add `delta` to the current window of every granularity, creating the
/// windows at `at` if they do not exist yet (new or pruned entity).
fn upsert_buckets(
    tx: &Transaction<'_>,
    key: &EntityKey,
    delta: &BucketCounts,
    at: DateTime<Utc>,
) -> Result<()> {
    let mut current = tx.prepare_cached(&format!(
        "INSERT INTO activity_buckets
         (kind, id, granularity, slot, window_start, window_end, {BUCKET_COLUMNS})
         VALUES (?1, ?2, ?3, 'current', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT (kind, id, granularity, slot) DO UPDATE SET
            views = views + excluded.views,
            upvotes = upvotes + excluded.upvotes,
            downvotes = downvotes + excluded.downvotes,
            comments = comments + excluded.comments,
            shares = shares + excluded.shares,
            saves = saves + excluded.saves,
            clicks = clicks + excluded.clicks,
            reports = reports + excluded.reports,
            posts = posts + excluded.posts,
            joins = joins + excluded.joins"
    ))?;
    let mut previous = tx.prepare_cached(
        "INSERT OR IGNORE INTO activity_buckets
         (kind, id, granularity, slot, window_start, window_end)
         VALUES (?1, ?2, ?3, 'previous', ?4, ?4)",
    )?;

    let at_ms = at.timestamp_millis();
    let [views, up, down, comments, shares, saves, clicks, reports, posts, joins] =
        bucket_params(delta);
    for granularity in Granularity::ALL {
        current.execute(params![
            key.kind.as_str(),
            key.id,
            granularity.as_str(),
            at_ms,
            (at + granularity.duration()).timestamp_millis(),
            views,
            up,
            down,
            comments,
            shares,
            saves,
            clicks,
            reports,
            posts,
            joins,
        ])?;
        previous.execute(params![key.kind.as_str(), key.id, granularity.as_str(), at_ms])?;
    }
    Ok(())
}

fn apply_increment_tx(
    tx: &Transaction<'_>,
    key: &EntityKey,
    increment: &Increment,
) -> Result<IncrementOutcome> {
    let row = tx
        .prepare_cached(
            "SELECT revision, member_count, growth_rate FROM entities WHERE kind = ?1 AND id = ?2",
        )?
        .query_row(params![key.kind.as_str(), key.id], |row| {
            Ok((count_at(row, 0)?, count_at(row, 1)?, row.get::<_, f64>(2)?))
        })
        .optional()?;
    let Some((revision, mut member_count, mut growth_rate)) = row else {
        return Err(key.not_found());
    };

    upsert_buckets(tx, key, &bucket_delta(increment), increment.at)?;

    let first_seen = increment
        .unique
        .as_ref()
        .map(|unique| insert_actor_tx(tx, key, &unique.set.set_name(), &unique.actor))
        .transpose()?;

    let active_new = match increment.active_member.as_deref() {
        Some(actor) => {
            let week_start = tx
                .prepare_cached(
                    "SELECT window_start FROM activity_buckets
                     WHERE kind = ?1 AND id = ?2 AND granularity = '7d' AND slot = 'current'",
                )?
                .query_row(params![key.kind.as_str(), key.id], |row| time_at(row, 0))?;
            insert_actor_tx(tx, key, &active_set_name(week_start), actor)?
        }
        None => false,
    };

    let outcome_members = increment.membership.map(|change| {
        member_count = match change {
            MembershipChange::Joined => member_count.saturating_add(1),
            MembershipChange::Left => member_count.saturating_sub(1),
        };
        growth_rate = next_growth_rate(growth_rate, member_count, change);
        member_count
    });

    let c = effective_counters(increment, first_seen);
    let mut reactions = ReactionCounts::default();
    if let Some(reaction) = increment.reaction {
        reactions.increment(reaction);
    }
    let revision = revision.saturating_add(1);

    tx.prepare_cached(
        "UPDATE entities SET
            total_views = total_views + ?3,
            unique_views = unique_views + ?4,
            total_upvotes = total_upvotes + ?5,
            total_downvotes = total_downvotes + ?6,
            total_comments = total_comments + ?7,
            total_shares = total_shares + ?8,
            total_saves = total_saves + ?9,
            total_reports = total_reports + ?10,
            total_clicks = total_clicks + ?11,
            unique_engagers = unique_engagers + ?12,
            total_reactions = total_reactions + ?13,
            reaction_like = reaction_like + ?14,
            reaction_love = reaction_love + ?15,
            reaction_laugh = reaction_laugh + ?16,
            reaction_wow = reaction_wow + ?17,
            reaction_sad = reaction_sad + ?18,
            reaction_angry = reaction_angry + ?19,
            post_count = post_count + ?20,
            active_members_week = active_members_week + ?21,
            member_count = ?22,
            growth_rate = ?23,
            last_activity_at = MAX(last_activity_at, ?24),
            revision = ?25,
            pruned = 0
         WHERE kind = ?1 AND id = ?2",
    )?
    .execute(params![
        key.kind.as_str(),
        key.id,
        to_i64(c.total_views),
        to_i64(c.unique_views),
        to_i64(c.total_upvotes),
        to_i64(c.total_downvotes),
        to_i64(c.total_comments),
        to_i64(c.total_shares),
        to_i64(c.total_saves),
        to_i64(c.total_reports),
        to_i64(c.total_clicks),
        to_i64(c.unique_engagers),
        to_i64(c.total_reactions),
        to_i64(reactions.like),
        to_i64(reactions.love),
        to_i64(reactions.laugh),
        to_i64(reactions.wow),
        to_i64(reactions.sad),
        to_i64(reactions.angry),
        to_i64(increment.posts_created),
        i64::from(active_new),
        to_i64(member_count),
        growth_rate,
        increment.at.timestamp_millis(),
        to_i64(revision),
    ])?;

    Ok(IncrementOutcome {
        revision,
        first_seen,
        member_count: outcome_members,
    })
}

/// WHERE-clause builder that numbers `?` placeholders as values are bound.
struct Filter {
    sql: String,
    values: Vec<Value>,
}

impl Filter {
    /// Append `clause`; every `?` in it refers to `value`.
    fn push(&mut self, clause: &str, value: Value) {
        self.values.push(value);
        let placeholder = format!("?{}", self.values.len());
        self.sql.push_str(&clause.replace('?', &placeholder));
    }
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn build_query(query: &EntityQuery) -> (String, Vec<Value>) {
    let mut filter = Filter {
        sql: format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE 1 = 1"),
        values: Vec::new(),
    };

    if let Some(kind) = query.kind {
        filter.push(" AND kind = ?", Value::Text(kind.as_str().into()));
    }
    if let Some(status) = query.status {
        filter.push(" AND status = ?", Value::Text(status.as_str().into()));
    }
    let scope = &query.scope;
    if let Some(community) = &scope.community_id {
        filter.push(
            " AND (community_id = ? OR (kind = 'community' AND id = ?))",
            Value::Text(community.clone()),
        );
    }
    if let Some(author) = &scope.author_id {
        filter.push(" AND author_id = ?", Value::Text(author.clone()));
    }
    for tag in &scope.tags {
        filter.push(
            " AND EXISTS (SELECT 1 FROM json_each(entities.tags_json) WHERE json_each.value = ?)",
            Value::Text(tag.clone()),
        );
    }
    if let Some(after) = scope.created_after {
        filter.push(" AND created_at >= ?", Value::Integer(after.timestamp_millis()));
    }
    if let Some(before) = scope.created_before {
        filter.push(" AND created_at < ?", Value::Integer(before.timestamp_millis()));
    }
    if let Some(after) = query.active_after {
        filter.push(
            " AND last_activity_at > ?",
            Value::Integer(after.timestamp_millis()),
        );
    }
    if let Some(before) = query.scored_before {
        filter.push(
            " AND (last_score_update_at IS NULL OR last_score_update_at < ? \
             OR scored_revision < revision)",
            Value::Integer(before.timestamp_millis()),
        );
    }

    let column = match query.sort {
        SortKey::Score(field) => score_column(field),
        SortKey::LastActivity => "last_activity_at",
        SortKey::CreatedAt => "created_at",
    };
    let direction = match query.order {
        SortOrder::Descending => "DESC",
        SortOrder::Ascending => "ASC",
    };
    filter.sql.push_str(&format!(" ORDER BY {column} {direction}, kind ASC, id ASC"));
    filter.push(" LIMIT ?", Value::Integer(limit_to_i64(query.limit)));
    filter.push(" OFFSET ?", Value::Integer(limit_to_i64(query.offset)));
    (filter.sql, filter.values)
}

impl EntityStore for SqliteStore {
    fn create(&self, entity: &Entity) -> Result<()> {
        entity.key.validate()?;
        let entity = &entity.registered();
        self.with_immediate("create", &entity.key, |tx| {
            if exists(tx, &entity.key)? {
                return Err(PulseError::already_exists(
                    entity.key.kind.as_str(),
                    entity.key.id.clone(),
                ));
            }
            if let Some(parent) = entity.parent_community() {
                if !exists(tx, &parent)? {
                    return Err(parent.not_found());
                }
                if entity.key.kind == EntityKind::Post {
                    let mut credit = Increment::at(entity.analytics.created_at);
                    credit.posts_created = 1;
                    apply_increment_tx(tx, &parent, &credit)?;
                }
            }
            insert_entity(tx, entity)
        })
    }

    fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let conn = self.conn.lock();
        in_operation("fetch", key, load_entity(&conn, key))
    }

    fn apply_increment(&self, key: &EntityKey, increment: &Increment) -> Result<IncrementOutcome> {
        self.with_immediate("apply_increment", key, |tx| {
            apply_increment_tx(tx, key, increment)
        })
    }

    fn apply_increments(
        &self,
        batch: &[(EntityKey, Increment)],
        timeout: Duration,
    ) -> Result<Vec<IncrementOutcome>> {
        let mut conn = self.conn.try_lock_for(timeout).ok_or_else(|| {
            PulseError::transaction_aborted(format!(
                "could not acquire store connection within {}ms",
                timeout.as_millis()
            ))
        })?;
        let label = batch
            .first()
            .map_or_else(String::new, |(key, _)| key.to_string());
        let result = (|| -> Result<Vec<IncrementOutcome>> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcomes = batch
                .iter()
                .map(|(key, increment)| apply_increment_tx(&tx, key, increment))
                .collect::<Result<Vec<_>>>()?;
            tx.commit()?;
            Ok(outcomes)
        })();
        in_operation("apply_increments", label, result)
    }

    fn insert_actor(&self, key: &EntityKey, set: ActorSet, actor: &str) -> Result<bool> {
        self.with_immediate("insert_actor", key, |tx| {
            if !exists(tx, key)? {
                return Err(key.not_found());
            }
            insert_actor_tx(tx, key, &set.set_name(), actor)
        })
    }

    fn store_scores(&self, key: &EntityKey, update: &ScoreUpdate) -> Result<bool> {
        self.with_immediate("store_scores", key, |tx| {
            let current = tx
                .prepare_cached(
                    "SELECT scored_revision, last_score_update_at FROM entities
                     WHERE kind = ?1 AND id = ?2",
                )?
                .query_row(params![key.kind.as_str(), key.id], |row| {
                    Ok((count_at(row, 0)?, opt_time_at(row, 1)?))
                })
                .optional()?;
            let Some((scored_revision, last_update)) = current else {
                return Err(key.not_found());
            };
            if !update.supersedes_at(scored_revision, last_update) {
                debug!(entity = %key, revision = update.revision, "rejected stale score write");
                return Ok(false);
            }
            write_scores(tx, key, &update.scores)?;
            tx.prepare_cached(
                "UPDATE entities SET scored_revision = ?3, last_score_update_at = ?4
                 WHERE kind = ?1 AND id = ?2",
            )?
            .execute(params![
                key.kind.as_str(),
                key.id,
                to_i64(update.revision),
                update.computed_at.timestamp_millis(),
            ])?;
            Ok(true)
        })
    }

    fn query(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let conn = self.conn.lock();
        let result = (|| -> Result<Vec<Entity>> {
            let (sql, values) = build_query(query);
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut entities = stmt
                .query_map(params_from_iter(values), entity_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for entity in &mut entities {
                entity.analytics.buckets =
                    load_buckets(&conn, &entity.key, entity.analytics.created_at)?;
            }
            Ok(entities)
        })();
        in_operation("query", "entities", result)
    }

    fn rotate_windows(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = now.timestamp_millis();
        self.with_immediate("rotate_windows", "activity_buckets", |tx| {
            let mut rotated = 0;
            for granularity in Granularity::ALL {
                let g = granularity.as_str();
                if granularity == Granularity::SevenDays {
                    tx.execute(
                        "UPDATE entities SET active_members_week = 0
                         WHERE kind = 'community' AND EXISTS (
                            SELECT 1 FROM activity_buckets b
                            WHERE b.kind = entities.kind AND b.id = entities.id
                              AND b.granularity = '7d' AND b.slot = 'current'
                              AND b.window_end <= ?1)",
                        params![now_ms],
                    )?;
                    tx.execute(
                        "DELETE FROM actor_sets
                         WHERE set_name LIKE 'active:%' AND EXISTS (
                            SELECT 1 FROM activity_buckets b
                            WHERE b.kind = actor_sets.kind AND b.id = actor_sets.id
                              AND b.granularity = '7d' AND b.slot = 'current'
                              AND b.window_end <= ?1)",
                        params![now_ms],
                    )?;
                }
                tx.execute(
                    "DELETE FROM activity_buckets
                     WHERE granularity = ?2 AND slot = 'previous' AND EXISTS (
                        SELECT 1 FROM activity_buckets c
                        WHERE c.kind = activity_buckets.kind AND c.id = activity_buckets.id
                          AND c.granularity = ?2 AND c.slot = 'current'
                          AND c.window_end <= ?1)",
                    params![now_ms, g],
                )?;
                rotated += tx.execute(
                    "UPDATE activity_buckets SET slot = 'previous'
                     WHERE granularity = ?2 AND slot = 'current' AND window_end <= ?1",
                    params![now_ms, g],
                )?;
                tx.execute(
                    "INSERT INTO activity_buckets (kind, id, granularity, slot, window_start, window_end)
                     SELECT p.kind, p.id, p.granularity, 'current', ?1, ?3
                     FROM activity_buckets p
                     WHERE p.granularity = ?2 AND p.slot = 'previous' AND NOT EXISTS (
                        SELECT 1 FROM activity_buckets c
                        WHERE c.kind = p.kind AND c.id = p.id
                          AND c.granularity = ?2 AND c.slot = 'current')",
                    params![now_ms, g, (now + granularity.duration()).timestamp_millis()],
                )?;
            }
            Ok(rotated)
        })
    }

    fn prune_analytics(&self, created_before: DateTime<Utc>) -> Result<usize> {
        let cutoff = created_before.timestamp_millis();
        self.with_immediate("prune_analytics", "entities", |tx| {
            for table in ["activity_buckets", "actor_sets"] {
                tx.execute(
                    &format!(
                        "DELETE FROM {table} WHERE EXISTS (
                            SELECT 1 FROM entities e
                            WHERE e.kind = {table}.kind AND e.id = {table}.id
                              AND e.pruned = 0 AND e.created_at < ?1)"
                    ),
                    params![cutoff],
                )?;
            }
            let pruned = tx.execute(
                "UPDATE entities SET pruned = 1 WHERE pruned = 0 AND created_at < ?1",
                params![cutoff],
            )?;
            Ok(pruned)
        })
    }
}

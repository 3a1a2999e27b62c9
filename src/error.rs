//! Error type shared by every pulse operation.
//!
//! Each variant maps to a stable kind string ([`PulseError::error_kind`]) that
//! the API shapes carry, so a queue consumer or remote caller can branch on
//! the kind without parsing messages.

use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// Rejected before anything was written.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Backend failure while touching one entity.
    #[error("{operation} failed for '{entity}': {source}")]
    Store {
        operation: &'static str,
        entity: String,
        #[source]
        source: BoxError,
    },

    /// A multi-entity write timed out or conflicted. Nothing was applied.
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database schema v{found} is not supported (this build reads v{expected})")]
    SchemaMismatch { expected: i32, found: i32 },

    /// Some entities of a maintenance batch failed; the others were refreshed.
    #[error("maintenance failed for {failed} of {total} entities, first was {first}")]
    PartialBatchFailure {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("maintenance is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cannot {operation} '{path}': {source}")]
    Path {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad configuration in '{path}': {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("json: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PulseError>;

impl PulseError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn store<E>(operation: &'static str, entity: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store {
            operation,
            entity: entity.into(),
            source: Box::new(source),
        }
    }

    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Path {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Stable kind string used in API error bodies and maintenance reports.
    #[must_use]
    pub const fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::InvalidInput { .. } => "InvalidInput",
            Self::Store { .. }
            | Self::Database(_)
            | Self::SchemaMismatch { .. }
            | Self::Io(_)
            | Self::Path { .. } => "StoreError",
            Self::TransactionAborted { .. } => "TransactionAborted",
            Self::PartialBatchFailure { .. } => "PartialBatchFailure",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::Config { .. } => "ConfigError",
            Self::Serialization(_) => "SerializationError",
            Self::Context { .. } | Self::Other(_) => "Internal",
        }
    }

    /// Whether resending the same call may succeed. The engine never retries
    /// on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. }
                | Self::TransactionAborted { .. }
                | Self::Database(_)
                | Self::AlreadyRunning
        )
    }

    /// One-line hint printed under CLI errors.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { .. } => Some("register it first with 'pulse create'"),
            Self::TransactionAborted { .. } => Some("safe to retry, nothing was applied"),
            Self::SchemaMismatch { .. } => Some("upgrade pulse or pass --db with a new file"),
            Self::AlreadyRunning => Some("wait for the running pass to finish"),
            _ => None,
        }
    }
}

/// Edit distance over chars, case-insensitive.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (above + 1)
                .min(row[j] + 1)
                .min(diagonal + usize::from(ca != cb));
            diagonal = above;
        }
    }
    row[b.len()]
}

/// Closest candidate within two edits, ignoring exact matches.
#[must_use]
pub fn closest_name<'a>(input: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|&candidate| (candidate, edit_distance(input, candidate)))
        .filter(|&(_, distance)| (1..=2).contains(&distance))
        .min_by_key(|&(_, distance)| distance)
        .map(|(candidate, _)| candidate)
}

/// `InvalidInput` for a name that failed to parse, with a suggestion when one
/// is close. Plain text, since it travels in API error bodies.
#[must_use]
pub fn unknown_value(kind: &str, input: &str, valid: &[&str]) -> PulseError {
    let hint = closest_name(input, valid)
        .map(|name| format!(" (did you mean '{name}'?)"))
        .unwrap_or_default();
    PulseError::invalid_input(format!(
        "unknown {kind} '{input}'{hint}; expected one of: {}",
        valid.join(", ")
    ))
}

//! CLI definitions for pulse.
//!
//! Uses clap for argument parsing with derive macros. Domain names (entity
//! types, events, score fields) parse through their `FromStr` impls, so a
//! typo gets the same did-you-mean hint as the remote interface.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::{
    EntityKind, EntityStatus, EventType, ReactionType, ScoreField, SortOrder, VoteType,
};

/// pulse - engagement analytics and ranking
#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(version)]
#[command(about = "Engagement analytics and ranking for posts, comments and communities")]
#[command(long_about = r#"
pulse records views, votes, comments, shares and other interactions, keeps
rolling 1h/6h/24h/7d activity windows per entity, and derives ranking scores
(hot, trending, rising, quality, virality, popularity, controversy) from them.

Quick start:
  1. pulse create community rust
  2. pulse create post p1 --community rust
  3. pulse record post p1 vote --vote up --user alice
  4. pulse ranked post --by hot
"#)]
pub struct Cli {
    /// Path to the database file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Read configuration from this file instead of the user config
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Be verbose (repeat for trace output)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Be quiet (suppress non-error output)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a post, comment or community
    Create(CreateArgs),

    /// Record one engagement event
    Record(RecordArgs),

    /// Record events from a JSON Lines file
    Ingest(IngestArgs),

    /// Show an entity's counters and scores
    Show(ShowArgs),

    /// List entities ranked by a score
    Ranked(RankedArgs),

    /// List entities whose scores are due for a refresh
    Stale(StaleArgs),

    /// Rotate windows and refresh stale scores
    Maintain(MaintainArgs),

    /// Prune bucket and actor data of old entities
    Cleanup(CleanupArgs),

    /// Show or manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Entity type (post, comment, community)
    pub kind: EntityKind,

    /// Entity ID
    pub id: String,

    /// Parent community credited with this entity's engagement
    #[arg(long)]
    pub community: Option<String>,

    /// Author ID
    #[arg(long)]
    pub author: Option<String>,

    /// Tags (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Initial status
    #[arg(long, default_value = "active")]
    pub status: EntityStatus,

    /// Creation time (RFC 3339), defaults to now
    #[arg(long)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Entity type (post, comment, community)
    pub kind: EntityKind,

    /// Entity ID
    pub id: String,

    /// Event type (view, vote, comment, share, save, report, click, reaction,
    /// member_join, member_leave)
    pub event: EventType,

    /// Acting user
    #[arg(long, short = 'u')]
    pub user: Option<String>,

    /// Vote direction, required for vote events
    #[arg(long)]
    pub vote: Option<VoteType>,

    /// Reaction, required for reaction events
    #[arg(long)]
    pub reaction: Option<ReactionType>,

    /// Event time (RFC 3339), defaults to now
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON Lines file of `RecordEngagementEvent` objects ("-" for stdin)
    pub path: PathBuf,

    /// Keep going after a rejected event
    #[arg(long)]
    pub keep_going: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Entity type (post, comment, community)
    pub kind: EntityKind,

    /// Entity ID
    pub id: String,
}

#[derive(Args, Debug)]
pub struct RankedArgs {
    /// Entity type (post, comment, community)
    pub kind: EntityKind,

    /// Score to rank by
    #[arg(long, short = 'b', default_value = "hot")]
    pub by: ScoreField,

    /// Sort order (desc, asc)
    #[arg(long, short = 'o', default_value = "desc")]
    pub order: SortOrder,

    /// Maximum number of results
    #[arg(long, short = 'n', default_value = "20")]
    pub limit: usize,

    /// Only entities in this community
    #[arg(long)]
    pub community: Option<String>,

    /// Only entities by this author
    #[arg(long)]
    pub author: Option<String>,

    /// Only entities carrying all of these tags (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Only entities created at or after this time (RFC 3339)
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// Only entities created before this time (RFC 3339)
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Args, Debug)]
pub struct StaleArgs {
    /// Activity lookback in seconds (defaults to the configured lookback)
    #[arg(long)]
    pub lookback_secs: Option<u64>,

    /// Maximum number of entities (defaults to the configured batch cap)
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct MaintainArgs {
    /// Keep running on an interval until interrupted
    #[arg(long, short = 'w')]
    pub watch: bool,

    /// Seconds between runs in watch mode (defaults to the configured interval)
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Stop watch mode after this many seconds
    #[arg(long, requires = "watch")]
    pub duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Prune entities created more than this many days ago
    #[arg(long, short = 'd')]
    pub older_than_days: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the effective configuration
    #[arg(long)]
    pub show: bool,

    /// Write a default config file to the user config path
    #[arg(long)]
    pub init: bool,

    /// Print the user config file path
    #[arg(long)]
    pub path: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonPretty,
}

impl std::str::FromStr for OutputFormat {
    type Err = crate::PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "json-pretty" | "json_pretty" | "pretty" => Ok(Self::JsonPretty),
            other => Err(crate::error::unknown_value(
                "output format",
                other,
                &["text", "json", "json-pretty"],
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn record_parses_domain_names() {
        let cli = Cli::try_parse_from([
            "pulse", "record", "post", "p1", "vote", "--vote", "up", "--user", "alice",
        ])
        .unwrap();
        let Commands::Record(args) = cli.command else {
            panic!("expected record");
        };
        assert_eq!(args.kind, EntityKind::Post);
        assert_eq!(args.event, EventType::Vote);
        assert_eq!(args.vote, Some(VoteType::Up));
    }

    #[test]
    fn ranked_defaults() {
        let cli = Cli::try_parse_from(["pulse", "ranked", "post"]).unwrap();
        let Commands::Ranked(args) = cli.command else {
            panic!("expected ranked");
        };
        assert_eq!(args.by, ScoreField::Hot);
        assert_eq!(args.order, SortOrder::Descending);
        assert_eq!(args.limit, 20);
    }

    #[test]
    fn unknown_score_field_is_rejected() {
        let err = Cli::try_parse_from(["pulse", "ranked", "post", "--by", "hott"]).unwrap_err();
        assert!(err.to_string().contains("hot"));
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["pulse", "-vv", "stale"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn output_format_aliases() {
        assert_eq!("json-pretty".parse::<OutputFormat>().unwrap(), OutputFormat::JsonPretty);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}

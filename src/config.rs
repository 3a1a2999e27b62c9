//! Layered settings for the engine and the `pulse` binary.
//!
//! Later layers win: compiled defaults, `~/.config/pulse/config.toml` (or
//! `--config`), `PULSE_*` environment variables, then CLI flags.
//!
//! A full file looks like:
//!
//! ```toml
//! [paths]
//! db = "~/.local/share/pulse/pulse.db"
//!
//! [scoring]
//! recompute_mode = "queued"
//! recompute_workers = 4
//!
//! [maintenance]
//! interval_secs = 300
//! batch_cap = 100
//! refresh_interval_secs = 3600
//! cleanup_older_than_days = 90
//!
//! [output]
//! format = "text"
//! colors = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PulseError, Result, unknown_value};
use crate::scoring::{CONTROVERSY_MIN_VOTES, HOT_SCORE_ANCHOR, ScoringParams};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub scoring: ScoringConfig,
    pub maintenance: MaintenanceConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// `SQLite` file; `PULSE_DB`. Unset means the platform data directory.
    pub db: Option<PathBuf>,
}

/// When scores are recomputed after a recorded event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecomputeMode {
    /// Inline, before the record call returns.
    #[default]
    Sync,
    /// Handed to the background recompute queue.
    Queued,
}

impl std::str::FromStr for RecomputeMode {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sync" | "inline" => Ok(Self::Sync),
            "queued" | "queue" | "async" => Ok(Self::Queued),
            other => Err(unknown_value("recompute mode", other, &["sync", "queued"])),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Epoch seconds every hot score is measured from.
    pub hot_score_anchor: i64,

    /// Votes required before controversy is reported.
    pub controversy_min_votes: u64,

    /// Environment variable: `PULSE_RECOMPUTE_MODE`
    pub recompute_mode: RecomputeMode,

    /// Worker threads for queued recompute (0 = number of CPUs).
    /// Environment variable: `PULSE_RECOMPUTE_WORKERS`
    pub recompute_workers: usize,
}

/// Periodic refresh, rotation and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between runs in watch mode.
    /// Environment variable: `PULSE_MAINTENANCE_INTERVAL`
    pub interval_secs: u64,

    /// Maximum entities recomputed per run.
    /// Environment variable: `PULSE_BATCH_CAP`
    pub batch_cap: usize,

    /// Scores older than this are considered stale.
    pub refresh_interval_secs: u64,

    /// Only entities active within this window are refreshed.
    pub activity_lookback_secs: u64,

    /// Per-run deadline; remaining entities wait for the next run.
    pub run_deadline_secs: u64,

    /// Prune analytics of entities older than this many days (unset = never).
    /// Environment variable: `PULSE_CLEANUP_DAYS`
    pub cleanup_older_than_days: Option<u32>,

    /// Bound on multi-entity transactions.
    pub transaction_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// `text`, `json` or `json-pretty`; `PULSE_FORMAT`.
    pub format: String,
    pub colors: bool,
    /// No progress bars or confirmations; `PULSE_QUIET`.
    pub quiet: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            hot_score_anchor: HOT_SCORE_ANCHOR,
            controversy_min_votes: CONTROVERSY_MIN_VOTES,
            recompute_mode: RecomputeMode::Sync,
            recompute_workers: 0,
        }
    }
}

impl ScoringConfig {
    #[must_use]
    pub const fn params(&self) -> ScoringParams {
        ScoringParams {
            hot_score_anchor: self.hot_score_anchor,
            controversy_min_votes: self.controversy_min_votes,
        }
    }

    /// Worker count with 0 resolved to the available parallelism.
    #[must_use]
    pub fn workers(&self) -> usize {
        if self.recompute_workers > 0 {
            return self.recompute_workers;
        }
        std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_cap: 100,
            refresh_interval_secs: 3600,
            activity_lookback_secs: 3600,
            run_deadline_secs: 240,
            cleanup_older_than_days: None,
            transaction_timeout_secs: 30,
        }
    }
}

impl MaintenanceConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    #[must_use]
    pub const fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    #[must_use]
    pub fn refresh_interval(&self) -> chrono::Duration {
        span_from_secs(self.refresh_interval_secs)
    }

    #[must_use]
    pub fn activity_lookback(&self) -> chrono::Duration {
        span_from_secs(self.activity_lookback_secs)
    }
}

/// Longest span accepted for lookbacks and refresh intervals (100 years).
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 3600;

/// Seconds as a chrono span, clamped to [`MAX_SPAN_SECS`] so that
/// `now - span` cannot overflow.
#[must_use]
pub fn span_from_secs(secs: u64) -> chrono::Duration {
    let clamped = i64::try_from(secs.min(MAX_SPAN_SECS)).unwrap_or(0);
    chrono::Duration::try_seconds(clamped).unwrap_or_else(chrono::Duration::zero)
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            colors: true,
            quiet: false,
        }
    }
}

impl Config {
    /// Defaults, then the user file, then `PULSE_*` variables. A missing or
    /// unreadable user file is skipped with a log line.
    #[must_use]
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(file) = Self::user_config_path().and_then(|path| Self::load_from_file(&path)) {
            config.merge(file);
        }
        config.apply_env_overrides(|name| std::env::var(name).ok());
        debug!(?config, "configuration resolved");
        config
    }

    /// Like [`Config::from_file`], but a missing or invalid file yields `None`.
    #[must_use]
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file");
            return None;
        }
        match Self::from_file(path) {
            Ok(config) => {
                info!(path = %path.display(), "loaded config file");
                Some(config)
            }
            Err(err) => {
                warn!("skipping config file: {err}");
                None
            }
        }
    }

    /// # Errors
    ///
    /// [`PulseError::Path`] if the file cannot be read and
    /// [`PulseError::Config`] if it does not parse.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PulseError::path_error("read config", path, e))?;
        toml::from_str(&content).map_err(|e| PulseError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// `<config dir>/pulse/config.toml`.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pulse").join("config.toml"))
    }

    /// Write this configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// [`PulseError::Path`] on filesystem failures.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PulseError::path_error("create config directory", parent, e))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| PulseError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| PulseError::path_error("write config", path, e))?;
        info!(path = %path.display(), "wrote config file");
        Ok(())
    }

    /// Apply `PULSE_*` overrides read through `lookup`. Unparseable values
    /// are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            raw.parse()
                .map_err(|_| warn!(variable = name, value = %raw, "ignoring invalid override"))
                .ok()
        };

        if let Some(db) = lookup("PULSE_DB") {
            self.paths.db = Some(PathBuf::from(db));
        }
        if let Some(raw) = lookup("PULSE_RECOMPUTE_MODE") {
            match raw.parse() {
                Ok(mode) => self.scoring.recompute_mode = mode,
                Err(err) => warn!("ignoring PULSE_RECOMPUTE_MODE: {err}"),
            }
        }
        if let Some(n) = parsed("PULSE_RECOMPUTE_WORKERS") {
            self.scoring.recompute_workers = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(n) = parsed("PULSE_MAINTENANCE_INTERVAL") {
            self.maintenance.interval_secs = n;
        }
        if let Some(n) = parsed("PULSE_BATCH_CAP") {
            self.maintenance.batch_cap = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(days) = parsed("PULSE_CLEANUP_DAYS") {
            self.maintenance.cleanup_older_than_days = Some(u32::try_from(days).unwrap_or(u32::MAX));
        }
        if let Some(format) = lookup("PULSE_FORMAT") {
            self.output.format = format;
        }
        if lookup("PULSE_NO_COLOR").is_some() || lookup("NO_COLOR").is_some() {
            self.output.colors = false;
        }
        if lookup("PULSE_QUIET").is_some() {
            self.output.quiet = true;
        }
    }

    /// Overlay a file's settings. A file without `cleanup_older_than_days`
    /// keeps the current retention.
    fn merge(&mut self, file: Self) {
        let retention = file
            .maintenance
            .cleanup_older_than_days
            .or(self.maintenance.cleanup_older_than_days);
        self.paths.db = file.paths.db.or_else(|| self.paths.db.take());
        self.scoring = file.scoring;
        self.maintenance = MaintenanceConfig {
            cleanup_older_than_days: retention,
            ..file.maintenance
        };
        self.output = file.output;
    }

    /// Configured database path, else the platform default.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.paths.db.clone().unwrap_or_else(crate::default_db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_huge_spans_are_clamped() {
        let config = MaintenanceConfig {
            activity_lookback_secs: u64::MAX,
            ..MaintenanceConfig::default()
        };
        let span = config.activity_lookback();
        assert_eq!(span.num_seconds(), i64::try_from(MAX_SPAN_SECS).unwrap());
        let _ = chrono::Utc::now() - span;
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.maintenance.batch_cap, 100);
        assert_eq!(config.maintenance.refresh_interval_secs, 3600);
        assert_eq!(config.maintenance.transaction_timeout(), Duration::from_secs(30));
        assert_eq!(config.scoring.recompute_mode, RecomputeMode::Sync);
        assert_eq!(config.scoring.params(), ScoringParams::default());
        assert!(config.output.colors);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.scoring.recompute_mode = RecomputeMode::Queued;
        config.maintenance.cleanup_older_than_days = Some(30);
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str("[maintenance]\nbatch_cap = 7\n").unwrap();
        assert_eq!(parsed.maintenance.batch_cap, 7);
        assert_eq!(parsed.maintenance.interval_secs, 300);
        assert_eq!(parsed.scoring.hot_score_anchor, HOT_SCORE_ANCHOR);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.maintenance.cleanup_older_than_days = Some(90);
        let mut other = Config::default();
        other.maintenance.batch_cap = 50;
        other.paths.db = Some(PathBuf::from("/custom/path"));

        base.merge(other);

        assert_eq!(base.maintenance.batch_cap, 50);
        assert_eq!(base.maintenance.cleanup_older_than_days, Some(90));
        assert_eq!(base.paths.db, Some(PathBuf::from("/custom/path")));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("PULSE_DB", "/tmp/p.db"),
            ("PULSE_RECOMPUTE_MODE", "queued"),
            ("PULSE_BATCH_CAP", "25"),
            ("PULSE_CLEANUP_DAYS", "14"),
            ("NO_COLOR", "1"),
        ]));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/p.db"));
        assert_eq!(config.scoring.recompute_mode, RecomputeMode::Queued);
        assert_eq!(config.maintenance.batch_cap, 25);
        assert_eq!(config.maintenance.cleanup_older_than_days, Some(14));
        assert!(!config.output.colors);
    }

    #[test]
    fn test_invalid_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("PULSE_BATCH_CAP", "lots")]));
        assert_eq!(config.maintenance.batch_cap, 100);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[maintenance]\nbatch_cap = \"many\"\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert_eq!(err.error_kind(), "ConfigError");
        assert!(Config::load_from_file(&path).is_none());
    }

    #[test]
    fn test_write_to_creates_parents_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.maintenance.batch_cap = 9;
        config.write_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[paths]"));
        assert!(content.contains("[scoring]"));
        assert!(content.contains("[maintenance]"));
        assert!(content.contains("[output]"));
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }
}

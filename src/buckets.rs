//! Windowed activity buckets.
//!
//! Every tracked entity keeps, per granularity (1h, 6h, 24h, 7d), a `current`
//! and a `previous` window of raw event counts. Events land in every `current`
//! window at once; the maintenance job rotates expired windows. Velocity and
//! momentum are read from these snapshots by the score calculator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, unknown_value};

/// Window length of an activity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
}

impl Granularity {
    pub const ALL: [Self; 4] = [Self::OneHour, Self::SixHours, Self::OneDay, Self::SevenDays];

    const NAMES: &'static [&'static str] = &["1h", "6h", "24h", "7d"];

    /// Window length in hours.
    #[must_use]
    pub const fn hours(self) -> i64 {
        match self {
            Self::OneHour => 1,
            Self::SixHours => 6,
            Self::OneDay => 24,
            Self::SevenDays => 168,
        }
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        Duration::hours(self.hours())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneHour => "1h",
            Self::SixHours => "6h",
            Self::OneDay => "24h",
            Self::SevenDays => "7d",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::OneHour => 0,
            Self::SixHours => 1,
            Self::OneDay => 2,
            Self::SevenDays => 3,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1h" | "hour" => Ok(Self::OneHour),
            "6h" => Ok(Self::SixHours),
            "24h" | "1d" | "day" => Ok(Self::OneDay),
            "7d" | "week" => Ok(Self::SevenDays),
            other => Err(unknown_value("granularity", other, Self::NAMES)),
        }
    }
}

/// Metrics tracked inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Views,
    Upvotes,
    Downvotes,
    Comments,
    Shares,
    Saves,
    Clicks,
    Reports,
    Posts,
    Joins,
    /// upvotes + downvotes + comments + shares
    Engagement,
}

/// Raw per-window event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketCounts {
    pub views: u64,
    pub upvotes: u64,
    pub downvotes: u64,
    pub comments: u64,
    pub shares: u64,
    pub saves: u64,
    pub clicks: u64,
    pub reports: u64,
    pub posts: u64,
    pub joins: u64,
}

impl BucketCounts {
    /// Add another set of counts (saturating).
    pub fn add(&mut self, delta: &Self) {
        self.views = self.views.saturating_add(delta.views);
        self.upvotes = self.upvotes.saturating_add(delta.upvotes);
        self.downvotes = self.downvotes.saturating_add(delta.downvotes);
        self.comments = self.comments.saturating_add(delta.comments);
        self.shares = self.shares.saturating_add(delta.shares);
        self.saves = self.saves.saturating_add(delta.saves);
        self.clicks = self.clicks.saturating_add(delta.clicks);
        self.reports = self.reports.saturating_add(delta.reports);
        self.posts = self.posts.saturating_add(delta.posts);
        self.joins = self.joins.saturating_add(delta.joins);
    }

    #[must_use]
    pub const fn get(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Views => self.views,
            Metric::Upvotes => self.upvotes,
            Metric::Downvotes => self.downvotes,
            Metric::Comments => self.comments,
            Metric::Shares => self.shares,
            Metric::Saves => self.saves,
            Metric::Clicks => self.clicks,
            Metric::Reports => self.reports,
            Metric::Posts => self.posts,
            Metric::Joins => self.joins,
            Metric::Engagement => self
                .upvotes
                .saturating_add(self.downvotes)
                .saturating_add(self.comments)
                .saturating_add(self.shares),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A single window `[window_start, window_end)` with its counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSnapshot {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counts: BucketCounts,
}

impl BucketSnapshot {
    /// Fresh empty window of length `granularity` starting at `start`.
    #[must_use]
    pub fn fresh(start: DateTime<Utc>, granularity: Granularity) -> Self {
        Self {
            window_start: start,
            window_end: start + granularity.duration(),
            counts: BucketCounts::default(),
        }
    }

    /// Zero-width empty window, used as the initial `previous` slot.
    #[must_use]
    pub fn empty_at(at: DateTime<Utc>) -> Self {
        Self {
            window_start: at,
            window_end: at,
            counts: BucketCounts::default(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }
}

/// Current and previous window for one granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowPair {
    pub granularity: Granularity,
    pub current: BucketSnapshot,
    pub previous: BucketSnapshot,
}

impl WindowPair {
    #[must_use]
    pub fn starting_at(granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self {
            granularity,
            current: BucketSnapshot::fresh(now, granularity),
            previous: BucketSnapshot::empty_at(now),
        }
    }

    /// Roll `current` into `previous` if it has expired. Returns whether it rotated.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> bool {
        if !self.current.is_expired(now) {
            return false;
        }
        self.previous = self.current;
        self.current = BucketSnapshot::fresh(now, self.granularity);
        true
    }
}

/// The full set of activity windows for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityBuckets {
    windows: [WindowPair; 4],
}

impl ActivityBuckets {
    /// All windows start empty at `now`.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            windows: Granularity::ALL.map(|g| WindowPair::starting_at(g, now)),
        }
    }

    /// Rebuild from stored window pairs; missing granularities start at `fallback`.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = WindowPair>, fallback: DateTime<Utc>) -> Self {
        let mut buckets = Self::starting_at(fallback);
        for pair in pairs {
            buckets.windows[pair.granularity.index()] = pair;
        }
        buckets
    }

    #[must_use]
    pub const fn window(&self, granularity: Granularity) -> &WindowPair {
        &self.windows[granularity.index()]
    }

    #[must_use]
    pub const fn current(&self, granularity: Granularity) -> &BucketSnapshot {
        &self.windows[granularity.index()].current
    }

    #[must_use]
    pub const fn previous(&self, granularity: Granularity) -> &BucketSnapshot {
        &self.windows[granularity.index()].previous
    }

    pub fn pairs(&self) -> impl Iterator<Item = &WindowPair> {
        self.windows.iter()
    }

    /// Add `delta` to every `current` window.
    pub fn record(&mut self, delta: &BucketCounts) {
        for pair in &mut self.windows {
            pair.current.counts.add(delta);
        }
    }

    /// Rotate every expired window. Returns how many granularities rotated.
    ///
    /// Running this twice at the same instant is a no-op the second time: a
    /// freshly started window always ends after `now`.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> usize {
        self.windows
            .iter_mut()
            .map(|pair| usize::from(pair.rotate(now)))
            .sum()
    }

    /// True if at least one window needs rotating at `now`.
    #[must_use]
    pub fn needs_rotation(&self, now: DateTime<Utc>) -> bool {
        self.windows.iter().any(|pair| pair.current.is_expired(now))
    }

    /// Count in the current window divided by the window length in hours.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn velocity(&self, granularity: Granularity, metric: Metric) -> f64 {
        self.current(granularity).counts.get(metric) as f64 / granularity.hours() as f64
    }

    /// First difference of the hourly window: `current[1h] - previous[1h]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn momentum(&self, metric: Metric) -> f64 {
        let current = self.current(Granularity::OneHour).counts.get(metric) as f64;
        let previous = self.previous(Granularity::OneHour).counts.get(metric) as f64;
        current - previous
    }
}

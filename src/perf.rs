//! Latency budgets for pulse operations.
//!
//! Every hot path starts a [`Timer`] against one of the budgets below. On
//! stop the timer logs at debug while the operation stays under its warning
//! threshold and at warn past it; the benches compare against the ceiling.
//!
//! | Tier | Target | Warning | Ceiling | Used by |
//! |------|--------|---------|---------|---------|
//! | Instant | 1ms | 5ms | 50ms | entity creation |
//! | Write | 2ms | 10ms | 100ms | event recording, score refresh |
//! | Fast | 10ms | 50ms | 500ms | ranked listings, stale selection, open |
//! | Slow | 1s | 5s | 30s | maintenance passes, cleanup |

use std::time::{Duration, Instant};
use tracing::{Level, debug, warn};

/// Latency tier shared by several budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Instant,
    Write,
    Fast,
    Slow,
}

impl Tier {
    /// `(target, warning, ceiling)` in milliseconds.
    const fn thresholds_ms(self) -> (u64, u64, u64) {
        match self {
            Self::Instant => (1, 5, 50),
            Self::Write => (2, 10, 100),
            Self::Fast => (10, 50, 500),
            Self::Slow => (1_000, 5_000, 30_000),
        }
    }
}

/// Named latency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub name: &'static str,
    pub tier: Tier,
}

impl Budget {
    #[must_use]
    pub const fn new(name: &'static str, tier: Tier) -> Self {
        Self { name, tier }
    }

    /// Expected p99.
    #[must_use]
    pub const fn target(self) -> Duration {
        Duration::from_millis(self.tier.thresholds_ms().0)
    }

    /// Above this the timer logs a warning.
    #[must_use]
    pub const fn warning(self) -> Duration {
        Duration::from_millis(self.tier.thresholds_ms().1)
    }

    /// Above this a bench run is considered a regression.
    #[must_use]
    pub const fn ceiling(self) -> Duration {
        Duration::from_millis(self.tier.thresholds_ms().2)
    }

    #[must_use]
    pub fn status(self, elapsed: Duration) -> BudgetStatus {
        if elapsed <= self.target() {
            BudgetStatus::OnTarget
        } else if elapsed <= self.warning() {
            BudgetStatus::Acceptable
        } else if elapsed <= self.ceiling() {
            BudgetStatus::Slow
        } else {
            BudgetStatus::Exceeded
        }
    }
}

/// Where a measured duration falls within its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    OnTarget,
    Acceptable,
    Slow,
    Exceeded,
}

impl BudgetStatus {
    #[must_use]
    pub const fn level(self) -> Level {
        match self {
            Self::OnTarget | Self::Acceptable => Level::DEBUG,
            Self::Slow | Self::Exceeded => Level::WARN,
        }
    }
}

// Write path
pub const RECORD_EVENT: Budget = Budget::new("record_event", Tier::Write);
pub const CREATE_ENTITY: Budget = Budget::new("create_entity", Tier::Instant);
pub const RECOMPUTE: Budget = Budget::new("recompute", Tier::Write);

// Read path
pub const TOP_BY_SCORE: Budget = Budget::new("top_by_score", Tier::Fast);
pub const STALE_SELECTION: Budget = Budget::new("stale_selection", Tier::Fast);
pub const STORAGE_OPEN: Budget = Budget::new("storage_open", Tier::Fast);

// Maintenance
pub const MAINTENANCE_RUN: Budget = Budget::new("maintenance_run", Tier::Slow);
pub const CLEANUP: Budget = Budget::new("cleanup", Tier::Slow);

/// Measures one operation against its budget.
#[derive(Debug)]
pub struct Timer {
    budget: Budget,
    start: Instant,
}

impl Timer {
    #[must_use]
    pub fn start(budget: Budget) -> Self {
        Self {
            budget,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop, log against the budget and return the elapsed time.
    pub fn stop(self) -> Duration {
        let (elapsed, status) = self.finish();
        let elapsed_ms = elapsed.as_millis();
        if status.level() == Level::WARN {
            warn!(
                operation = self.budget.name,
                elapsed_ms,
                warning_ms = self.budget.warning().as_millis(),
                over_ceiling = status == BudgetStatus::Exceeded,
                "operation over budget"
            );
        } else {
            debug!(operation = self.budget.name, elapsed_ms, ?status, "operation timed");
        }
        elapsed
    }

    /// Stop without logging.
    #[must_use]
    pub fn finish(&self) -> (Duration, BudgetStatus) {
        let elapsed = self.elapsed();
        (elapsed, self.budget.status(elapsed))
    }
}

/// Evaluate `$expr` under a [`Timer`] for `$budget`.
#[macro_export]
macro_rules! timed {
    ($budget:expr, $expr:expr) => {{
        let timer = $crate::perf::Timer::start($budget);
        let result = $expr;
        timer.stop();
        result
    }};
}

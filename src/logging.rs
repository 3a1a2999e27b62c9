//! Subscriber setup for pulse binaries and tests.
//!
//! Library code only emits `tracing` events with structured fields (entity
//! key, operation, durations); nothing below is needed to use the crate as a
//! library.
//!
//! ```rust
//! use pulse::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default());
//! tracing::info!(entity = "post:p1", "recorded event");
//! ```
//!
//! `RUST_LOG` wins over the configured level.

use std::time::Instant;

use tracing::Subscriber;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// How each event is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    /// Multi-line, for reading a single maintenance pass.
    Pretty,
    Compact,
    /// Compact plus thread names, file and line. Useful with the rayon pool.
    Detailed,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub style: LogStyle,
    pub timestamps: bool,
    /// Print the module path of each event.
    pub target: bool,
    /// Log span enter/exit.
    pub spans: bool,
    pub colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            style: LogStyle::Compact,
            timestamps: true,
            target: false,
            spans: false,
            colors: true,
        }
    }
}

impl LogConfig {
    /// Derive the CLI configuration from `-q` and the `-v` count.
    ///
    /// Quiet keeps errors only, no flag shows warnings, `-v` debug and `-vv`
    /// everything with source locations.
    #[must_use]
    pub fn for_cli(quiet: bool, verbosity: u8, colors: bool) -> Self {
        let base = Self {
            timestamps: false,
            colors,
            ..Self::default()
        };
        match (quiet, verbosity) {
            (true, _) => Self {
                level: LevelFilter::ERROR,
                ..base
            },
            (false, 0) => Self {
                level: LevelFilter::WARN,
                ..base
            },
            (false, 1) => Self {
                level: LevelFilter::DEBUG,
                style: LogStyle::Pretty,
                timestamps: true,
                target: true,
                ..base
            },
            (false, _) => Self {
                level: LevelFilter::TRACE,
                style: LogStyle::Detailed,
                timestamps: true,
                target: true,
                spans: true,
                ..base
            },
        }
    }

    /// Directive used when `RUST_LOG` is unset.
    #[must_use]
    pub fn filter_directive(&self) -> String {
        format!("pulse={}", self.level)
    }

    fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(self.filter_directive())
        }
    }

    fn fmt_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let spans = if self.spans {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_ansi(self.colors)
            .with_target(self.target)
            .with_span_events(spans);

        match (self.style, self.timestamps) {
            (LogStyle::Pretty, true) => base.pretty().boxed(),
            (LogStyle::Pretty, false) => base.pretty().without_time().boxed(),
            (LogStyle::Compact, true) => base.compact().boxed(),
            (LogStyle::Compact, false) => base.compact().without_time().boxed(),
            (LogStyle::Detailed, _) => base
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        }
    }
}

/// Install the global subscriber. Only the first call in a process wins.
pub fn init_logging(config: &LogConfig) {
    let installed = tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.env_filter())
        .try_init();
    if installed.is_err() {
        tracing::trace!("subscriber already installed");
    }
}

/// Silent unless `RUST_LOG` is set.
pub fn init_test_logging() {
    init_logging(&LogConfig {
        level: LevelFilter::OFF,
        ..LogConfig::default()
    });
}

pub fn init_cli_logging(quiet: bool, verbosity: u8, colors: bool) {
    init_logging(&LogConfig::for_cli(quiet, verbosity, colors));
}

/// Brackets a named operation with start and outcome events.
#[derive(Debug)]
pub struct OperationGuard {
    name: &'static str,
    start: Instant,
}

impl OperationGuard {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        tracing::debug!(operation = name, "operation started");
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn complete(self) {
        tracing::info!(
            operation = self.name,
            duration_ms = self.start.elapsed().as_millis(),
            "operation completed"
        );
    }

    pub fn fail(self, error: &dyn std::error::Error) {
        tracing::error!(
            operation = self.name,
            duration_ms = self.start.elapsed().as_millis(),
            error = %error,
            "operation failed"
        );
    }
}

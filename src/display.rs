//! Text formatting shared by the CLI's human-readable output.

use chrono::{DateTime, Datelike, Utc};

/// Width of the rule printed under headings.
pub const DIVIDER_WIDTH: usize = 60;

/// `1234567` as `1,234,567`.
#[must_use]
pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Scores keep four decimals until they are large enough that only the
/// integer part matters (hot scores sit in the tens of thousands).
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_score(value: f64) -> String {
    if value.abs() < 1000.0 {
        return format!("{value:.4}");
    }
    let magnitude = format_count(value.abs().round() as u64);
    if value < 0.0 {
        format!("-{magnitude}")
    } else {
        magnitude
    }
}

/// Age of `at` relative to now.
#[must_use]
pub fn format_age(at: DateTime<Utc>) -> String {
    format_age_at(at, Utc::now())
}

/// Age of `at` as seen from `now`: minutes, hours and days for the last
/// week, then a calendar date. Future timestamps print as a full date.
#[must_use]
pub fn format_age_at(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(at);
    match age.num_seconds() {
        s if s < 0 => at.format("%b %d, %Y").to_string(),
        s if s < 60 => "just now".to_string(),
        _ if age.num_hours() < 1 => format!("{}m ago", age.num_minutes()),
        _ if age.num_days() < 1 => format!("{}h ago", age.num_hours()),
        _ if age.num_days() < 7 => format!("{}d ago", age.num_days()),
        _ if at.year() == now.year() => at.format("%b %d").to_string(),
        _ => at.format("%b %d, %Y").to_string(),
    }
}

/// `never` for entities that have not been scored yet.
#[must_use]
pub fn format_last_scored(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "never".to_string(), format_age)
}

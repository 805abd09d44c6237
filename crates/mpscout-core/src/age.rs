//! Relative-age and config-duration parsing.
//!
//! Both parsers are total: they never fail, they fall back. A listing whose age can't be
//! read must never look fresh, while a config value that can't be read must never
//! silently disable the recency gate.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

/// Age assigned to post times that cannot be parsed ("over a month ago", empty text).
pub const UNPARSEABLE_AGE: Duration = Duration::from_secs(999 * 24 * 60 * 60);

/// Fallback used when a configured duration cannot be parsed.
pub const DEFAULT_CONFIG_DURATION: Duration = Duration::from_secs(10 * 60);

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

static MAGNITUDE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\ban?\b").expect("magnitude pattern is valid"));
static RELATIVE_AGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s+(minute|hour|day|week)s?").expect("relative age pattern is valid")
});
// No week unit for config durations.
static CONFIG_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+(minute|hour|day)s?").expect("config duration pattern is valid")
});

fn normalize(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    MAGNITUDE_WORD.replace_all(&lower, "1").into_owned()
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit {
        "minute" => Some(MINUTE),
        "hour" => Some(HOUR),
        "day" => Some(DAY),
        "week" => Some(WEEK),
        _ => None,
    }
}

fn captured_duration(pattern: &Regex, text: &str) -> Option<Duration> {
    let caps = pattern.captures(text)?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = unit_seconds(caps.get(2)?.as_str())?;
    value.checked_mul(unit).map(Duration::from_secs)
}

/// Parses rendered post times like "5 minutes ago", "an hour ago" or "Just now".
pub fn parse_relative_age(text: &str) -> Duration {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return UNPARSEABLE_AGE;
    }
    if normalized.contains("just now") {
        return Duration::from_secs(MINUTE);
    }
    captured_duration(&RELATIVE_AGE, &normalized).unwrap_or(UNPARSEABLE_AGE)
}

/// Parses configured durations like "12 hours" or "1 day".
///
/// Anything else logs a warning and yields [`DEFAULT_CONFIG_DURATION`].
pub fn parse_config_duration(text: &str) -> Duration {
    match captured_duration(&CONFIG_DURATION, &normalize(text)) {
        Some(duration) => duration,
        None => {
            warn!(
                value = text,
                "could not parse duration; defaulting to {} minutes",
                DEFAULT_CONFIG_DURATION.as_secs() / MINUTE
            );
            DEFAULT_CONFIG_DURATION
        }
    }
}

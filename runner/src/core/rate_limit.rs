//! Rate-limit wait computation and reset-time parsing.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bounds for rate-limit backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Wait used when the error carries no reset time.
    pub fallback_wait_secs: u64,
    /// Waits longer than this abort the run instead of sleeping.
    pub max_wait_secs: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            fallback_wait_secs: 60,
            max_wait_secs: 60 * 60,
        }
    }
}

/// What the engine should do about one rate-limit error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Sleep this long, then retry the same iteration.
    Wait(Duration),
    /// The required wait exceeds the ceiling.
    Abort(Duration),
}

impl RateLimitPolicy {
    pub fn fallback_wait(&self) -> Duration {
        Duration::from_secs(self.fallback_wait_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Server reset time wins over the fallback. Reset times in the past wait zero.
    pub fn decide(&self, reset_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> RateLimitDecision {
        let wait = match reset_time {
            Some(reset) => (reset - now).to_std().unwrap_or(Duration::ZERO),
            None => self.fallback_wait(),
        };
        if wait > self.max_wait() {
            RateLimitDecision::Abort(wait)
        } else {
            RateLimitDecision::Wait(wait)
        }
    }
}

static EPOCH_RESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)limit reached\|(\d{9,13})").expect("epoch reset regex")
});

static RFC3339_RESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets? at\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))")
        .expect("rfc3339 reset regex")
});

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[ -]after:?\s+(\d+)\s*(s|sec|secs|seconds?|m|min|mins|minutes?)?\b")
        .expect("retry-after regex")
});

/// Extract a reset time from rate-limit error text.
///
/// Recognized forms: `limit reached|<epoch seconds or millis>`,
/// `resets at <RFC 3339>`, and `retry after N [s|m]`.
pub fn parse_reset_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = EPOCH_RESET.captures(text)
        && let Ok(raw) = caps[1].parse::<i64>()
    {
        let secs = if caps[1].len() > 10 { raw / 1000 } else { raw };
        return DateTime::from_timestamp(secs, 0);
    }
    if let Some(caps) = RFC3339_RESET.captures(text)
        && let Ok(parsed) = DateTime::parse_from_rfc3339(&caps[1])
    {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Some(caps) = RETRY_AFTER.captures(text) {
        // Amounts beyond the representable range mean "not in this lifetime".
        let amount = caps[1].parse::<i64>().unwrap_or(i64::MAX);
        let minutes = caps
            .get(2)
            .is_some_and(|unit| unit.as_str().to_ascii_lowercase().starts_with('m'));
        let delta = if minutes {
            TimeDelta::try_minutes(amount)
        } else {
            TimeDelta::try_seconds(amount)
        };
        let reset = delta
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        return Some(reset);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn fallback_used_without_reset_time() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.decide(None, at(0)),
            RateLimitDecision::Wait(Duration::from_secs(60))
        );
    }

    #[test]
    fn reset_time_beyond_ceiling_aborts() {
        let policy = RateLimitPolicy {
            fallback_wait_secs: 1,
            max_wait_secs: 10,
        };
        assert_eq!(
            policy.decide(Some(at(100)), at(0)),
            RateLimitDecision::Abort(Duration::from_secs(100))
        );
        assert_eq!(
            policy.decide(Some(at(5)), at(0)),
            RateLimitDecision::Wait(Duration::from_secs(5))
        );
    }

    #[test]
    fn past_reset_waits_zero() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.decide(Some(at(0)), at(50)),
            RateLimitDecision::Wait(Duration::ZERO)
        );
    }

    #[test]
    fn parses_epoch_seconds_and_millis() {
        let now = at(0);
        assert_eq!(parse_reset_time("usage limit reached|1700000000", now), Some(at(1_700_000_000)));
        assert_eq!(
            parse_reset_time("usage limit reached|1700000000000", now),
            Some(at(1_700_000_000))
        );
    }

    #[test]
    fn parses_rfc3339_and_retry_after() {
        let now = at(1_000);
        assert_eq!(
            parse_reset_time("limit resets at 1970-01-01T00:20:00Z", now),
            Some(at(1_200))
        );
        assert_eq!(parse_reset_time("please retry after 30 seconds", now), Some(at(1_030)));
        assert_eq!(parse_reset_time("Retry-After: 2 min", now), Some(at(1_120)));
        assert_eq!(parse_reset_time("slow down", now), None);
    }

    #[test]
    fn absurd_retry_after_saturates_and_aborts() {
        let now = Utc::now();
        let policy = RateLimitPolicy::default();
        for text in [
            "429 rate limit, retry after 10000000000000 seconds",
            "retry after 10000000000000 minutes",
            "retry after 99999999999999999999999 s",
        ] {
            let reset = parse_reset_time(text, now).expect("reset time");
            assert_eq!(reset, DateTime::<Utc>::MAX_UTC, "{text}");
            assert!(
                matches!(policy.decide(Some(reset), now), RateLimitDecision::Abort(_)),
                "{text}"
            );
        }
    }
}

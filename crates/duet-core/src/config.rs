//! Pipeline and worker configuration
//!
//! Every knob has a default and can be overridden from the environment.
//! Unparseable or out-of-range values fall back to the default with a
//! warning.

use std::str::FromStr;

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::warn;

/// How the matcher picks among qualifying candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchSelection {
    /// Highest similarity, then closest timestamp, then lowest id
    #[default]
    Best,
    /// First candidate (by creation order) over the threshold
    First,
}

impl MatchSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::First => "first",
        }
    }
}

impl FromStr for MatchSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "best" => Ok(Self::Best),
            "first" => Ok(Self::First),
            _ => Err(format!("Unknown match selection: {}", s)),
        }
    }
}

/// Windows, tolerances and thresholds for synchronous ingestion
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Trailing window in which a same-channel repeat is a duplicate
    pub dedup_window: Duration,
    /// Relative amount tolerance for duplicates (0.005 = 0.5%)
    pub dedup_tolerance: Decimal,
    /// Half-width of the cross-channel match window
    pub match_window: Duration,
    /// Relative amount tolerance for matches (0.01 = 1%)
    pub match_tolerance: Decimal,
    /// How long a new record stays matchable
    pub match_expiry: Duration,
    /// Minimum merchant similarity for a match
    pub similarity_threshold: f64,
    pub selection: MatchSelection,
    /// Delay before a fresh PENDING record re-attempts matching
    pub retry_match_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::seconds(600),
            dedup_tolerance: Decimal::new(5, 3),
            match_window: Duration::seconds(900),
            match_tolerance: Decimal::new(1, 2),
            match_expiry: Duration::seconds(600),
            similarity_threshold: 0.8,
            selection: MatchSelection::Best,
            retry_match_delay: Duration::seconds(60),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dedup_window: env_secs("DUET_DEDUP_WINDOW_SECS", d.dedup_window),
            dedup_tolerance: env_tolerance("DUET_DEDUP_TOLERANCE", d.dedup_tolerance),
            match_window: env_secs("DUET_MATCH_WINDOW_SECS", d.match_window),
            match_tolerance: env_tolerance("DUET_MATCH_TOLERANCE", d.match_tolerance),
            match_expiry: env_secs("DUET_MATCH_EXPIRY_SECS", d.match_expiry),
            similarity_threshold: env_checked(
                "DUET_SIMILARITY_THRESHOLD",
                d.similarity_threshold,
                |t| (0.0..=1.0).contains(t),
            ),
            selection: env_or("DUET_MATCH_SELECTION", d.selection),
            retry_match_delay: env_secs("DUET_RETRY_MATCH_DELAY_SECS", d.retry_match_delay),
        }
    }
}

/// Enrichment worker limits and retry ladder
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs executing at once
    pub concurrency: usize,
    pub max_attempts: u32,
    /// Base retry delay in milliseconds, doubled per attempt
    pub backoff_ms: u64,
    /// Idle sleep between empty polls
    pub poll_interval: std::time::Duration,
    /// How long a leased job may run before it is handed out again
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_ms: 3000,
            poll_interval: std::time::Duration::from_millis(1000),
            lease_duration: Duration::seconds(300),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let poll_ms: u64 = env_or("DUET_WORKER_POLL_MS", d.poll_interval.as_millis() as u64);
        Self {
            concurrency: env_or("DUET_WORKER_CONCURRENCY", d.concurrency).max(1),
            max_attempts: env_or("DUET_JOB_MAX_ATTEMPTS", d.max_attempts).max(1),
            backoff_ms: env_or("DUET_JOB_BACKOFF_MS", d.backoff_ms),
            poll_interval: std::time::Duration::from_millis(poll_ms),
            lease_duration: env_secs("DUET_JOB_LEASE_SECS", d.lease_duration),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            default
        }),
        Err(_) => default,
    }
}

/// Like `env_or`, but a parsed value failing `valid` also falls back
fn env_checked<T, F>(key: &str, default: T, valid: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(&T) -> bool,
{
    let value = env_or(key, default);
    if valid(&value) {
        value
    } else {
        warn!(key, %value, "Configuration value out of range, using default");
        default
    }
}

/// Longest window or delay accepted from the environment (ten years)
const MAX_CONFIG_SECS: i64 = 10 * 366 * 24 * 60 * 60;

/// Whole seconds, between zero and `MAX_CONFIG_SECS`
fn env_secs(key: &str, default: Duration) -> Duration {
    let secs = env_checked(key, default.num_seconds(), |s| {
        (0..=MAX_CONFIG_SECS).contains(s)
    });
    Duration::try_seconds(secs).unwrap_or(default)
}

/// A relative tolerance; negative values are refused
fn env_tolerance(key: &str, default: Decimal) -> Decimal {
    env_checked(key, default, |t| !t.is_sign_negative())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.dedup_window, Duration::minutes(10));
        assert_eq!(config.dedup_tolerance.to_string(), "0.005");
        assert_eq!(config.match_window, Duration::minutes(15));
        assert_eq!(config.match_tolerance.to_string(), "0.01");
        assert_eq!(config.match_expiry, Duration::minutes(10));
        assert_eq!(config.selection, MatchSelection::Best);
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_ms, 3000);
    }

    #[test]
    fn test_match_selection_parsing() {
        assert_eq!("FIRST".parse::<MatchSelection>().unwrap(), MatchSelection::First);
        assert_eq!(" best ".parse::<MatchSelection>().unwrap(), MatchSelection::Best);
        assert!("random".parse::<MatchSelection>().is_err());
    }

    #[test]
    fn test_invalid_env_value_uses_default() {
        std::env::set_var("DUET_TEST_ONLY_BAD_NUMBER", "lots");
        assert_eq!(env_or("DUET_TEST_ONLY_BAD_NUMBER", 7u32), 7);
        std::env::remove_var("DUET_TEST_ONLY_BAD_NUMBER");
    }

    #[test]
    fn test_out_of_range_seconds_use_default() {
        let default = Duration::seconds(600);

        std::env::set_var("DUET_TEST_ONLY_HUGE_SECS", i64::MAX.to_string());
        assert_eq!(env_secs("DUET_TEST_ONLY_HUGE_SECS", default), default);
        std::env::remove_var("DUET_TEST_ONLY_HUGE_SECS");

        std::env::set_var("DUET_TEST_ONLY_NEGATIVE_SECS", "-30");
        assert_eq!(env_secs("DUET_TEST_ONLY_NEGATIVE_SECS", default), default);
        std::env::remove_var("DUET_TEST_ONLY_NEGATIVE_SECS");

        std::env::set_var("DUET_TEST_ONLY_GOOD_SECS", "120");
        assert_eq!(
            env_secs("DUET_TEST_ONLY_GOOD_SECS", default),
            Duration::seconds(120)
        );
        std::env::remove_var("DUET_TEST_ONLY_GOOD_SECS");
    }

    #[test]
    fn test_negative_tolerance_uses_default() {
        let default = Decimal::new(5, 3);

        std::env::set_var("DUET_TEST_ONLY_NEGATIVE_TOLERANCE", "-0.01");
        assert_eq!(env_tolerance("DUET_TEST_ONLY_NEGATIVE_TOLERANCE", default), default);
        std::env::remove_var("DUET_TEST_ONLY_NEGATIVE_TOLERANCE");

        std::env::set_var("DUET_TEST_ONLY_ZERO_TOLERANCE", "0");
        assert_eq!(
            env_tolerance("DUET_TEST_ONLY_ZERO_TOLERANCE", default),
            Decimal::ZERO
        );
        std::env::remove_var("DUET_TEST_ONLY_ZERO_TOLERANCE");
    }

    #[test]
    fn test_similarity_threshold_must_be_a_fraction() {
        std::env::set_var("DUET_TEST_ONLY_THRESHOLD", "1.5");
        assert_eq!(
            env_checked("DUET_TEST_ONLY_THRESHOLD", 0.8, |t: &f64| (0.0..=1.0).contains(t)),
            0.8
        );
        std::env::remove_var("DUET_TEST_ONLY_THRESHOLD");
    }
}

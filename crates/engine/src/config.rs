//! Engine configuration and the poll backoff policy derived from it.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recognized engine options.
///
/// Durations are (de)serialized as integer milliseconds; missing fields take
/// their default so partial documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Pending checks required before work starts on an unconfirmed payment.
    pub optimistic_threshold: u32,
    /// Delay before the first status check (and base of the backoff curve).
    #[serde(with = "duration_ms")]
    pub poll_initial_delay: Duration,
    /// Growth factor between consecutive checks of one job.
    pub poll_factor: f64,
    /// Cap on the delay between two checks of one job.
    #[serde(with = "duration_ms")]
    pub poll_max_delay: Duration,
    /// Scheduler tick; bounds check granularity only.
    #[serde(with = "duration_ms")]
    pub global_tick_interval: Duration,
    /// Absolute lifetime of an unconfirmed job, measured from creation.
    #[serde(with = "duration_ms")]
    pub job_timeout: Duration,
    /// Zero-priced jobs skip the payment gate when set.
    pub allow_free_jobs: bool,
    /// Upper bound on optimistic executor invocations for one job.
    pub max_optimistic_attempts: u32,
    /// Floor on the wait after a failed optimistic attempt.
    #[serde(with = "duration_ms")]
    pub optimistic_retry_cooldown: Duration,
    /// Capacity of the transition broadcast channel.
    pub event_buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimistic_threshold: 3,
            poll_initial_delay: Duration::from_secs(5),
            poll_factor: 1.5,
            poll_max_delay: Duration::from_secs(60),
            global_tick_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(10 * 60),
            allow_free_jobs: false,
            max_optimistic_attempts: 3,
            optimistic_retry_cooldown: Duration::ZERO,
            event_buffer_capacity: 256,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

impl EngineConfig {
    /// Defaults overlaid with `PAYGATE_*` environment variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "PAYGATE_OPTIMISTIC_THRESHOLD")? {
            cfg.optimistic_threshold = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PAYGATE_POLL_INITIAL_DELAY_MS")? {
            cfg.poll_initial_delay = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "PAYGATE_POLL_FACTOR")? {
            cfg.poll_factor = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PAYGATE_POLL_MAX_DELAY_MS")? {
            cfg.poll_max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PAYGATE_TICK_INTERVAL_MS")? {
            cfg.global_tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAYGATE_JOB_TIMEOUT_SECS")? {
            cfg.job_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&lookup, "PAYGATE_ALLOW_FREE_JOBS")? {
            cfg.allow_free_jobs = v;
        }
        if let Some(v) = parse_var(&lookup, "PAYGATE_MAX_OPTIMISTIC_ATTEMPTS")? {
            cfg.max_optimistic_attempts = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.poll_factor.is_finite() || self.poll_factor < 1.0 {
            return Err(ConfigError::Constraint(format!(
                "pollFactor must be finite and >= 1.0 (got {})",
                self.poll_factor
            )));
        }
        if self.poll_initial_delay > self.poll_max_delay {
            return Err(ConfigError::Constraint(
                "pollInitialDelay must not exceed pollMaxDelay".to_string(),
            ));
        }
        if self.global_tick_interval.is_zero() {
            return Err(ConfigError::Constraint(
                "globalTickInterval must be positive".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(ConfigError::Constraint("jobTimeout must be positive".to_string()));
        }
        if self.event_buffer_capacity == 0 {
            return Err(ConfigError::Constraint(
                "eventBufferCapacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.poll_initial_delay,
            factor: self.poll_factor,
            max_delay: self.poll_max_delay,
        }
    }
}

/// Read one process environment variable; `None` when unset.
pub fn env_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    parse_var(&|k: &str| std::env::var(k).ok(), key)
}

/// Look `key` up through `lookup` and parse it; unparsable values are
/// reported with the key they came from.
pub fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

/// Per-job exponential backoff between status checks.
///
/// `delay(n) = min(initial_delay * factor^n, max_delay)`; `n` is the number of
/// checks already performed, so the very first check also waits `initial_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let exp = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        if secs.is_nan() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
            .max(self.initial_delay)
            .min(self.max_delay)
    }

    /// When the next check of a job last polled at `last_polled_at` is due.
    pub fn next_due(&self, last_polled_at: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        add_saturating(last_polled_at, self.delay(attempts))
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

pub(crate) fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

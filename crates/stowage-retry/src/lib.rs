//! Backoff strategies and rate-limit response parsing for storage drivers.
//!
//! Remote backends throttle aggressively and inconsistently. This crate
//! provides the two halves drivers need to survive that:
//!
//! - [`BackoffConfig`] / [`delay_for_attempt`] — capped exponential, linear
//!   and constant backoff with jitter, used when the backend gives no hint
//! - [`rate_limit_delay`] — provider-hint resolution. By default `Retry-After`
//!   (seconds or HTTP-date) dominates, then a body `retry_after` (fractional
//!   seconds), then the reset headers, and only then computed backoff; a
//!   driver whose backend documents the body as authoritative flips the
//!   first two via [`RateLimitPrecedence::BodyFirst`]
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stowage_retry::{BackoffConfig, delay_for_attempt};
//!
//! let config = BackoffConfig {
//!     base_delay: Duration::from_millis(500),
//!     max_delay: Duration::from_secs(30),
//!     jitter: 0.0,
//!     ..Default::default()
//! };
//! assert_eq!(delay_for_attempt(&config, 1), Duration::from_millis(500));
//! assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(1));
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shape of the computed backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// No delay between attempts.
    Immediate,
    /// Delay doubles each attempt.
    #[default]
    Exponential,
    /// Delay grows linearly.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Which rate-limit hint wins when a response carries more than one.
///
/// Most backends put the authoritative wait in the `Retry-After` header;
/// chat-style APIs put fractional seconds in the error body and the header
/// is a rounded echo. Drivers pick the order their provider documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPrecedence {
    /// `Retry-After` header → body `retry_after` → reset headers.
    #[default]
    HeaderFirst,
    /// Body `retry_after` → `retry-after` header → reset headers.
    BodyFirst,
}

/// Configuration for computed backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub kind: BackoffKind,
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// 0.0 = none, 0.5 = delay × (0.5..1.5).
    #[serde(default)]
    pub jitter: f64,
    /// Hint order used by [`rate_limit_delay`].
    #[serde(default)]
    pub rate_limit_precedence: RateLimitPrecedence,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
            rate_limit_precedence: RateLimitPrecedence::HeaderFirst,
        }
    }
}

impl BackoffConfig {
    /// The read-path default: 4 attempts, exponential, capped at 30 s.
    pub fn reads() -> Self {
        Self::default()
    }

    /// The write-path default: one re-send on top of the first attempt.
    ///
    /// The transport's write gate grants that re-send only to a rate-limit
    /// response proving the request was not executed; network errors and
    /// 5xx never re-send.
    pub fn writes() -> Self {
        Self {
            max_attempts: 2,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = cap;
        self
    }

    pub fn with_precedence(mut self, precedence: RateLimitPrecedence) -> Self {
        self.rate_limit_precedence = precedence;
        self
    }
}

/// Delay before retrying after `attempt` failures (1-indexed).
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let raw = match config.kind {
        BackoffKind::Immediate => Duration::ZERO,
        BackoffKind::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffKind::Linear => config.base_delay.saturating_mul(attempt),
        BackoffKind::Constant => config.base_delay,
    };
    let capped = raw.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 maps delay to delay × (0.5..1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter = jitter.clamp(0.0, 1.0);
    let mut rng = rand::thread_rng();
    let factor = 1.0 - jitter + rng.r#gen::<f64>() * 2.0 * jitter;
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Rate-limit hints harvested from one upstream response.
///
/// Each field holds the raw header/body value; [`rate_limit_delay`] applies
/// the precedence.
#[derive(Debug, Clone, Default)]
pub struct RateLimitHints {
    /// `Retry-After` header: delta-seconds or an HTTP-date.
    pub retry_after_header: Option<String>,
    /// Provider body `retry_after`, fractional seconds.
    pub body_retry_after: Option<f64>,
    /// `X-RateLimit-Reset` header: epoch seconds.
    pub ratelimit_reset: Option<String>,
    /// `x-ratelimit-reset-after` header: delta seconds, possibly fractional.
    pub ratelimit_reset_after: Option<String>,
}

impl RateLimitHints {
    /// Extract the body `retry_after` field from a JSON error payload.
    pub fn with_body(mut self, body: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            self.body_retry_after = value.get("retry_after").and_then(|v| v.as_f64());
        }
        self
    }
}

/// Resolve hints to a concrete wait, falling back to computed backoff.
///
/// The first two sources follow the config's [`RateLimitPrecedence`]; the
/// reset headers (`x-ratelimit-reset-after`, then `X-RateLimit-Reset`) come
/// after either order, and only then the computed curve.
pub fn rate_limit_delay(
    hints: &RateLimitHints,
    backoff: &BackoffConfig,
    attempt: u32,
    now: DateTime<Utc>,
) -> Duration {
    let header = || {
        hints
            .retry_after_header
            .as_deref()
            .and_then(|raw| parse_retry_after(raw, now))
    };
    let body = || {
        hints
            .body_retry_after
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(seconds_f64)
    };
    let reset_after = || {
        hints
            .ratelimit_reset_after
            .as_deref()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(seconds_f64)
    };
    let reset_epoch = || {
        hints
            .ratelimit_reset
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|epoch| epoch - now.timestamp())
            .filter(|delta| *delta > 0)
            .map(|delta| Duration::from_secs(delta as u64))
    };

    let provider = match backoff.rate_limit_precedence {
        RateLimitPrecedence::HeaderFirst => header().or_else(body),
        RateLimitPrecedence::BodyFirst => body().or_else(header),
    }
    .or_else(reset_after)
    .or_else(reset_epoch);

    match provider {
        Some(delay) => delay.min(MAX_PROVIDER_WAIT),
        None => delay_for_attempt(backoff, attempt),
    }
}

/// Upper bound on provider-dictated waits; anything longer is treated as a
/// misbehaving clock.
const MAX_PROVIDER_WAIT: Duration = Duration::from_secs(15 * 60);

/// `Retry-After`: delta-seconds, or an RFC 2822 HTTP-date.
fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(when) = DateTime::parse_from_rfc2822(raw) {
        let delta = when.with_timezone(&Utc).timestamp() - now.timestamp();
        if delta > 0 {
            return Some(Duration::from_secs(delta as u64));
        }
        return Some(Duration::ZERO);
    }
    None
}

fn seconds_f64(secs: f64) -> Duration {
    Duration::from_millis((secs * 1000.0).round() as u64).min(MAX_PROVIDER_WAIT)
}

/// Run a fallible operation with computed backoff between attempts.
///
/// The operation sees the 1-based attempt number. `should_retry` inspects the
/// error; returning `Some(delay)` overrides the computed backoff (used for
/// provider rate-limit hints), `None` with a retryable error falls back to
/// [`delay_for_attempt`].
pub fn run_with_backoff<T, E, F, R>(
    config: &BackoffConfig,
    mut operation: F,
    mut should_retry: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: FnMut(&E) -> Option<RetryDecision>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts {
                    return Err(err);
                }
                match should_retry(&err) {
                    None => return Err(err),
                    Some(RetryDecision::Backoff) => {
                        std::thread::sleep(delay_for_attempt(config, attempt));
                    }
                    Some(RetryDecision::After(delay)) => {
                        std::thread::sleep(delay.min(MAX_PROVIDER_WAIT));
                    }
                }
                attempt += 1;
            }
        }
    }
}

/// How to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Use the computed backoff curve.
    Backoff,
    /// The provider dictated a wait.
    After(Duration),
}

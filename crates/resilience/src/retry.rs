//! Strict retry loop with exponential backoff.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::schema::OutputSchema;

/// Hard cap on any single backoff delay.
const MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Validated retry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first. Always ≥ 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Multiplier applied per retry. Always ≥ 1.0.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config, validating the invariants.
    ///
    /// # Errors
    ///
    /// [`RetryError::InvalidConfig`] when `max_attempts` is zero or the
    /// multiplier is below 1.0.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, RetryError> {
        if max_attempts < 1 {
            return Err(RetryError::InvalidConfig("max_attempts must be >= 1".into()));
        }
        if backoff_multiplier < 1.0 {
            return Err(RetryError::InvalidConfig(
                "backoff_multiplier must be >= 1.0".into(),
            ));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        })
    }

    /// Delay after the `n`-th attempt (1-based):
    /// `min(initial_delay × multiplierⁿ⁻¹, 30 000 ms)`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).round();
        Duration::from_millis(millis as u64).min(MAX_DELAY)
    }
}

/// Retry parameters plus output validation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrictRetryPolicy {
    /// The retry loop parameters.
    pub retry: RetryConfig,
    /// Validate each successful result against this schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<OutputSchema>,
    /// When true (the default), a validation failure ends the loop
    /// immediately instead of retrying.
    pub fail_on_validation_error: bool,
}

impl StrictRetryPolicy {
    /// Policy with retries only, no validation.
    #[must_use]
    pub fn retries(retry: RetryConfig) -> Self {
        Self {
            retry,
            schema: None,
            fail_on_validation_error: true,
        }
    }

    /// Attach an output schema.
    #[must_use]
    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

// `fail_on_validation_error` defaults to true, so Default is written out by
// hand rather than derived.
impl Default for StrictRetryPolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            schema: None,
            fail_on_validation_error: true,
        }
    }
}

/// One attempt's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Which attempt this was (1-based).
    pub number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// How long the attempt took.
    pub duration_ms: u64,
    /// Error message when the attempt failed (or failed validation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Observer of the retry loop.
pub trait RetryListener: Send + Sync {
    /// A thunk invocation succeeded (and validated, when configured).
    fn on_success(&self, _attempt: &Attempt) {}
    /// A thunk invocation failed.
    fn on_failure(&self, _attempt: &Attempt) {}
    /// A successful result failed validation under fail-fast policy.
    fn on_validation_failure(&self, _attempt: &Attempt, _violations: &[String]) {}
    /// Every attempt failed.
    fn on_exhausted(&self, _attempts: &[Attempt]) {}
}

/// Listener that observes nothing.
pub struct NoopListener;

impl RetryListener for NoopListener {}

/// Successful outcome of the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T = Value> {
    /// The final value. Present even when validation failed, so callers can
    /// inspect the offending result.
    pub value: Option<T>,
    /// One record per attempt, in order.
    pub attempts: Vec<Attempt>,
    /// True when the loop ended on a fail-fast validation failure.
    pub validation_failed: bool,
}

/// Error raised by the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Every attempt failed (or the backoff sleep was cancelled).
    #[error("retries exhausted after {} attempt(s)", attempts.len())]
    Exhausted {
        /// One record per attempt made.
        attempts: Vec<Attempt>,
    },
    /// The configuration violates its invariants.
    #[error("invalid retry config: {0}")]
    InvalidConfig(String),
}

/// Run `thunk` under the policy.
///
/// The delay after attempt *n* is `min(initial × multiplierⁿ⁻¹, 30 s)`. A
/// cancellation during the backoff sleep raises [`RetryError::Exhausted`]
/// with the attempts made so far.
///
/// # Errors
///
/// [`RetryError::Exhausted`] when no attempt produced an acceptable result.
pub async fn execute_with_retry<T, F, Fut, E>(
    policy: &StrictRetryPolicy,
    listener: &dyn RetryListener,
    cancel: &CancellationToken,
    mut thunk: F,
) -> Result<RetryOutcome<T>, RetryError>
where
    T: serde::Serialize,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: Vec<Attempt> = Vec::new();

    for number in 1..=policy.retry.max_attempts {
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let outcome = thunk().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                let violations = policy.schema.as_ref().and_then(|schema| {
                    match serde_json::to_value(&value) {
                        Ok(json) => schema.validate(&json).err(),
                        Err(error) => Some(vec![format!("result not serializable: {error}")]),
                    }
                });
                match violations {
                    None => {
                        let attempt = Attempt {
                            number,
                            started_at,
                            duration_ms,
                            error: None,
                        };
                        listener.on_success(&attempt);
                        attempts.push(attempt);
                        if number > 1 {
                            debug!(attempt = number, "operation succeeded after retries");
                        }
                        return Ok(RetryOutcome {
                            value: Some(value),
                            attempts,
                            validation_failed: false,
                        });
                    }
                    Some(violations) => {
                        let attempt = Attempt {
                            number,
                            started_at,
                            duration_ms,
                            error: Some(format!("validation failed: {}", violations.join("; "))),
                        };
                        if policy.fail_on_validation_error {
                            listener.on_validation_failure(&attempt, &violations);
                            attempts.push(attempt);
                            return Ok(RetryOutcome {
                                value: Some(value),
                                attempts,
                                validation_failed: true,
                            });
                        }
                        // Soft validation failure: fall through to the retry
                        // path like any other error.
                        listener.on_failure(&attempt);
                        attempts.push(attempt);
                    }
                }
            }
            Err(error) => {
                let attempt = Attempt {
                    number,
                    started_at,
                    duration_ms,
                    error: Some(error.to_string()),
                };
                listener.on_failure(&attempt);
                attempts.push(attempt);
            }
        }

        if number < policy.retry.max_attempts {
            let delay = policy.retry.delay_after(number);
            warn!(
                attempt = number,
                max_attempts = policy.retry.max_attempts,
                ?delay,
                "attempt failed, backing off before retry"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    listener.on_exhausted(&attempts);
                    return Err(RetryError::Exhausted { attempts });
                }
            }
        }
    }

    listener.on_exhausted(&attempts);
    Err(RetryError::Exhausted { attempts })
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

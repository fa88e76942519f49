//! Retry utilities with exponential backoff and jitter.
//!
//! Two consumers share [`BackoffConfig`]: the API-call wrapper
//! [`retry_test_errors`], which re-issues Kubernetes calls that failed with a
//! transient error, and the TCP dialer in [`crate::dial`].
//!
//! # Example
//!
//! ```ignore
//! use ingress_conformance::retry::{retry_test_errors, BackoffConfig};
//!
//! let svc = retry_test_errors(&BackoffConfig::api(), "get service", |_attempt| async {
//!     services.get("my-svc").await.map_err(Into::into)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;

/// Exponential backoff parameters
///
/// Delays start at `initial_delay_ms` and grow by `factor` on every step. The
/// sequence ends after `steps - 1` delays or once growing would exceed
/// `cap_ms`, whichever comes first. Each delay gets up to `jitter * delay`
/// added on top.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay in milliseconds
    pub initial_delay_ms: u64,

    /// Multiplier applied after each step
    pub factor: f64,

    /// Maximum extra fraction of the delay added as jitter
    pub jitter: f64,

    /// Maximum number of attempts
    pub steps: u32,

    /// Delay past which the sequence stops, in milliseconds
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::api()
    }
}

impl BackoffConfig {
    /// Backoff used around Kubernetes API calls
    pub fn api() -> Self {
        Self {
            initial_delay_ms: 10,
            factor: 1.0,
            jitter: 0.1,
            steps: 5,
            cap_ms: 10_000,
        }
    }

    /// Backoff used when dialing a freshly provisioned load balancer
    pub fn dial() -> Self {
        Self {
            initial_delay_ms: 50,
            factor: 1.4,
            jitter: 0.1,
            steps: 100,
            cap_ms: 10_000,
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }

    /// Sequence of delays, one per retry (at most `steps - 1` of them)
    pub fn delays(&self) -> Backoff {
        Backoff {
            current: self.initial_delay(),
            factor: self.factor,
            jitter: self.jitter,
            cap: self.cap(),
            remaining: self.steps.saturating_sub(1),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.steps == 0 {
            return Err("backoff steps must be at least 1".to_string());
        }
        if self.factor < 1.0 {
            return Err(format!("backoff factor must be >= 1.0, got {}", self.factor));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("backoff jitter must be within [0, 1], got {}", self.jitter));
        }
        if self.cap_ms < self.initial_delay_ms {
            return Err(format!(
                "backoff cap ({}ms) is below the initial delay ({}ms)",
                self.cap_ms, self.initial_delay_ms
            ));
        }
        Ok(())
    }
}

/// Iterator over backoff delays produced by [`BackoffConfig::delays`]
#[derive(Clone, Debug)]
pub struct Backoff {
    current: Duration,
    factor: f64,
    jitter: f64,
    cap: Duration,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.factor);
        if next > self.cap {
            self.current = self.cap;
            self.remaining = 0;
        } else {
            self.current = next;
        }

        Some(with_jitter(base, self.jitter))
    }
}

fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let extra = rand::rng().random_range(0.0..=jitter);
    delay + Duration::from_secs_f64(delay.as_secs_f64() * extra)
}

/// Classify a kube error as worth retrying
///
/// Conflicts, throttling, unavailable/timeout responses, the etcd hiccups the
/// API server reports as internal errors, and refused connections.
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 | 429 | 503 | 504 => true,
            500 => {
                let message = resp.message.to_lowercase();
                message.contains("etcdserver: leader changed")
                    || message.contains("etcdserver: request timed out")
                    || message.contains("the object has been modified")
                    || message.contains("connection refused")
            }
            _ => false,
        },
        kube::Error::HyperError(e) => e.is_connect(),
        kube::Error::Service(e) => e.to_string().to_lowercase().contains("connection refused"),
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the backoff runs out of steps.
///
/// The closure receives the zero-based attempt number.
pub async fn retry_test_errors<T, F, Fut>(
    backoff: &BackoffConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = backoff.delays();
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match delays.next() {
                Some(delay) => {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Transient error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt + 1,
                        error = %e,
                        "Giving up after transient errors"
                    );
                    return Err(e);
                }
            },
            Err(e) => {
                debug!(operation = %operation_name, attempt = attempt, error = %e, "Non-retryable error");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{api_error, ConformanceError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 1,
            factor: 1.0,
            jitter: 0.0,
            steps: 5,
            cap_ms: 10,
        }
    }

    #[test]
    fn test_dial_backoff_grows_and_caps() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::dial()
        };
        let delays: Vec<_> = config.delays().collect();

        // 50ms * 1.4^16 passes the 10s cap, so growth stops well short of 99 steps.
        assert_eq!(delays.len(), 16);
        assert_eq!(delays[0], Duration::from_millis(50));
        assert!((69..=70).contains(&delays[1].as_millis()));
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert!(delays.iter().all(|d| *d < Duration::from_secs(10)));

        let total: Duration = delays.iter().sum();
        assert!(total > Duration::from_secs(25) && total < Duration::from_secs(30), "{total:?}");
    }

    #[test]
    fn test_sequence_ends_when_cap_is_passed() {
        let config = BackoffConfig {
            initial_delay_ms: 100,
            factor: 2.0,
            jitter: 0.0,
            steps: 50,
            cap_ms: 1000,
        };
        let delays: Vec<_> = config.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);

        let flat = BackoffConfig {
            initial_delay_ms: 100,
            factor: 1.0,
            jitter: 0.0,
            steps: 6,
            cap_ms: 100,
        };
        assert_eq!(flat.delays().count(), 5);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let config = BackoffConfig {
            initial_delay_ms: 100,
            factor: 1.0,
            jitter: 0.1,
            steps: 50,
            cap_ms: 100,
        };
        for delay in config.delays() {
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_validate() {
        assert!(BackoffConfig::api().validate().is_ok());
        assert!(BackoffConfig::dial().validate().is_ok());
        assert!(BackoffConfig::api().with_steps(0).validate().is_err());
        let bad = BackoffConfig {
            jitter: 2.0,
            ..BackoffConfig::dial()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_kube_error(&api_error(409, "Conflict", "conflict")));
        assert!(is_transient_kube_error(&api_error(429, "TooManyRequests", "slow down")));
        assert!(is_transient_kube_error(&api_error(
            500,
            "InternalError",
            "etcdserver: leader changed"
        )));
        assert!(!is_transient_kube_error(&api_error(500, "InternalError", "boom")));
        assert!(!is_transient_kube_error(&api_error(404, "NotFound", "missing")));
        assert!(!is_transient_kube_error(&api_error(422, "Invalid", "bad spec")));
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result = retry_test_errors(&quick(), "op", |_| async { Ok::<_, ConformanceError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_transient_errors_and_counts_attempts() {
        let calls = AtomicU32::new(0);
        let result = retry_test_errors(&quick(), "op", |attempt| {
            let calls = &calls;
            async move {
                assert_eq!(attempt, calls.fetch_add(1, Ordering::SeqCst));
                if attempt < 2 {
                    Err(ConformanceError::from(api_error(409, "Conflict", "try again")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_steps() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_test_errors(&quick(), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConformanceError::from(api_error(429, "TooManyRequests", "throttled"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_hard_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_test_errors(&quick(), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConformanceError::from(api_error(404, "NotFound", "missing"))) }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

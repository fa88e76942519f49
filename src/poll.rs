//! Poll-until-ready
//!
//! [`poll_until`] fetches a resource immediately and then once per interval
//! until a predicate accepts the observed state. A fetch that reports the
//! object as missing means "not converged yet"; any other fetch or predicate
//! error ends the wait at once. Running out of time yields
//! [`PollError::Timeout`] with the last state that was successfully fetched.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{ConformanceError, Result};

/// Why a poll ended without the predicate being satisfied
#[derive(Error, Debug)]
pub enum PollError<S> {
    /// Deadline elapsed; `last` is the most recent successfully fetched state
    #[error("timed out after {elapsed:?} ({attempts} attempts, {})", observed(.last))]
    Timeout {
        last: Option<S>,
        elapsed: Duration,
        attempts: u32,
    },

    /// Fetch failed with something other than not-found
    #[error("fetch failed: {0}")]
    Fetch(#[source] ConformanceError),

    /// The predicate itself failed
    #[error("state check failed: {0}")]
    Predicate(#[source] ConformanceError),
}

fn observed<S>(last: &Option<S>) -> &'static str {
    if last.is_some() {
        "state observed"
    } else {
        "no state observed"
    }
}

impl<S> PollError<S> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }

    /// Last observed state, only present on timeout
    pub fn last_state(&self) -> Option<&S> {
        match self {
            PollError::Timeout { last, .. } => last.as_ref(),
            _ => None,
        }
    }
}

impl<S: ResourceState> PollError<S> {
    /// Convert into a crate error, describing the last state on timeout
    pub fn into_wait_error(self, resource: impl Into<String>) -> ConformanceError {
        match self {
            PollError::Timeout { last, elapsed, .. } => ConformanceError::WaitTimeout {
                resource: resource.into(),
                last_state: last
                    .as_ref()
                    .map(ResourceState::state_description)
                    .unwrap_or_else(|| "no state observed".to_string()),
                elapsed,
            },
            PollError::Fetch(e) | PollError::Predicate(e) => e,
        }
    }
}

/// Human-readable summary of an observed object, used in timeout errors
pub trait ResourceState {
    fn state_description(&self) -> String;
}

/// Poll `fetch` every `interval` until `predicate` returns `Ok(true)`
///
/// The first fetch happens without delay. Returns the state that satisfied
/// the predicate.
pub async fn poll_until<S, F, Fut, P>(
    interval: Duration,
    timeout: Duration,
    mut fetch: F,
    mut predicate: P,
) -> std::result::Result<S, PollError<S>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S>>,
    P: FnMut(&S) -> Result<bool>,
{
    let start = Instant::now();
    let mut last = None;
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match fetch().await {
            Ok(state) => {
                if predicate(&state).map_err(PollError::Predicate)? {
                    debug!(attempts, elapsed_ms = start.elapsed().as_millis() as u64, "Condition met");
                    return Ok(state);
                }
                last = Some(state);
            }
            Err(e) if e.is_not_found() => {
                debug!(attempts, "Resource not found yet, polling");
            }
            Err(e) => return Err(PollError::Fetch(e)),
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PollError::Timeout {
                last,
                elapsed,
                attempts,
            });
        }

        sleep(interval.min(timeout - elapsed)).await;
    }
}

//! Waiting for a resource to reach a named state.
//!
//! Some services expose no operation handle for the work they do in the
//! background. Instead the resource itself reports a state such as
//! `Resizing` or `Steady`. A [`StateWaiter`] repeatedly refreshes the
//! resource until its state is one of the targets.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::context::OperationContext;
use crate::error::{ApiError, PollError};
use crate::lro::BackoffPolicy;

/// Refreshes a resource until it reaches a target state.
#[derive(Debug, Clone)]
pub struct StateWaiter {
    pending: Vec<String>,
    target: Vec<String>,
    delay: Duration,
    backoff: BackoffPolicy,
    continuous_target_occurrence: u32,
    not_found_checks: u32,
}

impl StateWaiter {
    /// Wait while the state is one of `pending`, until it is one of `target`.
    ///
    /// An empty target set means the resource disappearing ends the wait.
    pub fn new<P, T, S1, S2>(pending: P, target: T) -> Self
    where
        P: IntoIterator<Item = S1>,
        T: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            backoff: BackoffPolicy::default(),
            continuous_target_occurrence: 1,
            not_found_checks: 20,
        }
    }

    /// Wait before the first refresh.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Pace refreshes with `backoff`.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Require the target state on `n` consecutive refreshes.
    pub fn with_continuous_target_occurrence(mut self, n: u32) -> Self {
        self.continuous_target_occurrence = n.max(1);
        self
    }

    /// Tolerate the resource being missing `n` times in a row.
    pub fn with_not_found_checks(mut self, n: u32) -> Self {
        self.not_found_checks = n;
        self
    }

    /// Refresh until a target state is observed.
    ///
    /// `refresh` returns the current value and its state, or `None` if the
    /// resource does not exist. Returns the last value, or `None` when the
    /// target set is empty and the resource is gone.
    pub async fn wait<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        mut refresh: F,
    ) -> Result<Option<T>, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<(T, String)>, ApiError>>,
    {
        if !self.delay.is_zero() {
            ctx.sleep(self.delay).await?;
        }

        let mut intervals = self.backoff.intervals();
        let mut target_seen = 0u32;
        let mut not_found = 0u32;

        loop {
            match ctx.run(refresh()).await? {
                Ok(None) => {
                    if self.target.is_empty() {
                        return Ok(None);
                    }
                    target_seen = 0;
                    not_found += 1;
                    if not_found > self.not_found_checks {
                        return Err(PollError::NotFound);
                    }
                    debug!(not_found, "resource not found while waiting");
                }
                Ok(Some((value, state))) => {
                    not_found = 0;
                    if contains(&self.target, &state) {
                        target_seen += 1;
                        if target_seen >= self.continuous_target_occurrence {
                            return Ok(Some(value));
                        }
                    } else if contains(&self.pending, &state) {
                        target_seen = 0;
                        debug!(state = %state, "still pending");
                    } else {
                        return Err(PollError::UnexpectedState {
                            state,
                            expected: self.target.clone(),
                        });
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient refresh failure, retrying");
                }
                Err(err) => return Err(PollError::Api(err)),
            }

            ctx.sleep(intervals.next_delay()).await?;
        }
    }
}

fn contains(states: &[String], state: &str) -> bool {
    states.iter().any(|s| s.eq_ignore_ascii_case(state))
}

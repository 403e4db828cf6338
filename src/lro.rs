//! Long-running operation polling.
//!
//! Mutating ARM calls frequently answer `202 Accepted` with a handle that has
//! to be polled until it reaches a terminal status. [`Poller::wait`] drives
//! that loop: it backs off between polls, honours server `Retry-After` hints,
//! retries transient polling failures, and stops promptly when the caller's
//! [`OperationContext`] is cancelled or expires.
//!
//! Terminal outcomes are cached on the [`PendingOperation`], so waiting on an
//! operation that already finished returns the same result without touching
//! the network again.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::context::OperationContext;
use crate::error::{ApiError, PollError};
use crate::resource_id::ResourceId;

/// Exponential backoff between polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// First and smallest interval.
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    /// Largest interval.
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Growth factor applied after every poll.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy.
    pub fn new(min_interval: Duration, max_interval: Duration, multiplier: f64) -> Self {
        Self {
            min_interval,
            max_interval,
            multiplier,
        }
    }

    /// A fixed interval.
    pub fn constant(interval: Duration) -> Self {
        Self::new(interval, interval, 1.0)
    }

    /// Start a fresh sequence of intervals.
    pub fn intervals(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: None,
        }
    }

    fn grow(&self, current: Duration) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let max = self.max_interval.max(self.min_interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .unwrap_or(max)
            .clamp(self.min_interval, max)
    }
}

/// An endless sequence of growing intervals.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl Backoff {
    /// The next interval to wait.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.policy.min_interval,
            Some(current) => self.policy.grow(current),
        };
        self.current = Some(next);
        next
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// How the [`Poller`] paces itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerOptions {
    /// Wait before the first poll.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Intervals between polls.
    pub backoff: BackoffPolicy,
    /// Use a server supplied `Retry-After` instead of the backoff interval.
    pub honor_retry_after: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff: BackoffPolicy::default(),
            honor_retry_after: true,
        }
    }
}

impl PollerOptions {
    /// Millisecond intervals, for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff: BackoffPolicy::new(Duration::from_millis(2), Duration::from_millis(10), 2.0),
            honor_retry_after: true,
        }
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set whether `Retry-After` hints are honoured.
    pub fn with_honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }
}

/// Opaque reference to a server-side asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    /// Wrap a handle, typically an `Azure-AsyncOperation` or `Location` URL.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Create.
    Create,
    /// Update.
    Update,
    /// Delete. The target disappearing counts as success.
    Delete,
    /// Cancellation of another in-flight operation.
    Cancel,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// One observation of an operation's status.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    /// Still running.
    InProgress {
        /// Server supplied `Retry-After`.
        retry_after: Option<Duration>,
    },
    /// Finished successfully, possibly with a result payload.
    Succeeded(Option<Value>),
    /// Finished unsuccessfully.
    Failed(String),
    /// The operation or its target no longer exists.
    NotFound,
}

impl OperationStatus {
    /// Still running, without a server hint.
    pub fn in_progress() -> Self {
        Self::InProgress { retry_after: None }
    }

    /// Whether this status ends polling.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }
}

/// Outcome of an operation that completed successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResult {
    /// Result payload, if the server returned one.
    pub payload: Option<Value>,
    /// The target was already gone. Only possible for deletes.
    pub target_gone: bool,
}

/// Something that can report the status of an operation.
#[async_trait]
pub trait OperationSource: Send + Sync {
    /// Fetch the current status of `handle`.
    async fn poll_operation(
        &self,
        ctx: &OperationContext,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, ApiError>;
}

/// An asynchronous operation being tracked to completion.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    handle: OperationHandle,
    kind: OperationKind,
    target: ResourceId,
    outcome: Option<Result<TerminalResult, PollError>>,
}

impl PendingOperation {
    /// Start tracking an operation.
    pub fn new(handle: OperationHandle, kind: OperationKind, target: ResourceId) -> Self {
        Self {
            handle,
            kind,
            target,
            outcome: None,
        }
    }

    /// The server handle.
    pub fn handle(&self) -> &OperationHandle {
        &self.handle
    }

    /// The kind of mutation.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The resource being mutated.
    pub fn target(&self) -> &ResourceId {
        &self.target
    }

    /// Whether a terminal outcome has been observed.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// The cached terminal outcome.
    pub fn outcome(&self) -> Option<&Result<TerminalResult, PollError>> {
        self.outcome.as_ref()
    }

    fn settle(&mut self, outcome: Result<TerminalResult, PollError>) -> Result<TerminalResult, PollError> {
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Drives [`PendingOperation`]s to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct Poller {
    options: PollerOptions,
}

impl Poller {
    /// Create a poller.
    pub fn new(options: PollerOptions) -> Self {
        Self { options }
    }

    /// The poller's options.
    pub fn options(&self) -> &PollerOptions {
        &self.options
    }

    /// Wait until `op` finishes, the context is cancelled, or its deadline
    /// passes.
    ///
    /// Only definitive outcomes are cached: cancellation, timeouts, and
    /// non-transient polling errors leave the operation pollable again.
    #[instrument(skip_all, fields(kind = %op.kind, target = %op.target, handle = %op.handle))]
    pub async fn wait<S>(
        &self,
        source: &S,
        op: &mut PendingOperation,
        ctx: &OperationContext,
    ) -> Result<TerminalResult, PollError>
    where
        S: OperationSource + ?Sized,
    {
        if let Some(outcome) = &op.outcome {
            debug!("operation already terminal");
            return outcome.clone();
        }

        if !self.options.initial_delay.is_zero() {
            ctx.sleep(self.options.initial_delay).await?;
        }

        let mut backoff = self.options.backoff.intervals();
        let mut polls: u32 = 0;

        loop {
            polls += 1;
            let polled = ctx.run(source.poll_operation(ctx, &op.handle)).await?;

            let delay = match polled {
                Ok(OperationStatus::InProgress { retry_after }) => {
                    let interval = backoff.next_delay();
                    match retry_after {
                        Some(hint) if self.options.honor_retry_after => {
                            hint.max(self.options.backoff.min_interval)
                        }
                        _ => interval,
                    }
                }
                Ok(OperationStatus::Succeeded(payload)) => {
                    info!(polls, "operation succeeded");
                    return op.settle(Ok(TerminalResult {
                        payload,
                        target_gone: false,
                    }));
                }
                Ok(OperationStatus::Failed(reason)) => {
                    warn!(polls, reason = %reason, "operation failed");
                    return op.settle(Err(PollError::Failed { reason }));
                }
                Ok(OperationStatus::NotFound) => return op.settle(Self::target_missing(op.kind)),
                Err(err) if err.is_not_found() && op.kind == OperationKind::Delete => {
                    return op.settle(Self::target_missing(op.kind));
                }
                Err(err) if err.is_transient() => {
                    warn!(polls, error = %err, "transient polling failure, retrying");
                    backoff.next_delay()
                }
                Err(err) => return Err(PollError::Api(err)),
            };

            debug!(polls, delay_ms = delay.as_millis() as u64, "operation in progress");
            ctx.sleep(delay).await?;
        }
    }

    fn target_missing(kind: OperationKind) -> Result<TerminalResult, PollError> {
        if kind == OperationKind::Delete {
            info!("delete target is gone");
            Ok(TerminalResult {
                payload: None,
                target_gone: true,
            })
        } else {
            Err(PollError::NotFound)
        }
    }
}

//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::identity::ClientIdentity;
use super::store::WindowCounterStore;
use super::threshold::{Threshold, ThresholdProvider};
use super::window::{Clock, SystemClock, Window};
use crate::error::{Result, TurnstileError};

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Return the store error to the caller.
    #[default]
    Propagate,
    /// Deny the request.
    Closed,
    /// Allow the request without counting it.
    Open,
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request fits in the caller's quota.
    Allowed {
        limit: Threshold,
        remaining: u64,
        reset_after: Duration,
    },
    /// The caller has used up its quota for this window.
    Denied {
        limit: Threshold,
        retry_after: Duration,
    },
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }

    /// The threshold the decision was made against.
    pub fn limit(&self) -> Threshold {
        match self {
            Verdict::Allowed { limit, .. } | Verdict::Denied { limit, .. } => *limit,
        }
    }
}

/// Quota report for a caller, produced without consuming a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    /// Current threshold
    pub threshold: Threshold,
    /// Requests left in this window
    pub remaining: u64,
    /// Seconds until the window rolls over
    pub reset_after: u64,
}

/// Decides allow/deny by combining a threshold provider with a counter store.
///
/// Holds no mutable state of its own; all counting happens in the store.
pub struct RateLimiter {
    thresholds: Arc<dyn ThresholdProvider>,
    store: Arc<dyn WindowCounterStore>,
    window: Window,
    failure_mode: FailureMode,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter counting over `window`.
    pub fn new(
        thresholds: Arc<dyn ThresholdProvider>,
        store: Arc<dyn WindowCounterStore>,
        window: Window,
    ) -> Self {
        Self {
            thresholds,
            store,
            window,
            failure_mode: FailureMode::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the behaviour on store failure.
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Use a specific clock. Should be the same clock the store reads.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The counting window.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Count one request for `identity` and decide whether it may proceed.
    pub async fn check(&self, identity: &ClientIdentity) -> Result<Verdict> {
        let limit = self.thresholds.threshold(identity).await?;

        if limit.get() == 0 {
            let now = self.clock.now();
            let retry_after = self.window.bounds(now).remaining_from(now);
            trace!(identity = %identity, "Zero threshold, denying");
            return Ok(Verdict::Denied { limit, retry_after });
        }

        let counted = match self.store.increment_and_check(identity, self.window).await {
            Ok(counted) => counted,
            Err(error) => return self.on_store_failure(identity, limit, error),
        };

        let now = self.clock.now();
        let until_reset = (counted.reset_at - now).to_std().unwrap_or(Duration::ZERO);

        trace!(
            identity = %identity,
            count = counted.count,
            limit = limit.get(),
            "Checked rate limit"
        );

        if counted.count > limit.get() {
            debug!(
                identity = %identity,
                count = counted.count,
                limit = limit.get(),
                "Rate limit exceeded"
            );
            Ok(Verdict::Denied {
                limit,
                retry_after: until_reset,
            })
        } else {
            Ok(Verdict::Allowed {
                limit,
                remaining: limit.get() - counted.count,
                reset_after: until_reset,
            })
        }
    }

    /// Report the caller's quota without counting a request.
    pub async fn status(&self, identity: &ClientIdentity) -> Result<QuotaStatus> {
        let threshold = self.thresholds.threshold(identity).await?;
        let counted = self.store.current(identity, self.window).await?;
        let reset_after = (counted.reset_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        Ok(QuotaStatus {
            threshold,
            remaining: threshold.get().saturating_sub(counted.count),
            reset_after: reset_after.as_secs(),
        })
    }

    fn on_store_failure(
        &self,
        identity: &ClientIdentity,
        limit: Threshold,
        error: TurnstileError,
    ) -> Result<Verdict> {
        let now = self.clock.now();
        let until_reset = self.window.bounds(now).remaining_from(now);

        match self.failure_mode {
            FailureMode::Propagate => Err(error),
            FailureMode::Closed => {
                warn!(identity = %identity, error = %error, "Counter store failed, denying request");
                Ok(Verdict::Denied {
                    limit,
                    retry_after: until_reset,
                })
            }
            FailureMode::Open => {
                warn!(identity = %identity, error = %error, "Counter store failed, allowing request");
                Ok(Verdict::Allowed {
                    limit,
                    remaining: limit.get(),
                    reset_after: until_reset,
                })
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

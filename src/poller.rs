//! Busy-wait polling.
//!
//! Motion commands on the controller are fire-and-forget: `home` and
//! `move_relative` return as soon as the command is accepted, and completion
//! has to be discovered by polling a separate idle endpoint. [`wait_until`]
//! does that polling with a fixed interval and a bounded number of attempts.
//!
//! A failing or timed-out predicate call is not fatal here. A device that is
//! briefly unreachable while it moves just costs one attempt.

use crate::error::RemoteError;
use crate::gateway::Outcome;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Defines how long to keep polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay between two predicate invocations.
    pub interval: Duration,
    /// Maximum number of predicate invocations.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 60,
        }
    }
}

impl PollPolicy {
    /// Upper bound on the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Cooperative cancellation flag shared between a command handle and the
/// task doing the waiting.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a handled request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Poll `predicate` until it reports `true`.
///
/// Resolves `Ok(())` on the first `Ok(true)`. `Ok(false)`, `Failed` and
/// `TimedOut` each use up one attempt; after exactly `policy.max_attempts`
/// invocations without success the result is `TimedOut`. There is no sleep
/// after the last attempt.
///
/// `cancel` is checked before every invocation; once set the wait resolves
/// `Failed(RemoteError::Cancelled)` without calling the predicate again.
pub async fn wait_until<F, Fut>(
    mut predicate: F,
    policy: &PollPolicy,
    cancel: Option<&CancelToken>,
) -> Outcome<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<bool>>,
{
    for attempt in 1..=policy.max_attempts {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            debug!(attempt, "Wait cancelled");
            return Outcome::Failed(RemoteError::Cancelled);
        }

        match predicate().await {
            Outcome::Ok(true) => {
                trace!(attempt, "Wait condition met");
                return Outcome::Ok(());
            }
            Outcome::Ok(false) => trace!(attempt, "Not ready yet"),
            Outcome::Failed(err) => debug!(attempt, error = %err, "Poll failed, retrying"),
            Outcome::TimedOut => debug!(attempt, "Poll timed out, retrying"),
        }

        if attempt < policy.max_attempts {
            sleep(policy.interval).await;
        }
    }

    debug!(attempts = policy.max_attempts, "Wait gave up");
    Outcome::TimedOut
}

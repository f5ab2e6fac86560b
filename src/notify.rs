//! Notification deduplication for operator-visible problems.
//!
//! Health polls run every few seconds, so a device that stays offline would
//! otherwise report the same fault on every tick. The [`Deduplicator`] keeps
//! the set of currently active [`ProblemCode`]s and only emits a
//! [`Notification`] when membership actually changes.
//!
//! # Example
//!
//! ```rust
//! use nozzle_inspect::notify::{Deduplicator, ProblemCode};
//!
//! let problems = Deduplicator::new();
//! assert!(problems.raise(ProblemCode::CycleFaulted, "turntable stalled"));
//! assert!(!problems.raise(ProblemCode::CycleFaulted, "turntable stalled"));
//! assert!(problems.clear(&ProblemCode::CycleFaulted));
//! assert!(!problems.clear(&ProblemCode::CycleFaulted));
//! ```

use crate::device::DeviceId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

/// Stable identifier of a user-visible condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProblemCode {
    /// Health poll lost contact with a device.
    DeviceOffline(DeviceId),
    /// A motion did not finish within the idle-wait budget.
    MotionTimeout(DeviceId),
    /// The last measurement cycle ended in a fault.
    CycleFaulted,
}

impl fmt::Display for ProblemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProblemCode::DeviceOffline(device) => write!(f, "{device}.offline"),
            ProblemCode::MotionTimeout(device) => write!(f, "{device}.motion_timeout"),
            ProblemCode::CycleFaulted => f.write_str("cycle.faulted"),
        }
    }
}

/// An entry in the active problem set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveProblem {
    /// Problem identifier.
    pub code: ProblemCode,
    /// Operator-facing message supplied when the problem was raised.
    pub message: String,
    /// When the problem was raised.
    pub since: DateTime<Utc>,
}

/// Whether a notification announces or resolves a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// The code entered the active set.
    Raised,
    /// The code left the active set.
    Resolved,
}

/// Emitted once per membership change of the active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Problem identifier.
    pub code: ProblemCode,
    /// Raised or resolved.
    pub kind: NotificationKind,
    /// Operator-facing message.
    pub message: String,
    /// Emission time.
    pub at: DateTime<Utc>,
}

/// Process-wide set of active problem codes.
///
/// Every mutation takes the same lock, and the published view is replaced
/// while that lock is held, so concurrent `raise`/`clear` on one code always
/// leave the set and the view agreeing on whichever call ran last.
pub struct Deduplicator {
    active: Mutex<BTreeMap<ProblemCode, ActiveProblem>>,
    view: watch::Sender<Vec<ActiveProblem>>,
    events: broadcast::Sender<Notification>,
}

impl fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deduplicator")
            .field("active", &self.active.lock().len())
            .finish()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Deduplicator {
    /// Create an empty deduplicator.
    pub fn new() -> Self {
        let (view, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            active: Mutex::new(BTreeMap::new()),
            view,
            events,
        }
    }

    /// Add `code` to the active set.
    ///
    /// Returns `true` if the code was newly raised and a notification was
    /// emitted; `false` if it was already active.
    pub fn raise(&self, code: ProblemCode, message: impl Into<String>) -> bool {
        let mut active = self.active.lock();
        if active.contains_key(&code) {
            return false;
        }

        let problem = ActiveProblem {
            code: code.clone(),
            message: message.into(),
            since: Utc::now(),
        };
        warn!(code = %code, message = %problem.message, "Problem raised");

        let notification = Notification {
            code: code.clone(),
            kind: NotificationKind::Raised,
            message: problem.message.clone(),
            at: problem.since,
        };
        active.insert(code, problem);
        self.publish(&active, notification);
        true
    }

    /// Remove `code` from the active set.
    ///
    /// Returns `true` if the code was active and a "resolved" notification
    /// was emitted.
    pub fn clear(&self, code: &ProblemCode) -> bool {
        let mut active = self.active.lock();
        let Some(problem) = active.remove(code) else {
            return false;
        };
        info!(code = %code, "Problem resolved");

        let notification = Notification {
            code: problem.code,
            kind: NotificationKind::Resolved,
            message: problem.message,
            at: Utc::now(),
        };
        self.publish(&active, notification);
        true
    }

    /// Whether `code` is currently active.
    pub fn is_active(&self, code: &ProblemCode) -> bool {
        self.active.lock().contains_key(code)
    }

    /// Snapshot of the active set, ordered by code.
    pub fn active(&self) -> Vec<ActiveProblem> {
        self.view.borrow().clone()
    }

    /// Live view of the active set.
    pub fn watch_active(&self) -> watch::Receiver<Vec<ActiveProblem>> {
        self.view.subscribe()
    }

    /// Stream of raise/resolve notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    fn publish(&self, active: &BTreeMap<ProblemCode, ActiveProblem>, notification: Notification) {
        self.view.send_replace(active.values().cloned().collect());
        // No subscribers is fine; the active view still carries the state.
        let _ = self.events.send(notification);
    }
}

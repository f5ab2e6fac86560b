//! Custom error types for the inspection core.
//!
//! Two layers of error live here:
//!
//! - **`RemoteError`**: the failure reason carried by a gateway
//!   [`Outcome`](crate::gateway::Outcome). It is `Clone + PartialEq` so outcomes
//!   can be compared in tests and cached in snapshots. Its variants follow the
//!   operator-facing taxonomy: the remote side was unreachable, it explicitly
//!   rejected the command, a precondition was not met, or the operator
//!   cancelled.
//! - **`InspectError`**: the crate-wide error returned by fallible API calls
//!   (configuration loading, handle commands, registry operations). Using
//!   `#[from]`, remote and configuration errors convert with `?`.
//!
//! Remote errors never reach the presentation layer raw. Health-poll failures
//! feed the supervisor state machine and surface only as a deduplicated
//! [`ProblemCode`](crate::notify::ProblemCode).

use crate::config::ConfigError;
use crate::device::DeviceId;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, InspectError>;

/// Reason a remote operation did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure or no answer within the call timeout.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The controller answered but refused the command.
    #[error("remote rejected command: {0}")]
    Rejected(String),

    /// A precondition on the device side is not met (e.g. axis not homed).
    #[error("device not ready: {0}")]
    NotReady(String),

    /// The operation was abandoned because the operator requested a stop.
    #[error("operation cancelled")]
    Cancelled,
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Device '{0}' already has a live supervisor")]
    AlreadySupervised(DeviceId),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} task is no longer running")]
    ActorStopped(&'static str),
}

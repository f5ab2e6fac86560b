//! Remote Operation Gateway.
//!
//! Every interaction with the external controller service goes through a
//! [`Gateway`]. It wraps one request/response call in a timeout and reduces
//! the result to an [`Outcome`]: the call succeeded, the remote side reported
//! a failure, or no answer arrived in time. Callers never see a transport
//! error type and never wait indefinitely.
//!
//! # Design
//!
//! The controller itself is abstracted by the [`RemoteService`] trait. The
//! gateway owns an `Arc<dyn RemoteService>` and is cheap to clone, so each
//! supervisor and the orchestrator hold their own copy, each with the call
//! timeout that fits its workload.
//!
//! # Example
//!
//! ```no_run
//! use nozzle_inspect::device::DeviceId;
//! use nozzle_inspect::gateway::{mock::MockService, Gateway, Outcome};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let gateway = Gateway::new(Arc::new(MockService::new()), Duration::from_secs(2));
//! match gateway.status(&DeviceId::new("turntable")).await {
//!     Outcome::Ok(status) => println!("connected: {}", status.connected),
//!     Outcome::Failed(reason) => println!("failed: {reason}"),
//!     Outcome::TimedOut => println!("no answer"),
//! }
//! # }
//! ```

pub mod mock;

use crate::device::DeviceId;
use crate::error::RemoteError;
use crate::measurement::MeasurementRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Terminal result of a gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The call completed and produced a value.
    Ok(T),
    /// The remote side answered with a failure.
    Failed(RemoteError),
    /// No answer arrived within the call timeout.
    TimedOut,
}

impl<T> Outcome<T> {
    /// Wrap a remote result.
    pub fn from_result(result: Result<T, RemoteError>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => Outcome::Failed(err),
        }
    }

    /// True for `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    /// True for `TimedOut`.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    /// The success value, discarding failure detail.
    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    /// Transform the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(value) => Outcome::Ok(f(value)),
            Outcome::Failed(err) => Outcome::Failed(err),
            Outcome::TimedOut => Outcome::TimedOut,
        }
    }

    /// Convert to a `Result`, mapping a timeout to `Unreachable`.
    pub fn into_result(self) -> Result<T, RemoteError> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::TimedOut => Err(RemoteError::Unreachable("call timed out".to_string())),
        }
    }
}

/// Reply to a health poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the controller currently reaches the device.
    pub connected: bool,
    /// Free-form detail from the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Acknowledgement for commands that report success explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    /// Whether the controller accepted and executed the command.
    pub ok: bool,
    /// Optional explanation, usually present when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandAck {
    /// Positive acknowledgement.
    pub fn accepted() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    /// Negative acknowledgement with a reason.
    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }

    /// Turn `ok: false` into `RemoteError::Rejected`.
    pub fn into_result(self) -> Result<(), RemoteError> {
        if self.ok {
            Ok(())
        } else {
            Err(RemoteError::Rejected(
                self.message
                    .unwrap_or_else(|| "command rejected".to_string()),
            ))
        }
    }
}

/// Operations offered by the remote device/controller service.
///
/// Implementations may be slow or momentarily unreachable; the [`Gateway`]
/// bounds every call with a timeout.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Whether the device is currently reachable.
    async fn status(&self, device: &DeviceId) -> Result<DeviceStatus, RemoteError>;

    /// Ask the controller to (re)open its link to the device.
    async fn connect(&self, device: &DeviceId) -> Result<CommandAck, RemoteError>;

    /// Ask the controller to close its link to the device.
    async fn disconnect(&self, device: &DeviceId) -> Result<CommandAck, RemoteError>;

    /// Whether the device has finished its last motion.
    async fn is_idle(&self, device: &DeviceId) -> Result<bool, RemoteError>;

    /// Start a relative move. Returns once the command is accepted, not when
    /// motion ends.
    async fn move_relative(&self, device: &DeviceId, amount: f64) -> Result<(), RemoteError>;

    /// Start a homing sequence. Returns once the command is accepted.
    async fn home(&self, device: &DeviceId) -> Result<(), RemoteError>;

    /// Run one analysis stage on the current image.
    async fn run_analysis_step(&self, kind: &str) -> Result<CommandAck, RemoteError>;

    /// Aggregate the analysis results for the current position.
    async fn aggregate_results(&self, mode: Option<&str>) -> Result<Vec<u32>, RemoteError>;

    /// Persist a completed measurement.
    async fn record_measurement(&self, record: &MeasurementRecord) -> Result<(), RemoteError>;

    /// Switch an illumination relay.
    async fn set_lamp(&self, device: &DeviceId, on: bool) -> Result<(), RemoteError>;
}

/// Timeout-bounded access to a [`RemoteService`].
#[derive(Clone)]
pub struct Gateway {
    service: Arc<dyn RemoteService>,
    timeout: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("service", &"Arc<dyn RemoteService>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Gateway {
    /// Create a gateway whose typed calls use `timeout`.
    pub fn new(service: Arc<dyn RemoteService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// Same service, different default timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            service: Arc::clone(&self.service),
            timeout,
        }
    }

    /// Default timeout applied by the typed calls.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one remote call under `timeout` and classify the result.
    pub async fn call<T, F>(&self, operation: &str, timeout: Duration, call: F) -> Outcome<T>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Outcome::Ok(value),
            Ok(Err(err)) => {
                debug!(operation, error = %err, "Remote call failed");
                Outcome::Failed(err)
            }
            Err(_) => {
                warn!(operation, ?timeout, "Remote call timed out");
                Outcome::TimedOut
            }
        }
    }

    /// Health poll.
    pub async fn status(&self, device: &DeviceId) -> Outcome<DeviceStatus> {
        self.call("status", self.timeout, self.service.status(device))
            .await
    }

    /// Explicit (re)connect; a refused ack becomes `Failed(Rejected)`.
    pub async fn connect(&self, device: &DeviceId) -> Outcome<()> {
        self.call("connect", self.timeout, async {
            self.service.connect(device).await?.into_result()
        })
        .await
    }

    /// Explicit disconnect; a refused ack becomes `Failed(Rejected)`.
    pub async fn disconnect(&self, device: &DeviceId) -> Outcome<()> {
        self.call("disconnect", self.timeout, async {
            self.service.disconnect(device).await?.into_result()
        })
        .await
    }

    /// Idle query used by the busy-wait poller.
    pub async fn is_idle(&self, device: &DeviceId) -> Outcome<bool> {
        self.call("is_idle", self.timeout, self.service.is_idle(device))
            .await
    }

    /// Fire a relative move.
    pub async fn move_relative(&self, device: &DeviceId, amount: f64) -> Outcome<()> {
        self.call(
            "move_relative",
            self.timeout,
            self.service.move_relative(device, amount),
        )
        .await
    }

    /// Fire a homing sequence.
    pub async fn home(&self, device: &DeviceId) -> Outcome<()> {
        self.call("home", self.timeout, self.service.home(device))
            .await
    }

    /// Run one analysis stage; a refused ack becomes `Failed(Rejected)`.
    pub async fn run_analysis_step(&self, kind: &str) -> Outcome<()> {
        self.call("run_analysis_step", self.timeout, async {
            self.service.run_analysis_step(kind).await?.into_result()
        })
        .await
    }

    /// Fetch aggregated counts per class.
    pub async fn aggregate_results(&self, mode: Option<&str>) -> Outcome<Vec<u32>> {
        self.call(
            "aggregate_results",
            self.timeout,
            self.service.aggregate_results(mode),
        )
        .await
    }

    /// Persist a measurement record.
    pub async fn record_measurement(&self, record: &MeasurementRecord) -> Outcome<()> {
        self.call(
            "record_measurement",
            self.timeout,
            self.service.record_measurement(record),
        )
        .await
    }

    /// Switch an illumination relay.
    pub async fn set_lamp(&self, device: &DeviceId, on: bool) -> Outcome<()> {
        self.call("set_lamp", self.timeout, self.service.set_lamp(device, on))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::{MockService, Reply};

    fn gateway(service: Arc<MockService>) -> Gateway {
        Gateway::new(service, Duration::from_millis(200))
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_classifies_success_failure_and_timeout() {
        let gw = gateway(Arc::new(MockService::new()));

        let ok = gw.call("ok", Duration::from_millis(50), async { Ok(7) }).await;
        assert_eq!(ok, Outcome::Ok(7));

        let failed: Outcome<()> = gw
            .call("failed", Duration::from_millis(50), async {
                Err(RemoteError::Rejected("no".into()))
            })
            .await;
        assert_eq!(failed, Outcome::Failed(RemoteError::Rejected("no".into())));

        let timed_out: Outcome<()> = gw
            .call("hang", Duration::from_millis(50), std::future::pending())
            .await;
        assert_eq!(timed_out, Outcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_becomes_rejected() {
        let service = Arc::new(MockService::new());
        let device = DeviceId::new("printer");
        service.script_connect(&device, [Reply::Reject("port busy".into())]);

        let outcome = gateway(Arc::clone(&service)).connect(&device).await;
        assert_eq!(
            outcome,
            Outcome::Failed(RemoteError::Rejected("port busy".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_status_times_out() {
        let service = Arc::new(MockService::new());
        let device = DeviceId::new("scanner");
        service.script_status(&device, [Reply::Hang]);

        let outcome = gateway(service).status(&device).await;
        assert!(outcome.is_timed_out());
    }

    #[test]
    fn test_outcome_into_result_maps_timeout_to_unreachable() {
        let outcome: Outcome<()> = Outcome::TimedOut;
        assert!(matches!(
            outcome.into_result(),
            Err(RemoteError::Unreachable(_))
        ));
        assert_eq!(Outcome::Ok(2).map(|v| v * 2).ok(), Some(4));
    }
}

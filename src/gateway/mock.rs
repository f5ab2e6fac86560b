//! Mock Remote Service
//!
//! In-process stand-in for the controller service, used by the test suite
//! and the `simulate` CLI command. All waiting uses `tokio::time`, so tests
//! can run with a paused clock.
//!
//! # Behaviour
//!
//! - Devices are created on first use, online.
//! - A motion command (`home`, `move_relative`) makes the device report busy
//!   for [`MockService::with_motion_polls`] idle queries, then idle. Relative
//!   moves are refused with `NotReady` until the device has been homed.
//! - Scripted replies (`script_status`, `script_connect`) are consumed one per
//!   call before falling back to the default behaviour.
//! - Faults can be injected per pipeline step with [`MockService::inject`];
//!   the step index is the number of motion commands issued so far minus one.
//! - Every call is appended to a log, and the maximum number of overlapping
//!   pipeline calls (everything except status/connect/disconnect/record) is
//!   tracked so tests can check sequencing.
//!
//! # Example
//!
//! ```rust,ignore
//! let service = MockService::new().with_motion_polls(3);
//! service.set_online(&DeviceId::new("printer"), false);
//! service.inject(2, StepFault::Analysis(Reply::Reject("blurred".into())));
//! ```

use super::{CommandAck, DeviceStatus, RemoteService};
use crate::device::DeviceId;
use crate::error::RemoteError;
use crate::measurement::MeasurementRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A scripted reply for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Behave normally.
    Ok,
    /// Answer with a negative reply (`connected: false`, `ok: false`, or
    /// `Rejected` for calls without an ack body).
    Reject(String),
    /// Fail with `Unreachable`.
    Unreachable,
    /// Never answer; the gateway timeout decides.
    Hang,
}

/// Fault injected into one pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepFault {
    /// Every analysis call of the step gets this reply.
    Analysis(Reply),
    /// The aggregate call of the step gets this reply.
    Aggregate(Reply),
    /// The motion of the step never finishes.
    NeverIdle,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// `status(device)`
    Status(DeviceId),
    /// `connect(device)`
    Connect(DeviceId),
    /// `disconnect(device)`
    Disconnect(DeviceId),
    /// `is_idle(device)`
    IsIdle(DeviceId),
    /// `move_relative(device, amount)`
    MoveRelative(DeviceId, f64),
    /// `home(device)`
    Home(DeviceId),
    /// `run_analysis_step(kind)`
    Analysis(String),
    /// `aggregate_results(mode)`
    Aggregate(Option<String>),
    /// `record_measurement(record)`
    Record,
    /// `set_lamp(device, on)`
    SetLamp(DeviceId, bool),
}

#[derive(Debug)]
struct SimDevice {
    online: bool,
    status_script: VecDeque<Reply>,
    connect_script: VecDeque<Reply>,
    busy_polls_remaining: u32,
    stuck: bool,
    homed: bool,
    lamp_on: bool,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self {
            online: true,
            status_script: VecDeque::new(),
            connect_script: VecDeque::new(),
            busy_polls_remaining: 0,
            stuck: false,
            homed: false,
            lamp_on: false,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    devices: HashMap<DeviceId, SimDevice>,
    faults: HashMap<usize, Vec<StepFault>>,
    motions: usize,
    calls: Vec<RemoteCall>,
    records: Vec<MeasurementRecord>,
}

impl SimState {
    fn device(&mut self, id: &DeviceId) -> &mut SimDevice {
        self.devices.entry(id.clone()).or_default()
    }

    fn current_step(&self) -> Option<usize> {
        self.motions.checked_sub(1)
    }

    fn step_fault(&self, pick: impl Fn(&StepFault) -> Option<Reply>) -> Option<Reply> {
        let step = self.current_step()?;
        self.faults.get(&step)?.iter().find_map(pick)
    }
}

/// Scriptable in-memory controller.
#[derive(Debug)]
pub struct MockService {
    state: Mutex<SimState>,
    motion_polls: u32,
    class_count: usize,
    random_counts: bool,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockService {
    /// Online devices, two busy polls per motion, four classes, no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            motion_polls: 2,
            class_count: 4,
            random_counts: false,
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of `is_idle == false` replies after each motion command.
    pub fn with_motion_polls(mut self, polls: u32) -> Self {
        self.motion_polls = polls;
        self
    }

    /// Width of the aggregated count vector.
    pub fn with_class_count(mut self, classes: usize) -> Self {
        self.class_count = classes;
        self
    }

    /// Random counts instead of the deterministic `step + 1` pattern.
    pub fn with_random_counts(mut self) -> Self {
        self.random_counts = true;
        self
    }

    /// Delay applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Take a device on or off line.
    pub fn set_online(&self, device: &DeviceId, online: bool) {
        self.state.lock().device(device).online = online;
    }

    /// Queue replies for upcoming `status` calls on `device`.
    pub fn script_status(&self, device: &DeviceId, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .lock()
            .device(device)
            .status_script
            .extend(replies);
    }

    /// Queue replies for upcoming `connect` calls on `device`.
    pub fn script_connect(&self, device: &DeviceId, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .lock()
            .device(device)
            .connect_script
            .extend(replies);
    }

    /// Inject a fault into pipeline step `step`.
    pub fn inject(&self, step: usize, fault: StepFault) {
        self.state.lock().faults.entry(step).or_default().push(fault);
    }

    /// All calls received so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&RemoteCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Records persisted through `record_measurement`.
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.state.lock().records.clone()
    }

    /// Current relay state of a lamp device.
    pub fn lamp_on(&self, device: &DeviceId) -> bool {
        self.state.lock().device(device).lamp_on
    }

    /// Highest number of pipeline calls that were ever in flight together.
    pub fn max_pipeline_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn log(&self, call: RemoteCall) {
        self.state.lock().calls.push(call);
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }

    fn enter_pipeline(&self) -> PipelineGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        PipelineGuard(&self.in_flight)
    }

    fn counts_for_current_step(&self) -> Vec<u32> {
        if self.random_counts {
            let mut rng = rand::thread_rng();
            return (0..self.class_count).map(|_| rng.gen_range(0..6)).collect();
        }
        let step = self.state.lock().current_step().unwrap_or(0);
        vec![step as u32 + 1; self.class_count]
    }

    fn offline_error(device: &DeviceId) -> RemoteError {
        RemoteError::Unreachable(format!("{device} not responding"))
    }

    /// Apply a scripted reply that is not `Ok`. Returns `None` for `Ok`.
    async fn apply<T>(
        reply: &Reply,
        reject: impl FnOnce(String) -> Result<T, RemoteError>,
    ) -> Option<Result<T, RemoteError>> {
        match reply {
            Reply::Ok => None,
            Reply::Reject(message) => Some(reject(message.clone())),
            Reply::Unreachable => Some(Err(RemoteError::Unreachable("scripted".to_string()))),
            Reply::Hang => {
                std::future::pending::<()>().await;
                None
            }
        }
    }
}

struct PipelineGuard<'a>(&'a AtomicUsize);

impl Drop for PipelineGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteService for MockService {
    async fn status(&self, device: &DeviceId) -> Result<DeviceStatus, RemoteError> {
        self.log(RemoteCall::Status(device.clone()));
        self.delay().await;
        let (scripted, online) = {
            let mut state = self.state.lock();
            let dev = state.device(device);
            (dev.status_script.pop_front(), dev.online)
        };
        if let Some(reply) = scripted {
            let rejected = |detail: String| -> Result<DeviceStatus, RemoteError> {
                Ok(DeviceStatus {
                    connected: false,
                    detail: Some(detail),
                })
            };
            if let Some(result) = Self::apply(&reply, rejected).await {
                return result;
            }
            return Ok(DeviceStatus {
                connected: true,
                detail: None,
            });
        }
        if online {
            Ok(DeviceStatus {
                connected: true,
                detail: None,
            })
        } else {
            Err(Self::offline_error(device))
        }
    }

    async fn connect(&self, device: &DeviceId) -> Result<CommandAck, RemoteError> {
        self.log(RemoteCall::Connect(device.clone()));
        self.delay().await;
        let (scripted, online) = {
            let mut state = self.state.lock();
            let dev = state.device(device);
            (dev.connect_script.pop_front(), dev.online)
        };
        if let Some(reply) = scripted {
            if let Some(result) = Self::apply(&reply, |m| Ok(CommandAck::refused(m))).await {
                return result;
            }
            self.state.lock().device(device).online = true;
            return Ok(CommandAck::accepted());
        }
        if online {
            Ok(CommandAck::accepted())
        } else {
            Err(Self::offline_error(device))
        }
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<CommandAck, RemoteError> {
        self.log(RemoteCall::Disconnect(device.clone()));
        self.delay().await;
        Ok(CommandAck::accepted())
    }

    async fn is_idle(&self, device: &DeviceId) -> Result<bool, RemoteError> {
        self.log(RemoteCall::IsIdle(device.clone()));
        let _guard = self.enter_pipeline();
        self.delay().await;
        let mut state = self.state.lock();
        let dev = state.device(device);
        if !dev.online {
            return Err(Self::offline_error(device));
        }
        if dev.stuck {
            return Ok(false);
        }
        if dev.busy_polls_remaining > 0 {
            dev.busy_polls_remaining -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn move_relative(&self, device: &DeviceId, amount: f64) -> Result<(), RemoteError> {
        self.log(RemoteCall::MoveRelative(device.clone(), amount));
        let _guard = self.enter_pipeline();
        self.delay().await;
        self.start_motion(device, false)
    }

    async fn home(&self, device: &DeviceId) -> Result<(), RemoteError> {
        self.log(RemoteCall::Home(device.clone()));
        let _guard = self.enter_pipeline();
        self.delay().await;
        self.start_motion(device, true)
    }

    async fn run_analysis_step(&self, kind: &str) -> Result<CommandAck, RemoteError> {
        self.log(RemoteCall::Analysis(kind.to_string()));
        let _guard = self.enter_pipeline();
        self.delay().await;
        let fault = self.state.lock().step_fault(|f| match f {
            StepFault::Analysis(reply) => Some(reply.clone()),
            _ => None,
        });
        if let Some(reply) = fault {
            if let Some(result) = Self::apply(&reply, |m| Ok(CommandAck::refused(m))).await {
                return result;
            }
        }
        Ok(CommandAck::accepted())
    }

    async fn aggregate_results(&self, mode: Option<&str>) -> Result<Vec<u32>, RemoteError> {
        self.log(RemoteCall::Aggregate(mode.map(str::to_string)));
        let _guard = self.enter_pipeline();
        self.delay().await;
        let fault = self.state.lock().step_fault(|f| match f {
            StepFault::Aggregate(reply) => Some(reply.clone()),
            _ => None,
        });
        if let Some(reply) = fault {
            if let Some(result) = Self::apply(&reply, |m| Err(RemoteError::Rejected(m))).await {
                return result;
            }
        }
        Ok(self.counts_for_current_step())
    }

    async fn record_measurement(&self, record: &MeasurementRecord) -> Result<(), RemoteError> {
        self.log(RemoteCall::Record);
        self.delay().await;
        self.state.lock().records.push(record.clone());
        Ok(())
    }

    async fn set_lamp(&self, device: &DeviceId, on: bool) -> Result<(), RemoteError> {
        self.log(RemoteCall::SetLamp(device.clone(), on));
        let _guard = self.enter_pipeline();
        self.delay().await;
        let mut state = self.state.lock();
        let dev = state.device(device);
        if !dev.online {
            return Err(Self::offline_error(device));
        }
        dev.lamp_on = on;
        Ok(())
    }
}

impl MockService {
    fn start_motion(&self, device: &DeviceId, homing: bool) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.motions += 1;
        let never_idle = state
            .step_fault(|f| matches!(f, StepFault::NeverIdle).then_some(Reply::Ok))
            .is_some();
        let polls = self.motion_polls;
        let dev = state.device(device);
        if !dev.online {
            return Err(Self::offline_error(device));
        }
        if !homing && !dev.homed {
            return Err(RemoteError::NotReady(format!("{device} not homed")));
        }
        dev.homed = true;
        dev.busy_polls_remaining = polls;
        dev.stuck = never_idle;
        Ok(())
    }
}

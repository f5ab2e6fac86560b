//! Measurement cycle orchestration.
//!
//! The [`MeasurementOrchestrator`] is an actor task that owns the
//! [`CycleSnapshot`] and runs measurement cycles one at a time. Commands
//! arrive through a [`CycleHandle`]; the published snapshot is the only view
//! other components get of the cycle.
//!
//! # Pipeline
//!
//! A cycle is a fixed list of [`PipelineStep`]s built before the run starts:
//! step 0 homes the motion device, every later step rotates it by the current
//! movement amount. Each step is driven the same way:
//!
//! ```text
//! motion ─▶ wait_until(idle) ─▶ analysis × k ─▶ aggregate ─▶ append sample
//! ```
//!
//! Calls are strictly sequential; the next step starts only after the
//! previous one appended its sample.
//!
//! # Failure policy
//!
//! - A failed or timed-out motion, analysis or aggregate call is logged and
//!   the step carries on; its sample is marked `degraded`. When aggregation
//!   fails the sample is zero-filled.
//! - An idle-wait that runs out of attempts is fatal: the run ends `Faulted`
//!   and `CycleFaulted` plus `MotionTimeout` are raised.
//! - `stop()` is cooperative. The in-flight call is allowed to finish, its
//!   result is dropped, and the lamp is switched back off once.

use crate::config::CycleConfig;
use crate::device::{DeviceId, DeviceSnapshot};
use crate::error::{AppResult, InspectError, RemoteError};
use crate::gateway::{Gateway, Outcome};
use crate::measurement::{MeasurementRecord, ResultSample};
use crate::notify::{Deduplicator, ProblemCode};
use crate::poller::{wait_until, CancelToken, PollPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 32;

/// Lifecycle phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CyclePhase {
    /// No run in progress.
    #[default]
    Idle,
    /// A run is executing.
    Running,
    /// The last run ended on a fatal error.
    Faulted,
}

/// Published state of the measurement cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    /// Lifecycle phase.
    pub phase: CyclePhase,
    /// True while a run is executing.
    pub active: bool,
    /// Number of completed steps in the current run.
    pub current_index: usize,
    /// Steps per run.
    pub total: usize,
    /// Samples of the current (or last completed) run.
    pub results: Vec<ResultSample>,
    /// Rotation amount used by rotate steps.
    pub movement_amount: f64,
    /// Reason of the last fault, if the phase is `Faulted`.
    pub last_error: Option<String>,
    /// Id of the current or last completed run.
    pub run_id: Option<Uuid>,
}

impl CycleSnapshot {
    fn idle(total: usize, movement_amount: f64) -> Self {
        Self {
            phase: CyclePhase::Idle,
            active: false,
            current_index: 0,
            total,
            results: Vec::new(),
            movement_amount,
            last_error: None,
            run_id: None,
        }
    }

    /// Fraction of completed steps, `current_index / total`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.current_index as f64 / self.total as f64
        }
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&ResultSample> {
        self.results.last()
    }
}

/// Motion issued at the start of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    /// Homing sequence.
    Home,
    /// Relative rotation by the current movement amount.
    Rotate,
}

/// One entry of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStep {
    /// Position in the run; equals the index of the sample it produces.
    pub index: usize,
    /// Motion that starts the step.
    pub motion: Motion,
}

/// Build the step list for a run of `total` steps.
pub fn build_pipeline(total: usize) -> Vec<PipelineStep> {
    (0..total)
        .map(|index| PipelineStep {
            index,
            motion: if index == 0 { Motion::Home } else { Motion::Rotate },
        })
        .collect()
}

/// Static settings of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Steps per run.
    pub total_steps: usize,
    /// Initial rotation amount.
    pub movement_amount: f64,
    /// Device receiving motion commands.
    pub motion_device: DeviceId,
    /// Device carrying the illumination relay.
    pub lamp_device: DeviceId,
    /// Analysis stages per step, in order.
    pub analysis_steps: Vec<String>,
    /// Mode passed to `aggregate_results`.
    pub aggregate_mode: Option<String>,
    /// Width of a zero-filled sample.
    pub class_count: usize,
    /// Idle-wait polling.
    pub idle_policy: PollPolicy,
    /// Refuse `start` while the motion device is not connected.
    pub require_motion_connected: bool,
}

impl From<&CycleConfig> for OrchestratorSettings {
    fn from(config: &CycleConfig) -> Self {
        Self {
            total_steps: config.total_steps,
            movement_amount: config.movement_amount,
            motion_device: config.motion_device_id(),
            lamp_device: config.lamp_device_id(),
            analysis_steps: config.analysis_steps.clone(),
            aggregate_mode: config.aggregate_mode.clone(),
            class_count: config.class_count,
            idle_policy: config.idle_policy(),
            require_motion_connected: config.require_motion_connected,
        }
    }
}

#[derive(Debug)]
enum CycleCommand {
    Start {
        response: oneshot::Sender<AppResult<bool>>,
    },
    Stop {
        response: oneshot::Sender<()>,
    },
    SetMovementAmount {
        amount: f64,
        response: oneshot::Sender<()>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

enum StepOutcome {
    Sample(ResultSample),
    Cancelled,
    Fatal(String),
}

/// Actor that owns and drives the measurement cycle.
pub struct MeasurementOrchestrator {
    settings: OrchestratorSettings,
    gateway: Gateway,
    problems: Arc<Deduplicator>,
    readiness: Option<watch::Receiver<DeviceSnapshot>>,
    state: watch::Sender<CycleSnapshot>,
    commands: mpsc::Receiver<CycleCommand>,
    cancel: CancelToken,
    movement_amount: f64,
    pending_stops: Vec<oneshot::Sender<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MeasurementOrchestrator {
    /// Spawn the orchestrator task.
    ///
    /// `readiness` is the motion device's supervisor view; it is consulted by
    /// `start` when `require_motion_connected` is set.
    pub fn spawn(
        settings: OrchestratorSettings,
        gateway: Gateway,
        problems: Arc<Deduplicator>,
        readiness: Option<watch::Receiver<DeviceSnapshot>>,
    ) -> (CycleHandle, JoinHandle<()>) {
        let (state, state_rx) = watch::channel(CycleSnapshot::idle(
            settings.total_steps,
            settings.movement_amount,
        ));
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = CancelToken::new();

        let actor = Self {
            movement_amount: settings.movement_amount,
            settings,
            gateway,
            problems,
            readiness,
            state,
            commands,
            cancel: cancel.clone(),
            pending_stops: Vec::new(),
            shutdown: None,
        };
        let task = tokio::spawn(actor.run());

        let handle = CycleHandle {
            commands: command_tx,
            state: state_rx,
            cancel,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!(steps = self.settings.total_steps, "Orchestrator started");

        while let Some(command) = self.commands.recv().await {
            match command {
                CycleCommand::Start { response } => {
                    if let Err(err) = self.check_ready() {
                        let _ = response.send(Err(err));
                        continue;
                    }
                    self.run_cycle(response).await;
                    if let Some(response) = self.shutdown.take() {
                        let _ = response.send(());
                        break;
                    }
                }
                CycleCommand::Stop { response } => {
                    self.cancel.reset();
                    if self.state.borrow().phase == CyclePhase::Faulted {
                        info!("Fault acknowledged, returning to idle");
                        self.state.send_modify(|s| {
                            s.phase = CyclePhase::Idle;
                            s.last_error = None;
                        });
                    } else {
                        debug!("Stop requested while idle");
                    }
                    let _ = response.send(());
                }
                CycleCommand::SetMovementAmount { amount, response } => {
                    self.apply_movement_amount(amount);
                    let _ = response.send(());
                }
                CycleCommand::Shutdown { response } => {
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("Orchestrator shutting down");
    }

    fn check_ready(&self) -> AppResult<()> {
        if !self.settings.require_motion_connected {
            return Ok(());
        }
        let Some(readiness) = &self.readiness else {
            return Ok(());
        };
        let state = readiness.borrow().state;
        if state.is_connected() {
            Ok(())
        } else {
            Err(InspectError::NotReady(format!(
                "{} is {:?}",
                self.settings.motion_device, state
            )))
        }
    }

    /// Handle commands that arrived during a run. Returns `false` once a
    /// stop has been requested.
    fn checkpoint(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                CycleCommand::Start { response } => {
                    debug!("Start ignored, cycle already running");
                    let _ = response.send(Ok(false));
                }
                CycleCommand::Stop { response } => {
                    self.cancel.cancel();
                    self.pending_stops.push(response);
                }
                CycleCommand::SetMovementAmount { amount, response } => {
                    self.apply_movement_amount(amount);
                    let _ = response.send(());
                }
                CycleCommand::Shutdown { response } => {
                    self.cancel.cancel();
                    self.shutdown = Some(response);
                }
            }
        }
        !self.cancel.is_cancelled()
    }

    fn apply_movement_amount(&mut self, amount: f64) {
        info!(amount, "Movement amount updated");
        self.movement_amount = amount;
        self.state.send_modify(|s| s.movement_amount = amount);
    }

    /// Run one cycle. `started` is answered once the running state has been
    /// published.
    async fn run_cycle(&mut self, started: oneshot::Sender<AppResult<bool>>) {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let pipeline = build_pipeline(self.settings.total_steps);

        self.problems.clear(&ProblemCode::CycleFaulted);
        self.problems
            .clear(&ProblemCode::MotionTimeout(self.settings.motion_device.clone()));
        self.state.send_modify(|s| {
            s.phase = CyclePhase::Running;
            s.active = true;
            s.current_index = 0;
            s.total = pipeline.len();
            s.results.clear();
            s.last_error = None;
            s.run_id = Some(run_id);
        });
        info!(%run_id, steps = pipeline.len(), "Measurement cycle started");
        let _ = started.send(Ok(true));

        self.set_lamp(true).await;

        for step in &pipeline {
            if !self.checkpoint() {
                return self.finish_stopped().await;
            }
            match self.execute_step(step).await {
                StepOutcome::Sample(sample) => {
                    // A stop that arrived during the step discards its result.
                    if !self.checkpoint() {
                        return self.finish_stopped().await;
                    }
                    debug!(step = step.index, counts = ?sample.counts_by_class, "Step complete");
                    self.state.send_modify(|s| {
                        s.results.push(sample);
                        s.current_index = step.index + 1;
                    });
                }
                StepOutcome::Cancelled => return self.finish_stopped().await,
                StepOutcome::Fatal(reason) => return self.finish_faulted(step.index, reason).await,
            }
        }

        self.finish_completed(run_id, started_at).await;
    }

    async fn execute_step(&mut self, step: &PipelineStep) -> StepOutcome {
        let device = self.settings.motion_device.clone();
        let mut degraded = false;

        let motion = match step.motion {
            Motion::Home => self.gateway.home(&device).await,
            Motion::Rotate => {
                self.gateway
                    .move_relative(&device, self.movement_amount)
                    .await
            }
        };
        if !motion.is_ok() {
            warn!(step = step.index, motion = ?step.motion, outcome = ?motion, "Motion command failed");
            degraded = true;
        }
        if !self.checkpoint() {
            return StepOutcome::Cancelled;
        }

        let gateway = self.gateway.clone();
        let idle_device = device.clone();
        let waited = wait_until(
            || {
                let gateway = gateway.clone();
                let device = idle_device.clone();
                async move { gateway.is_idle(&device).await }
            },
            &self.settings.idle_policy,
            Some(&self.cancel),
        )
        .await;
        match waited {
            Outcome::Ok(()) => {}
            Outcome::Failed(RemoteError::Cancelled) => return StepOutcome::Cancelled,
            Outcome::Failed(err) => return StepOutcome::Fatal(err.to_string()),
            Outcome::TimedOut => {
                return StepOutcome::Fatal(format!(
                    "{} did not become idle after {} polls",
                    device, self.settings.idle_policy.max_attempts
                ))
            }
        }

        let analyses = self.settings.analysis_steps.clone();
        for kind in &analyses {
            if !self.checkpoint() {
                return StepOutcome::Cancelled;
            }
            let outcome = self.gateway.run_analysis_step(kind).await;
            if !outcome.is_ok() {
                warn!(step = step.index, kind = %kind, ?outcome, "Analysis step failed");
                degraded = true;
            }
        }
        if !self.checkpoint() {
            return StepOutcome::Cancelled;
        }

        let mode = self.settings.aggregate_mode.clone();
        let counts_by_class = match self.gateway.aggregate_results(mode.as_deref()).await {
            Outcome::Ok(counts) => counts,
            outcome => {
                warn!(step = step.index, ?outcome, "Aggregation failed, zero-filling sample");
                degraded = true;
                vec![0; self.settings.class_count]
            }
        };

        StepOutcome::Sample(ResultSample {
            index: step.index,
            counts_by_class,
            timestamp: Utc::now(),
            degraded,
        })
    }

    async fn finish_stopped(&mut self) {
        info!("Measurement cycle stopped");
        self.state.send_modify(|s| {
            s.phase = CyclePhase::Idle;
            s.active = false;
            s.current_index = 0;
            s.results.clear();
            s.run_id = None;
        });
        self.set_lamp(false).await;
        self.settle();
    }

    async fn finish_faulted(&mut self, step: usize, reason: String) {
        error!(step, reason = %reason, "Measurement cycle faulted");
        self.state.send_modify(|s| {
            s.phase = CyclePhase::Faulted;
            s.active = false;
            s.current_index = 0;
            s.results.clear();
            s.last_error = Some(reason.clone());
        });
        self.set_lamp(false).await;
        self.problems.raise(
            ProblemCode::MotionTimeout(self.settings.motion_device.clone()),
            reason.clone(),
        );
        self.problems.raise(
            ProblemCode::CycleFaulted,
            format!("Measurement aborted at step {step}: {reason}"),
        );
        self.settle();
    }

    async fn finish_completed(&mut self, run_id: Uuid, started_at: DateTime<Utc>) {
        let samples = self.state.borrow().results.clone();
        self.state.send_modify(|s| {
            s.phase = CyclePhase::Idle;
            s.active = false;
        });
        info!(%run_id, samples = samples.len(), "Measurement cycle complete");
        self.set_lamp(false).await;

        let record = MeasurementRecord {
            run_id,
            started_at,
            finished_at: Utc::now(),
            movement_amount: self.movement_amount,
            samples,
        };
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            match gateway.record_measurement(&record).await {
                Outcome::Ok(()) => debug!(run_id = %record.run_id, "Measurement recorded"),
                outcome => warn!(run_id = %record.run_id, ?outcome, "Recording measurement failed"),
            }
        });
        self.settle();
    }

    /// Answer commands that queued up while the run was winding down, then
    /// clear the stop request. Starts sent during the run get `Ok(false)`.
    fn settle(&mut self) {
        self.checkpoint();
        self.cancel.reset();
        for response in self.pending_stops.drain(..) {
            let _ = response.send(());
        }
    }

    async fn set_lamp(&self, on: bool) {
        let outcome = self.gateway.set_lamp(&self.settings.lamp_device, on).await;
        if !outcome.is_ok() {
            warn!(lamp = %self.settings.lamp_device, on, ?outcome, "Lamp command failed");
        }
    }
}

/// Cloneable handle to the orchestrator.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    commands: mpsc::Sender<CycleCommand>,
    state: watch::Receiver<CycleSnapshot>,
    cancel: CancelToken,
}

impl CycleHandle {
    /// Start a run. `Ok(false)` if one is already running.
    ///
    /// # Errors
    /// `NotReady` if the motion device must be connected and is not.
    pub async fn start(&self) -> AppResult<bool> {
        let (response, rx) = oneshot::channel();
        self.send(CycleCommand::Start { response }).await?;
        rx.await
            .map_err(|_| InspectError::ActorStopped("orchestrator"))?
    }

    /// Request a cooperative stop and wait until the run has wound down.
    ///
    /// On a faulted orchestrator this acknowledges the fault: the phase goes
    /// back to `Idle` while the raised problem codes stay active.
    pub async fn stop(&self) -> AppResult<()> {
        self.cancel.cancel();
        let (response, rx) = oneshot::channel();
        self.send(CycleCommand::Stop { response }).await?;
        rx.await
            .map_err(|_| InspectError::ActorStopped("orchestrator"))
    }

    /// Change the rotation amount used by subsequent rotate steps.
    pub async fn set_movement_amount(&self, amount: f64) -> AppResult<()> {
        if !amount.is_finite() {
            return Err(InspectError::InvalidArgument(format!(
                "movement amount must be finite, got {amount}"
            )));
        }
        let (response, rx) = oneshot::channel();
        self.send(CycleCommand::SetMovementAmount { amount, response })
            .await?;
        rx.await
            .map_err(|_| InspectError::ActorStopped("orchestrator"))
    }

    /// Stop any run and end the orchestrator task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.cancel.cancel();
        let (response, rx) = oneshot::channel();
        self.send(CycleCommand::Shutdown { response }).await?;
        rx.await
            .map_err(|_| InspectError::ActorStopped("orchestrator"))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> CycleSnapshot {
        self.state.borrow().clone()
    }

    /// Live view of the snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CycleSnapshot> {
        self.state.clone()
    }

    async fn send(&self, command: CycleCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| InspectError::ActorStopped("orchestrator"))
    }
}

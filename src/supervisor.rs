//! Per-device connection supervision.
//!
//! Each monitored device gets one [`ConnectionSupervisor`] task. The task is
//! the only writer of that device's [`ConnectionState`]; everybody else reads
//! the published [`DeviceSnapshot`] through a `watch` channel.
//!
//! # Loops
//!
//! A supervisor alternates between two periodic behaviours:
//!
//! - **health poll** at the normal interval while the device is believed
//!   connected (or not yet known), calling `status`;
//! - **reconnect** at the faster interval while the device is believed
//!   disconnected, calling `connect`.
//!
//! Both are phases of the same driver loop. The phase changes in the same
//! step as the state transition that causes it, so a device can never have a
//! health-poll timer and a reconnect timer running at once, and a new call is
//! never issued before the previous one resolved.
//!
//! ```text
//!   Unknown ──poll ok──▶ Connected ──poll fail──▶ Disconnected
//!                            ▲                         │
//!                            │                 reconnect attempt
//!                            │                         ▼
//!                            └────connect ok──── Reconnecting ◀─┐
//!                                                      └─fail───┘
//! ```

use crate::device::{ActiveLoop, ConnectionState, DeviceId, DeviceKind, DeviceSnapshot};
use crate::error::{AppResult, InspectError};
use crate::gateway::{Gateway, Outcome};
use crate::notify::{Deduplicator, ProblemCode};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 16;

/// Timing for one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Interval between health polls.
    pub poll_interval: Duration,
    /// Interval between reconnect attempts.
    pub reconnect_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

impl From<&crate::config::SupervisorConfig> for SupervisorSettings {
    fn from(config: &crate::config::SupervisorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            reconnect_interval: config.reconnect_interval(),
        }
    }
}

#[derive(Debug)]
enum SupervisorCommand {
    Connect {
        response: oneshot::Sender<ConnectionState>,
    },
    Disconnect {
        response: oneshot::Sender<ConnectionState>,
    },
    Shutdown,
}

/// State machine task for one device.
pub struct ConnectionSupervisor {
    device: DeviceId,
    kind: DeviceKind,
    gateway: Gateway,
    problems: Arc<Deduplicator>,
    settings: SupervisorSettings,
    snapshot: watch::Sender<DeviceSnapshot>,
    commands: mpsc::Receiver<SupervisorCommand>,
}

impl ConnectionSupervisor {
    /// Spawn the supervisor task for `device` and return its handle.
    ///
    /// The first health poll runs immediately.
    pub fn spawn(
        device: DeviceId,
        kind: DeviceKind,
        gateway: Gateway,
        problems: Arc<Deduplicator>,
        settings: SupervisorSettings,
    ) -> SupervisorHandle {
        let (snapshot, snapshot_rx) = watch::channel(DeviceSnapshot::unknown(device.clone(), kind));
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let supervisor = Self {
            device: device.clone(),
            kind,
            gateway,
            problems,
            settings,
            snapshot,
            commands,
        };
        let task = tokio::spawn(supervisor.run());

        SupervisorHandle {
            device,
            commands: command_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    async fn run(mut self) {
        info!(device = %self.device, "Supervisor started");
        self.switch_loop(ActiveLoop::HealthPoll);
        self.health_poll().await;

        loop {
            let delay = match self.active_loop() {
                ActiveLoop::HealthPoll => Some(self.settings.poll_interval),
                ActiveLoop::Reconnect => Some(self.settings.reconnect_interval),
                ActiveLoop::None => None,
            };

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SupervisorCommand::Connect { response }) => {
                        self.operator_connect().await;
                        let _ = response.send(self.state());
                    }
                    Some(SupervisorCommand::Disconnect { response }) => {
                        self.operator_disconnect().await;
                        let _ = response.send(self.state());
                    }
                    Some(SupervisorCommand::Shutdown) | None => break,
                },

                _ = sleep(delay.unwrap_or_default()), if delay.is_some() => self.tick().await,
            }
        }

        self.switch_loop(ActiveLoop::None);
        info!(device = %self.device, "Supervisor stopped");
    }

    async fn tick(&mut self) {
        match self.active_loop() {
            ActiveLoop::HealthPoll => self.health_poll().await,
            ActiveLoop::Reconnect => self.reconnect_attempt().await,
            ActiveLoop::None => {}
        }
    }

    async fn health_poll(&mut self) {
        match self.gateway.status(&self.device).await {
            Outcome::Ok(status) if status.connected => self.mark_connected(status.detail),
            Outcome::Ok(status) => self.mark_lost(
                status
                    .detail
                    .unwrap_or_else(|| "controller reports device disconnected".to_string()),
            ),
            Outcome::Failed(err) => self.mark_lost(err.to_string()),
            Outcome::TimedOut => self.mark_lost("status poll timed out".to_string()),
        }
    }

    async fn reconnect_attempt(&mut self) {
        let last_reason = self.snapshot.borrow().detail.clone();
        self.publish(ConnectionState::Reconnecting, ActiveLoop::Reconnect, last_reason);
        match self.gateway.connect(&self.device).await {
            Outcome::Ok(()) => {
                info!(device = %self.device, "Reconnected");
                self.mark_connected(None);
            }
            Outcome::Failed(err) => {
                debug!(device = %self.device, error = %err, "Reconnect attempt failed");
                self.set_detail(err.to_string());
            }
            Outcome::TimedOut => {
                debug!(device = %self.device, "Reconnect attempt timed out");
                self.set_detail("reconnect timed out".to_string());
            }
        }
    }

    async fn operator_connect(&mut self) {
        info!(device = %self.device, "Operator connect requested");
        match self.gateway.connect(&self.device).await {
            Outcome::Ok(()) => self.mark_connected(None),
            Outcome::Failed(err) => self.mark_lost(err.to_string()),
            Outcome::TimedOut => self.mark_lost("connect timed out".to_string()),
        }
    }

    async fn operator_disconnect(&mut self) {
        info!(device = %self.device, "Operator disconnect requested");
        if let Outcome::Failed(err) = self.gateway.disconnect(&self.device).await {
            warn!(device = %self.device, error = %err, "Remote disconnect failed");
        }
        self.publish(
            ConnectionState::Disconnected,
            ActiveLoop::None,
            Some("disconnected by operator".to_string()),
        );
        self.problems.clear(&self.offline_code());
    }

    fn mark_connected(&mut self, detail: Option<String>) {
        if self.state() != ConnectionState::Connected {
            info!(device = %self.device, "Device connected");
        }
        self.publish(ConnectionState::Connected, ActiveLoop::HealthPoll, detail);
        self.problems.clear(&self.offline_code());
    }

    fn mark_lost(&mut self, reason: String) {
        warn!(device = %self.device, reason = %reason, "Device disconnected");
        let message = format!("{} offline: {}", self.kind.label(), reason);
        self.publish(
            ConnectionState::Disconnected,
            ActiveLoop::Reconnect,
            Some(reason),
        );
        self.problems.raise(self.offline_code(), message);
    }

    fn offline_code(&self) -> ProblemCode {
        ProblemCode::DeviceOffline(self.device.clone())
    }

    fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    fn active_loop(&self) -> ActiveLoop {
        self.snapshot.borrow().active_loop
    }

    /// Change loop phase without a state transition.
    fn switch_loop(&mut self, next: ActiveLoop) {
        let current = self.active_loop();
        if current != next {
            debug!(device = %self.device, from = ?current, to = ?next, "Switching loop");
            self.snapshot.send_modify(|snap| snap.active_loop = next);
        }
    }

    /// Publish a state transition together with the loop phase it implies.
    fn publish(&mut self, state: ConnectionState, active_loop: ActiveLoop, detail: Option<String>) {
        let current = self.active_loop();
        if current != active_loop {
            debug!(device = %self.device, from = ?current, to = ?active_loop, "Switching loop");
        }
        self.snapshot.send_modify(|snap| {
            if snap.state != state {
                snap.since = Utc::now();
            }
            snap.state = state;
            snap.active_loop = active_loop;
            snap.detail = detail;
        });
    }

    fn set_detail(&mut self, detail: String) {
        self.snapshot.send_modify(|snap| snap.detail = Some(detail));
    }
}

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    device: DeviceId,
    commands: mpsc::Sender<SupervisorCommand>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("device", &self.device)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SupervisorHandle {
    /// Supervised device.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Live view of the snapshot.
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    /// Whether the supervisor task is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Operator connect toggle. Resolves with the state after the attempt.
    pub async fn connect(&self) -> AppResult<ConnectionState> {
        let (response, rx) = oneshot::channel();
        self.send(SupervisorCommand::Connect { response }).await?;
        rx.await.map_err(|_| InspectError::ActorStopped("supervisor"))
    }

    /// Operator disconnect toggle. Parks the device until `connect`.
    pub async fn disconnect(&self) -> AppResult<ConnectionState> {
        let (response, rx) = oneshot::channel();
        self.send(SupervisorCommand::Disconnect { response }).await?;
        rx.await.map_err(|_| InspectError::ActorStopped("supervisor"))
    }

    /// Stop the supervisor and wait for its task to end.
    pub async fn shutdown(self) -> AppResult<()> {
        // A closed channel means the task already ended.
        let _ = self.commands.send(SupervisorCommand::Shutdown).await;
        self.task
            .await
            .map_err(|_| InspectError::ActorStopped("supervisor"))
    }

    async fn send(&self, command: SupervisorCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| InspectError::ActorStopped("supervisor"))
    }
}

/// Owns the live supervisors, at most one per device.
#[derive(Debug, Default)]
pub struct SupervisorRegistry {
    supervisors: BTreeMap<DeviceId, SupervisorHandle>,
}

impl SupervisorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start supervising `device`.
    ///
    /// # Errors
    /// `AlreadySupervised` if a live supervisor exists for the device. A
    /// finished supervisor is replaced.
    pub fn spawn(
        &mut self,
        device: DeviceId,
        kind: DeviceKind,
        gateway: Gateway,
        problems: Arc<Deduplicator>,
        settings: SupervisorSettings,
    ) -> AppResult<&SupervisorHandle> {
        if self
            .supervisors
            .get(&device)
            .is_some_and(SupervisorHandle::is_running)
        {
            return Err(InspectError::AlreadySupervised(device));
        }

        let handle = ConnectionSupervisor::spawn(device.clone(), kind, gateway, problems, settings);
        self.supervisors.insert(device.clone(), handle);
        self.get(&device)
    }

    /// Handle for `device`.
    pub fn get(&self, device: &DeviceId) -> AppResult<&SupervisorHandle> {
        self.supervisors
            .get(device)
            .ok_or_else(|| InspectError::UnknownDevice(device.to_string()))
    }

    /// Supervised device ids, ordered.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.supervisors.keys()
    }

    /// Snapshots of every device, ordered by id.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.supervisors.values().map(SupervisorHandle::snapshot).collect()
    }

    /// Number of registered supervisors.
    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    /// Whether no supervisor is registered.
    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Stop every supervisor concurrently.
    pub async fn shutdown_all(&mut self) {
        let handles = std::mem::take(&mut self.supervisors);
        let stops = handles.into_iter().map(|(device, handle)| async move {
            if let Err(err) = handle.shutdown().await {
                warn!(device = %device, error = %err, "Supervisor did not stop cleanly");
            }
        });
        join_all(stops).await;
    }
}

//! Station assembly and the presentation-facing API.
//!
//! A [`Station`] is built from an [`InspectConfig`] and a [`RemoteService`]:
//! it creates the shared [`Deduplicator`], one supervisor per enabled device
//! and the measurement orchestrator. Presentation code only ever talks to the
//! station: live views come back as `watch`/`broadcast` receivers, commands
//! are async methods.

use crate::config::InspectConfig;
use crate::device::{ConnectionState, DeviceId, DeviceSnapshot};
use crate::error::{AppResult, InspectError};
use crate::gateway::{Gateway, RemoteService};
use crate::notify::{ActiveProblem, Deduplicator, Notification};
use crate::orchestrator::{CycleHandle, CycleSnapshot, MeasurementOrchestrator, OrchestratorSettings};
use crate::supervisor::{SupervisorRegistry, SupervisorSettings};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running inspection station.
pub struct Station {
    config: InspectConfig,
    problems: Arc<Deduplicator>,
    supervisors: SupervisorRegistry,
    cycle: CycleHandle,
    cycle_task: JoinHandle<()>,
}

impl Station {
    /// Validate `config` and spawn every component.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: InspectConfig, service: Arc<dyn RemoteService>) -> AppResult<Self> {
        config.validate()?;

        let problems = Arc::new(Deduplicator::new());
        let supervisor_gateway = Gateway::new(service, config.supervisor.call_timeout());
        let cycle_gateway = supervisor_gateway.with_timeout(config.cycle.call_timeout());
        let settings = SupervisorSettings::from(&config.supervisor);

        let mut supervisors = SupervisorRegistry::new();
        for (device, kind) in config.enabled_devices() {
            supervisors.spawn(
                device,
                kind,
                supervisor_gateway.clone(),
                Arc::clone(&problems),
                settings,
            )?;
        }

        let readiness = supervisors
            .get(&config.cycle.motion_device_id())
            .ok()
            .map(|handle| handle.subscribe());
        let (cycle, cycle_task) = MeasurementOrchestrator::spawn(
            OrchestratorSettings::from(&config.cycle),
            cycle_gateway,
            Arc::clone(&problems),
            readiness,
        );

        info!(
            name = %config.application.name,
            devices = supervisors.len(),
            "Station started"
        );

        Ok(Self {
            config,
            problems,
            supervisors,
            cycle,
            cycle_task,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &InspectConfig {
        &self.config
    }

    /// Current snapshot of every supervised device, ordered by id.
    pub fn device_states(&self) -> Vec<DeviceSnapshot> {
        self.supervisors.snapshots()
    }

    /// Live view of one device.
    pub fn watch_device(&self, device: &str) -> AppResult<watch::Receiver<DeviceSnapshot>> {
        Ok(self.supervisors.get(&DeviceId::new(device))?.subscribe())
    }

    /// Live view of the active problem set.
    pub fn watch_problems(&self) -> watch::Receiver<Vec<ActiveProblem>> {
        self.problems.watch_active()
    }

    /// Currently active problems.
    pub fn active_problems(&self) -> Vec<ActiveProblem> {
        self.problems.active()
    }

    /// Stream of raised/resolved notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.problems.subscribe()
    }

    /// Live view of the measurement cycle.
    pub fn watch_cycle(&self) -> watch::Receiver<CycleSnapshot> {
        self.cycle.subscribe()
    }

    /// Handle to the orchestrator.
    pub fn cycle(&self) -> &CycleHandle {
        &self.cycle
    }

    /// Start a measurement cycle. `Ok(false)` if one is already running.
    pub async fn start_cycle(&self) -> AppResult<bool> {
        self.cycle.start().await
    }

    /// Stop the running cycle, if any.
    pub async fn stop_cycle(&self) -> AppResult<()> {
        self.cycle.stop().await
    }

    /// Change the rotation amount for subsequent steps.
    pub async fn set_movement_amount(&self, amount: f64) -> AppResult<()> {
        self.cycle.set_movement_amount(amount).await
    }

    /// Operator connect toggle.
    pub async fn connect_device(&self, device: &str) -> AppResult<ConnectionState> {
        self.supervisors.get(&DeviceId::new(device))?.connect().await
    }

    /// Operator disconnect toggle.
    pub async fn disconnect_device(&self, device: &str) -> AppResult<ConnectionState> {
        self.supervisors.get(&DeviceId::new(device))?.disconnect().await
    }

    /// Stop the orchestrator and every supervisor.
    pub async fn shutdown(mut self) -> AppResult<()> {
        info!("Shutting down station");
        if let Err(err) = self.cycle.shutdown().await {
            warn!(error = %err, "Orchestrator did not acknowledge shutdown");
        }
        self.cycle_task
            .await
            .map_err(|_| InspectError::ActorStopped("orchestrator"))?;
        self.supervisors.shutdown_all().await;
        Ok(())
    }
}

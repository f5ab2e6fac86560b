//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use nozzle_inspect::device::DeviceId;
use nozzle_inspect::gateway::mock::MockService;
use nozzle_inspect::gateway::Gateway;
use nozzle_inspect::notify::{Deduplicator, Notification};
use nozzle_inspect::orchestrator::{
    CycleHandle, CycleSnapshot, MeasurementOrchestrator, OrchestratorSettings,
};
use nozzle_inspect::poller::PollPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Orchestrator settings with short idle polling.
pub fn cycle_settings(total_steps: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        total_steps,
        movement_amount: 45.0,
        motion_device: DeviceId::new("turntable"),
        lamp_device: DeviceId::new("lamp"),
        analysis_steps: vec!["detect".to_string(), "classify".to_string()],
        aggregate_mode: None,
        class_count: 4,
        idle_policy: PollPolicy {
            interval: Duration::from_millis(100),
            max_attempts: 10,
        },
        require_motion_connected: false,
    }
}

/// Orchestrator under test together with its collaborators.
pub struct CycleFixture {
    pub service: Arc<MockService>,
    pub problems: Arc<Deduplicator>,
    pub handle: CycleHandle,
    pub task: JoinHandle<()>,
}

impl CycleFixture {
    pub fn spawn(service: MockService, settings: OrchestratorSettings) -> Self {
        let service = Arc::new(service);
        let problems = Arc::new(Deduplicator::new());
        let gateway = Gateway::new(service.clone(), Duration::from_secs(2));
        let (handle, task) =
            MeasurementOrchestrator::spawn(settings, gateway, Arc::clone(&problems), None);
        Self {
            service,
            problems,
            handle,
            task,
        }
    }

    /// Start a cycle and wait until it is no longer active.
    pub async fn run_to_end(&self) -> CycleSnapshot {
        assert!(self.handle.start().await.expect("start accepted"));
        self.wait_inactive().await
    }

    pub async fn wait_inactive(&self) -> CycleSnapshot {
        let mut rx = self.handle.subscribe();
        let snapshot = rx
            .wait_for(|s| !s.active)
            .await
            .expect("orchestrator alive")
            .clone();
        snapshot
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await.expect("shutdown acknowledged");
        self.task.await.expect("orchestrator task joined");
    }
}

/// Drain every notification currently buffered.
pub fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

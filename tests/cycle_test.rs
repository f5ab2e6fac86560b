//! Measurement cycle behaviour against the mock controller.

mod common;

use common::{cycle_settings, drain, CycleFixture};
use nozzle_inspect::device::{DeviceId, DeviceKind, DeviceSnapshot};
use nozzle_inspect::gateway::mock::{MockService, RemoteCall, Reply, StepFault};
use nozzle_inspect::gateway::Gateway;
use nozzle_inspect::notify::{Deduplicator, ProblemCode};
use nozzle_inspect::orchestrator::{CyclePhase, MeasurementOrchestrator};
use nozzle_inspect::{ConnectionState, InspectError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

fn lamp() -> DeviceId {
    DeviceId::new("lamp")
}

fn turntable() -> DeviceId {
    DeviceId::new("turntable")
}

fn lamp_off(call: &RemoteCall) -> bool {
    matches!(call, RemoteCall::SetLamp(id, false) if id.as_str() == "lamp")
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle_yields_ordered_samples() {
    let fixture = CycleFixture::spawn(MockService::new(), cycle_settings(5));

    let snapshot = fixture.run_to_end().await;

    assert_eq!(snapshot.phase, CyclePhase::Idle);
    assert!(!snapshot.active);
    assert_eq!(snapshot.current_index, 5);
    assert_eq!(snapshot.progress(), 1.0);
    assert_eq!(snapshot.results.len(), 5);
    for (i, sample) in snapshot.results.iter().enumerate() {
        assert_eq!(sample.index, i);
        assert_eq!(sample.counts_by_class, vec![i as u32 + 1; 4]);
        assert!(!sample.degraded);
    }

    // Lamp on, home, then four rotations by the configured amount.
    let calls = fixture.service.calls();
    assert_eq!(calls[0], RemoteCall::SetLamp(lamp(), true));
    assert_eq!(calls[1], RemoteCall::Home(turntable()));
    let rotations: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            RemoteCall::MoveRelative(_, amount) => Some(*amount),
            _ => None,
        })
        .collect();
    assert_eq!(rotations, vec![45.0; 4]);
    assert!(!fixture.service.lamp_on(&lamp()));

    sleep(Duration::from_millis(10)).await;
    let records = fixture.service.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].samples, snapshot.results);
    assert_eq!(records[0].class_totals(), vec![15; 4]);

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_analysis_failure_keeps_sample_count() {
    let service = MockService::new();
    service.inject(2, StepFault::Analysis(Reply::Reject("camera busy".into())));
    let fixture = CycleFixture::spawn(service, cycle_settings(5));

    let snapshot = fixture.run_to_end().await;

    assert_eq!(snapshot.phase, CyclePhase::Idle);
    assert_eq!(snapshot.results.len(), 5);
    let indices: Vec<_> = snapshot.results.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!(snapshot.results[2].degraded);
    // Aggregation still answered, so its counts are kept.
    assert_eq!(snapshot.results[2].counts_by_class, vec![3; 4]);
    assert_eq!(snapshot.results.iter().filter(|s| s.degraded).count(), 1);
    assert!(fixture.problems.active().is_empty());

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_aggregation_zero_fills() {
    let service = MockService::new();
    service.inject(1, StepFault::Aggregate(Reply::Hang));
    let fixture = CycleFixture::spawn(service, cycle_settings(3));

    let snapshot = fixture.run_to_end().await;

    assert_eq!(snapshot.results.len(), 3);
    assert_eq!(snapshot.results[1].counts_by_class, vec![0; 4]);
    assert!(snapshot.results[1].degraded);
    assert!(!snapshot.results[2].degraded);

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_cycle_clears_and_rests_lamp_once() {
    let fixture = CycleFixture::spawn(
        MockService::new().with_latency(Duration::from_millis(5)),
        cycle_settings(8),
    );
    let mut notifications = fixture.problems.subscribe();
    let mut rx = fixture.handle.subscribe();

    assert!(fixture.handle.start().await.unwrap());
    rx.wait_for(|s| s.current_index >= 2).await.unwrap();
    fixture.handle.stop().await.unwrap();

    let snapshot = fixture.handle.snapshot();
    assert!(!snapshot.active);
    assert_eq!(snapshot.phase, CyclePhase::Idle);
    assert!(snapshot.results.is_empty());
    assert_eq!(fixture.service.count_calls(lamp_off), 1);
    assert!(!fixture.service.lamp_on(&lamp()));

    // No further pipeline traffic once stopped.
    let calls_after_stop = fixture.service.calls().len();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(fixture.service.calls().len(), calls_after_stop);

    // Stopping an idle orchestrator is a no-op.
    fixture.handle.stop().await.unwrap();
    assert_eq!(fixture.service.count_calls(lamp_off), 1);

    assert!(drain(&mut notifications).is_empty());
    assert!(fixture.service.records().is_empty());
    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_queued_behind_stop_does_not_rerun() {
    let fixture = CycleFixture::spawn(MockService::new().with_motion_polls(5), cycle_settings(4));
    let lamp_on = |c: &RemoteCall| matches!(c, RemoteCall::SetLamp(id, true) if id.as_str() == "lamp");
    let is_home = |c: &RemoteCall| matches!(c, RemoteCall::Home(_));

    assert!(fixture.handle.start().await.unwrap());
    // Home step is now waiting for the turntable to settle.
    sleep(Duration::from_millis(250)).await;

    let handle = fixture.handle.clone();
    let second = tokio::spawn(async move { handle.start().await });
    sleep(Duration::from_millis(1)).await;
    fixture.handle.stop().await.unwrap();

    assert!(!second.await.unwrap().unwrap());
    let snapshot = fixture.handle.snapshot();
    assert!(!snapshot.active);
    assert_eq!(snapshot.phase, CyclePhase::Idle);
    assert_eq!(fixture.service.count_calls(lamp_on), 1);
    assert_eq!(fixture.service.count_calls(lamp_off), 1);
    assert_eq!(fixture.service.count_calls(is_home), 1);

    let calls_after_stop = fixture.service.calls().len();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(fixture.service.calls().len(), calls_after_stop);
    assert!(!fixture.handle.snapshot().active);

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_acknowledges_fault() {
    let service = MockService::new();
    service.inject(1, StepFault::NeverIdle);
    let fixture = CycleFixture::spawn(service, cycle_settings(4));

    let snapshot = fixture.run_to_end().await;
    assert_eq!(snapshot.phase, CyclePhase::Faulted);

    fixture.handle.stop().await.unwrap();

    let snapshot = fixture.handle.snapshot();
    assert_eq!(snapshot.phase, CyclePhase::Idle);
    assert!(snapshot.last_error.is_none());
    assert!(!snapshot.active);
    // Problem codes stay until the next run clears them.
    assert!(fixture.problems.is_active(&ProblemCode::CycleFaulted));
    assert!(fixture
        .problems
        .is_active(&ProblemCode::MotionTimeout(turntable())));
    assert_eq!(fixture.service.count_calls(lamp_off), 1);

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_faults_the_run() {
    let service = MockService::new();
    service.inject(1, StepFault::NeverIdle);
    let fixture = CycleFixture::spawn(service, cycle_settings(4));

    let snapshot = fixture.run_to_end().await;

    assert_eq!(snapshot.phase, CyclePhase::Faulted);
    assert!(!snapshot.active);
    assert!(snapshot.results.is_empty());
    assert!(snapshot.last_error.is_some());
    assert!(fixture.problems.is_active(&ProblemCode::CycleFaulted));
    assert!(fixture
        .problems
        .is_active(&ProblemCode::MotionTimeout(turntable())));
    assert_eq!(fixture.service.count_calls(lamp_off), 1);
    // Nothing moves after the faulted step.
    assert_eq!(
        fixture
            .service
            .count_calls(|c| matches!(c, RemoteCall::MoveRelative(..))),
        1
    );
    assert!(fixture.service.records().is_empty());

    // A new run clears the fault.
    let rerun = fixture.run_to_end().await;
    assert_eq!(rerun.phase, CyclePhase::Idle);
    assert_eq!(rerun.results.len(), 4);
    assert!(fixture.problems.active().is_empty());

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_noop() {
    let fixture = CycleFixture::spawn(MockService::new(), cycle_settings(4));

    assert!(fixture.handle.start().await.unwrap());
    assert!(!fixture.handle.start().await.unwrap());

    let snapshot = fixture.wait_inactive().await;
    assert_eq!(snapshot.results.len(), 4);
    assert_eq!(
        fixture
            .service
            .count_calls(|c| matches!(c, RemoteCall::Home(_))),
        1
    );

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_movement_amount_applies_to_later_steps() {
    let fixture = CycleFixture::spawn(MockService::new(), cycle_settings(5));
    let mut rx = fixture.handle.subscribe();

    assert!(fixture.handle.start().await.unwrap());
    rx.wait_for(|s| s.current_index >= 2).await.unwrap();
    fixture.handle.set_movement_amount(10.0).await.unwrap();

    let snapshot = fixture.wait_inactive().await;
    assert_eq!(snapshot.movement_amount, 10.0);
    let rotations: Vec<_> = fixture
        .service
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RemoteCall::MoveRelative(_, amount) => Some(amount),
            _ => None,
        })
        .collect();
    assert_eq!(rotations.len(), 4);
    assert_eq!(rotations.first(), Some(&45.0));
    assert_eq!(rotations.last(), Some(&10.0));

    assert!(matches!(
        fixture.handle.set_movement_amount(f64::NAN).await,
        Err(InspectError::InvalidArgument(_))
    ));

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_calls_never_overlap() {
    let fixture = CycleFixture::spawn(
        MockService::new().with_latency(Duration::from_millis(20)),
        cycle_settings(6),
    );

    fixture.run_to_end().await;

    assert_eq!(fixture.service.max_pipeline_concurrency(), 1);
    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_refused_while_motion_device_down() {
    let service = Arc::new(MockService::new());
    let problems = Arc::new(Deduplicator::new());
    let gateway = Gateway::new(service.clone(), Duration::from_secs(2));
    let (readiness_tx, readiness) =
        watch::channel(DeviceSnapshot::unknown(turntable(), DeviceKind::Turntable));
    let mut settings = cycle_settings(3);
    settings.require_motion_connected = true;

    let (handle, task) =
        MeasurementOrchestrator::spawn(settings, gateway, problems, Some(readiness));

    assert!(matches!(
        handle.start().await,
        Err(InspectError::NotReady(_))
    ));
    assert!(service.calls().is_empty());

    readiness_tx.send_modify(|s| s.state = ConnectionState::Connected);
    assert!(handle.start().await.unwrap());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

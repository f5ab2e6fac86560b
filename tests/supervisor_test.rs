//! Connection supervision against the mock controller.

mod common;

use common::drain;
use nozzle_inspect::device::{ActiveLoop, ConnectionState, DeviceId, DeviceKind, DeviceSnapshot};
use nozzle_inspect::gateway::mock::{MockService, RemoteCall, Reply};
use nozzle_inspect::gateway::Gateway;
use nozzle_inspect::notify::{Deduplicator, NotificationKind, ProblemCode};
use nozzle_inspect::supervisor::{ConnectionSupervisor, SupervisorHandle, SupervisorSettings};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        poll_interval: Duration::from_secs(5),
        reconnect_interval: Duration::from_secs(3),
    }
}

fn spawn(service: &Arc<MockService>, problems: &Arc<Deduplicator>, id: &str) -> SupervisorHandle {
    ConnectionSupervisor::spawn(
        DeviceId::new(id),
        DeviceKind::Turntable,
        Gateway::new(service.clone(), Duration::from_secs(2)),
        Arc::clone(problems),
        settings(),
    )
}

/// Record every published snapshot, collapsing repeats of the same state.
fn collect(handle: &SupervisorHandle) -> Arc<Mutex<Vec<DeviceSnapshot>>> {
    let seen = Arc::new(Mutex::new(vec![handle.snapshot()]));
    let mut rx = handle.subscribe();
    let sink = Arc::clone(&seen);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            let mut seen = sink.lock();
            if seen.last().map(|s| s.state) != Some(snapshot.state) {
                seen.push(snapshot);
            }
        }
    });
    seen
}

#[tokio::test(start_paused = true)]
async fn test_drop_and_reconnect_sequence() {
    let service = Arc::new(MockService::new().with_latency(Duration::from_millis(1)));
    let problems = Arc::new(Deduplicator::new());
    let mut notifications = problems.subscribe();
    let turntable = DeviceId::new("turntable");
    service.script_status(&turntable, [Reply::Ok, Reply::Unreachable]);
    service.script_connect(&turntable, [Reply::Unreachable, Reply::Ok]);

    let handle = spawn(&service, &problems, "turntable");
    let seen = collect(&handle);

    // t=0 ok, t=5 fail, t=8 reconnect fails, t=11 reconnect succeeds.
    sleep(Duration::from_secs(12)).await;

    let states: Vec<_> = seen.lock().iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Unknown,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );

    let events = drain(&mut notifications);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, NotificationKind::Raised);
    assert_eq!(events[1].kind, NotificationKind::Resolved);
    let offline = ProblemCode::DeviceOffline(turntable);
    assert!(events.iter().all(|n| n.code == offline));
    assert!(!problems.is_active(&offline));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_loop_phase_matches_state() {
    let service = Arc::new(MockService::new().with_latency(Duration::from_millis(1)));
    let problems = Arc::new(Deduplicator::new());
    let turntable = DeviceId::new("turntable");
    service.script_status(&turntable, [Reply::Ok, Reply::Reject("axis fault".into())]);
    service.script_connect(&turntable, [Reply::Unreachable, Reply::Unreachable, Reply::Ok]);

    let handle = spawn(&service, &problems, "turntable");
    let seen = collect(&handle);
    sleep(Duration::from_secs(30)).await;

    for snapshot in seen.lock().iter() {
        let expected = match snapshot.state {
            // Published before the first poll.
            ConnectionState::Unknown => continue,
            ConnectionState::Connected => ActiveLoop::HealthPoll,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => ActiveLoop::Reconnect,
        };
        assert_eq!(snapshot.active_loop, expected, "{snapshot:?}");
    }
    assert_eq!(handle.state(), ConnectionState::Connected);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_health_polls_while_reconnecting() {
    let service = Arc::new(MockService::new());
    let problems = Arc::new(Deduplicator::new());
    let printer = DeviceId::new("printer");
    service.set_online(&printer, false);

    let handle = spawn(&service, &problems, "printer");
    sleep(Duration::from_millis(100)).await;
    let is_status = |c: &RemoteCall| matches!(c, RemoteCall::Status(_));
    let is_connect = |c: &RemoteCall| matches!(c, RemoteCall::Connect(_));
    assert_eq!(service.count_calls(is_status), 1);

    // Offline for 20 s: reconnect attempts at 3, 6, ... 18 s and no status.
    sleep(Duration::from_secs(20)).await;
    assert_eq!(service.count_calls(is_status), 1);
    assert_eq!(service.count_calls(is_connect), 6);

    // Back online: the next reconnect succeeds and polling takes over.
    service.set_online(&printer, true);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(handle.state(), ConnectionState::Connected);
    let connects = service.count_calls(is_connect);
    sleep(Duration::from_secs(20)).await;
    assert_eq!(service.count_calls(is_connect), connects);
    assert!(service.count_calls(is_status) >= 4);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_devices_are_independent() {
    let service = Arc::new(MockService::new());
    let problems = Arc::new(Deduplicator::new());
    let scanner = DeviceId::new("scanner");
    service.script_status(&scanner, [Reply::Hang]);

    let slow = spawn(&service, &problems, "scanner");
    let fast = spawn(&service, &problems, "printer");

    sleep(Duration::from_millis(10)).await;
    assert_eq!(fast.state(), ConnectionState::Connected);
    assert_eq!(slow.state(), ConnectionState::Unknown);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(slow.state(), ConnectionState::Disconnected);
    assert_eq!(fast.state(), ConnectionState::Connected);
    assert_eq!(problems.active().len(), 1);

    slow.shutdown().await.unwrap();
    fast.shutdown().await.unwrap();
}

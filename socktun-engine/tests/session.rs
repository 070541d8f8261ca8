//! Session controller lifecycle tests

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use socktun_engine::{
    Error, FailureKind, MemoryProfileStore, ProfileStore, ProxyEndpoint, SelectedProfile,
    SessionState, Status,
};

fn endpoint() -> ProxyEndpoint {
    ProxyEndpoint::new("proxy.example.com", 1080).unwrap()
}

async fn wait_for_state(h: &Harness, pred: impl Fn(&SessionState) -> bool) -> SessionState {
    let mut rx = h.controller.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(&s.state)))
        .await
        .expect("state not reached in time")
        .expect("controller dropped")
        .state
        .clone();
    state
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_and_disconnect() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));

    let state = h.controller.connect(endpoint()).await.unwrap();
    assert_eq!(state, SessionState::Connected);
    assert!(eventually(|| h.engine.starts().len() == 1).await);

    let start = &h.engine.starts()[0];
    assert_eq!(start.fd, FAKE_FD);
    assert_eq!(start.mtu, 1500);
    assert_eq!(start.server, "proxy.example.com:1080");
    assert_eq!(start.user, None);

    let spec = &h.platform.specs()[0];
    assert!(!spec.routes.captures(PROXY));

    h.controller.disconnect().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.platform.opened(), 1);
    assert_eq!(h.platform.closed(), 1);
    assert!(h.engine.stop_calls() >= 1);

    assert!(
        eventually(|| h.recorder.statuses()
            == vec![Status::Connecting, Status::Connected, Status::Disconnected])
        .await
    );
    let notifications = h.recorder.notifications();
    assert!(notifications.iter().all(|n| n.endpoint == Some(endpoint())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_while_active_is_busy() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));

    h.controller.connect(endpoint()).await.unwrap();
    let before = h.controller.snapshot();

    let other = ProxyEndpoint::new("other.example.com", 9050).unwrap();
    let err = h.controller.connect(other).await.unwrap_err();
    assert!(matches!(err, Error::SessionBusy));
    assert_eq!(h.controller.snapshot(), before);
    assert_eq!(h.platform.opened(), 1);

    h.controller.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_while_connecting_is_busy() {
    let mut platform = FakePlatform::new();
    platform.delay = Some(Duration::from_millis(200));
    let h = harness(platform, EngineMode::UntilStopped(0));

    let controller = h.controller.clone();
    let first = tokio::spawn(async move { controller.connect(endpoint()).await });
    wait_for_state(&h, |s| *s == SessionState::Connecting).await;

    let err = h.controller.connect(endpoint()).await.unwrap_err();
    assert!(matches!(err, Error::SessionBusy));

    assert_eq!(first.await.unwrap().unwrap(), SessionState::Connected);
    h.controller.disconnect().await.unwrap();
    assert_eq!(h.platform.closed(), 1);
}

#[tokio::test]
async fn test_invalid_endpoint_is_rejected() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));

    let bad = ProxyEndpoint {
        host: "proxy".into(),
        port: 0,
        user: None,
        pass: None,
    };
    let err = h.controller.connect(bad).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(h.controller.snapshot().session_id, 0);
    assert!(h.recorder.statuses().is_empty());
    assert_eq!(h.platform.opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_during_connecting() {
    let mut platform = FakePlatform::new();
    platform.delay = Some(Duration::from_millis(200));
    let h = harness(platform, EngineMode::UntilStopped(0));

    let controller = h.controller.clone();
    let connect = tokio::spawn(async move { controller.connect(endpoint()).await });
    wait_for_state(&h, |s| *s == SessionState::Connecting).await;

    h.controller.disconnect().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Idle);

    let settled = connect.await.unwrap().unwrap();
    assert_ne!(settled, SessionState::Connecting);
    assert_eq!(h.platform.opened(), h.platform.closed());
    assert!(h.engine.starts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_while_interface_build_outlasts_timeout() {
    let mut platform = FakePlatform::new();
    platform.delay = Some(Duration::from_secs(1));
    let h = harness_with(
        platform,
        EngineMode::UntilStopped(0),
        Some(PROXY),
        Duration::from_millis(200),
    );

    let controller = h.controller.clone();
    let connect = tokio::spawn(async move { controller.connect(endpoint()).await });
    wait_for_state(&h, |s| *s == SessionState::Connecting).await;

    let started = Instant::now();
    h.controller.disconnect().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(h.controller.state(), SessionState::Idle);

    let settled = tokio::time::timeout(Duration::from_secs(1), connect)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_ne!(settled, SessionState::Connecting);

    // the abandoned build never gets to open the interface
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(h.platform.opened(), 0);
    assert_eq!(h.platform.opened(), h.platform.closed());
    assert!(h.engine.starts().is_empty());
    assert_eq!(h.controller.state(), SessionState::Idle);

    assert_eq!(
        h.controller.connect(endpoint()).await.unwrap(),
        SessionState::Connected
    );
    assert_eq!(h.platform.opened(), 1);

    h.controller.disconnect().await.unwrap();
    assert_eq!(h.platform.closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hung_engine_is_released_after_timeout() {
    let h = harness_with(
        FakePlatform::new(),
        EngineMode::Hang,
        Some(PROXY),
        Duration::from_millis(200),
    );

    assert_eq!(
        h.controller.connect(endpoint()).await.unwrap(),
        SessionState::Connected
    );
    assert!(eventually(|| h.engine.starts().len() == 1).await);

    let started = Instant::now();
    h.controller.disconnect().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.platform.closed(), 1);

    // a new session can start right away
    assert_eq!(
        h.controller.connect(endpoint()).await.unwrap(),
        SessionState::Connected
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_is_idempotent() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));

    h.controller.disconnect().await.unwrap();
    h.controller.disconnect().await.unwrap();
    assert_eq!(h.engine.stop_calls(), 0);
    assert!(h.recorder.statuses().is_empty());

    h.controller.connect(endpoint()).await.unwrap();
    h.controller.disconnect().await.unwrap();
    let stops = h.engine.stop_calls();
    let statuses = h.recorder.statuses();

    h.controller.disconnect().await.unwrap();
    assert_eq!(h.engine.stop_calls(), stops);
    assert_eq!(h.recorder.statuses(), statuses);
    assert_eq!(h.platform.closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_error_exit_fails_session() {
    let h = harness(
        FakePlatform::new(),
        EngineMode::ExitAfter(Duration::from_millis(50), 2),
    );

    h.controller.connect(endpoint()).await.unwrap();
    let state = wait_for_state(&h, |s| s.is_at_rest()).await;
    match state {
        SessionState::Failed(reason) => {
            assert_eq!(reason.kind, FailureKind::EngineRuntime);
            assert!(reason.message.contains('2'));
        }
        other => panic!("expected failure, got {}", other),
    }
    assert_eq!(h.platform.closed(), 1);

    assert!(eventually(|| h.recorder.statuses().last() == Some(&Status::Error)).await);
    let last = h.recorder.notifications().pop().unwrap();
    assert!(last.message.is_some());
    assert_eq!(
        h.recorder.statuses(),
        vec![Status::Connecting, Status::Connected, Status::Error]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_normal_exit_disconnects() {
    let h = harness(FakePlatform::new(), EngineMode::Exit(0));

    h.controller.connect(endpoint()).await.unwrap();
    let state = wait_for_state(&h, |s| s.is_at_rest()).await;
    assert_eq!(state, SessionState::Idle);
    assert_eq!(h.platform.closed(), 1);
    assert!(
        eventually(|| h.recorder.statuses()
            == vec![Status::Connecting, Status::Connected, Status::Disconnected])
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_exit_while_disconnecting_fails() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(9));

    h.controller.connect(endpoint()).await.unwrap();
    h.controller.disconnect().await.unwrap();
    match h.controller.state() {
        SessionState::Failed(reason) => assert_eq!(reason.kind, FailureKind::EngineRuntime),
        other => panic!("expected failure, got {}", other),
    }
    assert_eq!(h.platform.closed(), 1);
}

#[tokio::test]
async fn test_permission_denied() {
    let mut platform = FakePlatform::new();
    platform.deny = true;
    let h = harness(platform, EngineMode::UntilStopped(0));

    let state = h.controller.connect(endpoint()).await.unwrap();
    match state {
        SessionState::Failed(reason) => assert_eq!(reason.kind, FailureKind::PermissionDenied),
        other => panic!("expected failure, got {}", other),
    }
    assert_eq!(h.platform.opened(), 0);
    assert!(h.engine.starts().is_empty());
    assert_eq!(
        h.recorder.statuses(),
        vec![Status::Connecting, Status::Error]
    );
}

#[tokio::test]
async fn test_launch_failure_releases_interface() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));

    let endpoint = endpoint().with_credentials("bad\0user", "pass");
    let state = h.controller.connect(endpoint).await.unwrap();
    match state {
        SessionState::Failed(reason) => assert_eq!(reason.kind, FailureKind::EngineLaunch),
        other => panic!("expected failure, got {}", other),
    }
    assert_eq!(h.platform.opened(), 1);
    assert_eq!(h.platform.closed(), 1);
    assert!(h.engine.starts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_after_failure() {
    let mut platform = FakePlatform::new();
    platform.deny = true;
    let h = harness(platform, EngineMode::UntilStopped(0));

    let first = h.controller.connect(endpoint()).await.unwrap();
    assert!(matches!(first, SessionState::Failed(_)));

    // Failed is at rest, so a new attempt is accepted rather than busy
    let second = h.controller.connect(endpoint()).await.unwrap();
    assert!(matches!(second, SessionState::Failed(_)));
    assert_eq!(h.controller.snapshot().session_id, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_routes_and_unresolved_warning() {
    let mut platform = FakePlatform::new();
    platform.exclusion = false;
    let h = harness_with(
        platform,
        EngineMode::UntilStopped(0),
        None,
        Duration::from_millis(500),
    );

    h.controller.connect(endpoint()).await.unwrap();
    let spec = &h.platform.specs()[0];
    assert_eq!(spec.routes, socktun_tun::RouteTable::route_all());
    assert!(eventually(|| h
        .recorder
        .logs()
        .iter()
        .any(|l| l.contains("could not be resolved")))
    .await);

    h.controller.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exclusion_refused_falls_back_to_split() {
    let mut platform = FakePlatform::new();
    platform.refuse_exclusions = true;
    let h = harness(platform, EngineMode::UntilStopped(0));

    assert_eq!(
        h.controller.connect(endpoint()).await.unwrap(),
        SessionState::Connected
    );
    let specs = h.platform.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].routes.routes.len(), 32);
    assert!(!specs[0].routes.captures(PROXY));

    h.controller.disconnect().await.unwrap();
    assert_eq!(h.platform.closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_selected_profile() {
    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));
    let store = Arc::new(MemoryProfileStore::new());

    let err = h.controller.connect_selected(store.clone()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    store
        .select(SelectedProfile {
            endpoint: endpoint(),
            status: None,
        })
        .unwrap();
    assert_eq!(
        h.controller.connect_selected(store.clone()).await.unwrap(),
        SessionState::Connected
    );
    assert_eq!(h.controller.snapshot().endpoint, Some(endpoint()));

    h.controller.disconnect().await.unwrap();
}

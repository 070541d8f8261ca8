//! Control socket round trips against a live controller

#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::*;
use socktun_engine::{
    ControlClient, ControlRequest, ControlResponse, ControlServer, MemoryProfileStore,
    ProfileStore, ProxyEndpoint, Status,
};
use tokio::sync::broadcast;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_connect_status_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("socktun.sock");

    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));
    let store = Arc::new(MemoryProfileStore::new());
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

    let server = Arc::new(
        ControlServer::new(&socket, h.controller.clone())
            .with_store(store.clone())
            .with_shutdown(shutdown_tx),
    );
    let listener = server.bind().unwrap();
    tokio::spawn(server.serve(listener));

    let client = ControlClient::new(&socket);

    let endpoint = ProxyEndpoint::new("proxy.example.com", 1080)
        .unwrap()
        .with_credentials("alice", "secret");
    let info = client.connect(&endpoint).await.unwrap();
    assert_eq!(info.status, Some(Status::Connected));
    assert_eq!(info.endpoint.as_deref(), Some("alice@proxy.example.com:1080"));

    assert_eq!(store.profiles().unwrap(), vec![endpoint.clone()]);
    let selected = store.selected().unwrap().unwrap();
    assert_eq!(selected.endpoint, endpoint);
    assert_eq!(selected.status, Some(Status::Connected));

    let status = client.status().await.unwrap();
    assert_eq!(status.status, Some(Status::Connected));
    assert_eq!(status.session_id, 1);

    client.disconnect().await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.status, Some(Status::Disconnected));
    assert_eq!(h.platform.closed(), 1);

    // nothing left to stop
    client.disconnect().await.unwrap();

    client.shutdown().await.unwrap();
    shutdown_rx.recv().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_connect_keeps_selected_profile() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("socktun.sock");

    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));
    let store = Arc::new(MemoryProfileStore::new());
    let server = Arc::new(
        ControlServer::new(&socket, h.controller.clone()).with_store(store.clone()),
    );
    let listener = server.bind().unwrap();
    tokio::spawn(server.serve(listener));

    let client = ControlClient::new(&socket);
    let first = ProxyEndpoint::new("a.example.com", 1080).unwrap();
    let second = ProxyEndpoint::new("b.example.com", 1080).unwrap();

    let info = client.connect(&first).await.unwrap();
    assert_eq!(info.status, Some(Status::Connected));

    let err = client.connect(&second).await.unwrap_err();
    assert!(err.to_string().contains("already active"));

    let selected = store.selected().unwrap().unwrap();
    assert_eq!(selected.endpoint, first);
    assert_eq!(selected.status, Some(Status::Connected));
    assert_eq!(store.profiles().unwrap(), vec![first.clone()]);

    let status = client.status().await.unwrap();
    assert_eq!(status.endpoint.as_deref(), Some("a.example.com:1080"));
    assert_eq!(status.session_id, 1);

    client.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_rejects_bad_connect() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("socktun.sock");

    let h = harness(FakePlatform::new(), EngineMode::UntilStopped(0));
    let server = Arc::new(ControlServer::new(&socket, h.controller.clone()));
    let listener = server.bind().unwrap();
    tokio::spawn(server.serve(listener));

    let client = ControlClient::new(&socket);
    let response = client
        .request(ControlRequest::Connect {
            host: Some("proxy".into()),
            port: Some("not-a-port".into()),
            user: None,
            pass: None,
        })
        .await
        .unwrap();
    match response {
        ControlResponse::Error { message } => assert!(message.contains("port")),
        other => panic!("unexpected response {:?}", other),
    }

    // no shutdown sender configured
    assert!(client.shutdown().await.is_err());
    assert_eq!(h.controller.snapshot().session_id, 0);
}

#[tokio::test]
async fn test_client_without_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let client = ControlClient::new(dir.path().join("missing.sock"));
    assert!(client.status().await.is_err());
}

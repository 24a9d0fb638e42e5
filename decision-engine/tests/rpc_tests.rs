mod common;

use common::{echo_handler, FakeApp};
use decision_engine::config::RpcConfig;
use decision_engine::rpc::{RpcClient, RpcError};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[test]
fn named_and_positional_params_reach_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(dir.path(), "echo", echo_handler());
    let client = RpcClient::new(RpcConfig::default());
    let token = CancellationToken::new();

    let named = client
        .call(
            &app.socket_str(),
            "greet",
            &json!({"who": "world"}),
            Duration::from_secs(2),
            &token,
        )
        .unwrap();
    assert_eq!(
        named,
        json!({"method": "greet", "params": {"who": "world"}})
    );

    let scalar = client
        .call(&app.socket_str(), "double", &json!(21), Duration::from_secs(2), &token)
        .unwrap();
    assert_eq!(scalar, json!({"method": "double", "params": [21]}));

    let none = client
        .call(&app.socket_str(), "tick", &Value::Null, Duration::from_secs(2), &token)
        .unwrap();
    assert_eq!(none, json!({"method": "tick", "params": []}));

    let requests = app.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0]["jsonrpc"], json!("2.0"));
    assert!(requests[0]["id"].is_string());
}

#[test]
fn remote_error_member_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(
        dir.path(),
        "failing",
        Arc::new(|_: &str, _: &Value| {
            json!({"error": {"code": -32601, "message": "Method not found"}})
        }),
    );
    let client = RpcClient::new(RpcConfig::default());

    let err = client
        .call(
            &app.socket_str(),
            "missing",
            &json!({}),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote { code: -32601, .. }));
    assert_eq!(
        err.to_json(),
        json!({"error": "rpc_error", "code": -32601, "message": "Method not found"})
    );
}

#[test]
fn slow_server_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(
        dir.path(),
        "slow",
        Arc::new(|_: &str, _: &Value| {
            std::thread::sleep(Duration::from_millis(500));
            json!({"result": true})
        }),
    );
    let client = RpcClient::new(RpcConfig::default());

    let started = Instant::now();
    let err = client
        .call(
            &app.socket_str(),
            "wait",
            &json!({}),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(50)));
    assert_eq!(err.code(), "timeout");
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[test]
fn cancelled_token_aborts_the_call() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(dir.path(), "echo", echo_handler());
    let client = RpcClient::new(RpcConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let err = client
        .call(&app.socket_str(), "greet", &json!({}), Duration::ZERO, &token)
        .unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));
    assert_eq!(err.code(), "cancelled");
}

#[test]
fn missing_socket_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let client = RpcClient::new(RpcConfig::default());
    let err = client
        .call(
            &dir.path().join("nobody.sock").to_string_lossy(),
            "greet",
            &json!({}),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RpcError::Connect { .. }));
    assert_eq!(err.code(), "rpc_transport");
}

#[test]
fn oversized_response_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(
        dir.path(),
        "chatty",
        Arc::new(|_: &str, _: &Value| json!({"result": "x".repeat(8 * 1024)})),
    );
    let token = CancellationToken::new();

    let small = RpcClient::new(RpcConfig {
        max_response_bytes: 1024,
        ..RpcConfig::default()
    });
    let err = small
        .call(&app.socket_str(), "talk", &json!({}), Duration::from_secs(2), &token)
        .unwrap_err();
    assert!(matches!(err, RpcError::MalformedResponse(_)));
    assert_eq!(err.code(), "rpc_transport");

    let roomy = RpcClient::new(RpcConfig::default());
    let reply = roomy
        .call(&app.socket_str(), "talk", &json!({}), Duration::from_secs(2), &token)
        .unwrap();
    assert_eq!(reply.as_str().map(str::len), Some(8 * 1024));
}

//! Integration tests for the portal over real WebSockets.
//!
//! Each test starts a `PortalServer` on a random local port and talks to it
//! through a `Portal` using the WebSocket connector.

use hyportal::{
    ConnectionState, ExposedFunctions, HostContext, Notification, Portal, PortalError,
    PortalOptions, PortalServer, PortalServerHandle, ReconnectPolicy, Result, WireCodec,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

async fn add(args: Vec<Value>) -> Result<Value> {
    let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
    Ok(json!(sum))
}

async fn echo(args: Vec<Value>) -> Result<Value> {
    Ok(args.into_iter().next().unwrap_or(Value::Null))
}

async fn divide(args: Vec<Value>) -> Result<Value> {
    match (args.first().and_then(Value::as_f64), args.get(1).and_then(Value::as_f64)) {
        (Some(_), Some(b)) if b == 0.0 => Err(PortalError::remote("ZeroDivisionError: division by zero")),
        (Some(a), Some(b)) => Ok(json!(a / b)),
        _ => Err(PortalError::remote("TypeError: expected two numbers")),
    }
}

/// Start a server exposing `add`, `echo` and `divide`.
async fn start_server(codec: WireCodec) -> PortalServerHandle {
    let functions = ExposedFunctions::new()
        .expose("add", add)
        .expose("echo", echo)
        .expose("divide", divide);
    PortalServer::start(Arc::new(functions), codec)
        .await
        .expect("Failed to start portal server")
}

async fn with_deadline<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("Timed out")
}

#[tokio::test]
async fn test_call_round_trip() {
    let server = start_server(WireCodec::MessagePack).await;
    let portal = Portal::new(PortalOptions::new().with_url(server.url())).unwrap();

    let sum = with_deadline(portal.call("add", vec![json!(2), json!(3)])).await.unwrap();
    assert_eq!(sum, json!(5));

    let echoed = with_deadline(portal.call("echo", vec![json!({"nested": [1, "two", null]})]))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"nested": [1, "two", null]}));
}

#[tokio::test]
async fn test_remote_error() {
    let server = start_server(WireCodec::MessagePack).await;
    let portal = Portal::new(PortalOptions::new().with_url(server.url())).unwrap();

    match with_deadline(portal.call("divide", vec![json!(1), json!(0)])).await {
        Err(PortalError::Remote { message }) => {
            assert_eq!(message, "ZeroDivisionError: division by zero")
        }
        other => panic!("Expected remote error, got: {:?}", other),
    }

    match with_deadline(portal.call("missing", vec![])).await {
        Err(PortalError::Remote { message }) => assert!(message.contains("missing")),
        other => panic!("Expected remote error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_calls() {
    let server = start_server(WireCodec::MessagePack).await;
    let portal = Portal::new(PortalOptions::new().with_url(server.url())).unwrap();

    let calls = (0..20i64).map(|n| {
        let portal = portal.clone();
        tokio::spawn(async move { portal.call("add", vec![json!(n), json!(n)]).await })
    });
    let results = with_deadline(futures::future::join_all(calls)).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().unwrap(), json!(n as i64 * 2));
    }
    assert_eq!(portal.pending_calls(), 0);
}

#[tokio::test]
async fn test_events_reach_listeners() {
    let server = start_server(WireCodec::MessagePack).await;
    let portal = Portal::new(PortalOptions::new().with_url(server.url())).unwrap();
    let mut notifications = portal.subscribe();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    portal.on("message", move |event| {
        let _ = tx.send(event.clone());
    });
    with_deadline(portal.wait_for_state(ConnectionState::Open)).await;

    let mut kwargs = Map::new();
    kwargs.insert("sender".to_string(), json!("server"));
    assert_eq!(server.emit("message", vec![json!("hello")], kwargs).unwrap(), 1);

    let event = with_deadline(rx.recv()).await.unwrap();
    assert_eq!(event.name, "message");
    assert_eq!(event.arg(0), Some(&json!("hello")));
    assert_eq!(event.kwarg("sender"), Some(&json!("server")));

    let notified = with_deadline(async {
        loop {
            if let Notification::Event(event) = notifications.recv().await.unwrap() {
                return event;
            }
        }
    })
    .await;
    assert_eq!(notified, event);
}

#[tokio::test]
async fn test_reconnects_after_server_disconnect() {
    let server = start_server(WireCodec::MessagePack).await;
    let portal = Portal::new(
        PortalOptions::new()
            .with_url(server.url())
            .with_reconnect(ReconnectPolicy::Fixed(Duration::from_millis(50))),
    )
    .unwrap();

    with_deadline(portal.wait_for_state(ConnectionState::Open)).await;
    let mut states = portal.state_changes();

    server.disconnect_all();
    with_deadline(states.wait_for(|state| *state == ConnectionState::Closed))
        .await
        .unwrap();
    with_deadline(states.wait_for(|state| *state == ConnectionState::Open))
        .await
        .unwrap();

    let sum = with_deadline(portal.call("add", vec![json!(20), json!(22)])).await.unwrap();
    assert_eq!(sum, json!(42));
}

#[tokio::test]
async fn test_json_codec() {
    let server = start_server(WireCodec::Json).await;
    let portal = Portal::new(
        PortalOptions::new()
            .with_url(server.url())
            .with_codec(WireCodec::Json),
    )
    .unwrap();

    let quotient: f64 = with_deadline(portal.call_as("divide", vec![json!(9), json!(2)]))
        .await
        .unwrap();
    assert_eq!(quotient, 4.5);
}

#[tokio::test]
async fn test_relative_path_resolves_against_host() {
    let server = start_server(WireCodec::MessagePack).await;
    let host = HostContext::new(format!("127.0.0.1:{}", server.port), false);
    let portal = Portal::new(PortalOptions::new().with_host(host)).unwrap();

    assert_eq!(portal.url(), server.url());
    let sum = with_deadline(portal.call_with("add", (1, 2, 3))).await.unwrap();
    assert_eq!(sum, json!(6));
}

#[tokio::test]
async fn test_shutdown_and_reconnect() {
    let server = start_server(WireCodec::MessagePack).await;
    let portal = Portal::new(PortalOptions::new().with_url(server.url())).unwrap();
    with_deadline(portal.wait_for_state(ConnectionState::Open)).await;

    portal.shutdown();
    assert_eq!(portal.state(), ConnectionState::Idle);

    // A call on an idle portal connects again.
    let sum = with_deadline(portal.call("add", vec![json!(1)])).await.unwrap();
    assert_eq!(sum, json!(1));
    assert_eq!(portal.state(), ConnectionState::Open);
}

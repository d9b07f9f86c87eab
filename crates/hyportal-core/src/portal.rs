//! The portal: remote procedures as async calls, peer events as callbacks.
//!
//! Member names are resolved at call time. A small fixed set of names are
//! [`BuiltIn`] operations executed locally; every other name is a remote
//! procedure, so the portal needs no list of what the peer exposes.
//!
//! ```no_run
//! use hyportal::{Portal, PortalOptions};
//! use serde_json::json;
//!
//! # async fn demo() -> hyportal::Result<()> {
//! let portal = Portal::new(PortalOptions::new().with_url("ws://localhost:8000/_hy/ws"))?;
//! portal.on("message", |event| println!("{:?}", event.args));
//!
//! let sum = portal.call("add", vec![json!(2), json!(3)]).await?;
//! assert_eq!(sum, json!(5));
//! # Ok(())
//! # }
//! ```

use crate::config::PortalOptions;
use crate::events::{Event, EventBus, ListenerId};
use crate::protocol::Request;
use crate::registry::CallRegistry;
use crate::supervisor::{ConnectionState, Notification, Supervisor};
use crate::transport::{Connector, WsConnector};
use crate::url::resolve_url;
use crate::{PortalError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Operations the portal performs locally instead of sending to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltIn {
    Connect,
    Shutdown,
    On,
    Off,
    Once,
    Url,
    State,
    Subscribe,
}

impl BuiltIn {
    pub const ALL: [BuiltIn; 8] = [
        BuiltIn::Connect,
        BuiltIn::Shutdown,
        BuiltIn::On,
        BuiltIn::Off,
        BuiltIn::Once,
        BuiltIn::Url,
        BuiltIn::State,
        BuiltIn::Subscribe,
    ];

    /// Capability lookup: the built-in answering to `name`, if any.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltIn::Connect => "connect",
            BuiltIn::Shutdown => "shutdown",
            BuiltIn::On => "on",
            BuiltIn::Off => "off",
            BuiltIn::Once => "once",
            BuiltIn::Url => "url",
            BuiltIn::State => "state",
            BuiltIn::Subscribe => "subscribe",
        }
    }

    /// Built-ins that need a callback or return a handle, and so have no
    /// meaning when invoked with plain JSON arguments.
    pub fn takes_callback(&self) -> bool {
        matches!(
            self,
            BuiltIn::On | BuiltIn::Off | BuiltIn::Once | BuiltIn::Subscribe
        )
    }
}

/// What a member name resolves to.
#[derive(Debug, Clone)]
pub enum Member {
    BuiltIn(BuiltIn),
    Remote(RemoteMethod),
}

/// Client end of a portal. Cheap to clone; clones share one connection.
///
/// Dropping the last clone shuts the connection down.
#[derive(Clone)]
pub struct Portal {
    inner: Arc<PortalInner>,
}

struct PortalInner {
    supervisor: Arc<Supervisor>,
    registry: Arc<CallRegistry>,
    bus: Arc<EventBus>,
    next_id: AtomicU64,
    call_timeout: Option<Duration>,
}

impl Drop for PortalInner {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}

impl Portal {
    /// Create a portal that connects over WebSocket.
    ///
    /// With `auto_connect` (the default) the first connection attempt starts
    /// immediately, which requires a Tokio runtime.
    pub fn new(options: PortalOptions) -> Result<Self> {
        Self::with_connector(options, WsConnector::new())
    }

    /// Create a portal using a custom transport.
    pub fn with_connector<C: Connector>(options: PortalOptions, connector: C) -> Result<Self> {
        let url = resolve_url(options.url.as_deref(), options.host.as_ref())?;
        let registry = Arc::new(CallRegistry::new());
        let bus = Arc::new(EventBus::new());
        let supervisor = Supervisor::new(
            url,
            Arc::new(connector),
            &options,
            registry.clone(),
            bus.clone(),
        );

        let portal = Self {
            inner: Arc::new(PortalInner {
                supervisor,
                registry,
                bus,
                next_id: AtomicU64::new(1),
                call_timeout: options.call_timeout,
            }),
        };

        if options.auto_connect {
            portal.connect();
        }
        Ok(portal)
    }

    /// Resolved WebSocket URL.
    pub fn url(&self) -> &str {
        self.inner.supervisor.url()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.watch_state()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut changes = self.state_changes();
        let _ = changes.wait_for(|state| *state == target).await;
    }

    /// Subscribe to connection and event notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.supervisor.subscribe()
    }

    /// Start connecting. No-op while connecting or open; while a reconnect
    /// is scheduled, reconnects right away.
    pub fn connect(&self) {
        self.inner.supervisor.connect();
    }

    /// Close the connection and stop reconnecting. Outstanding calls stay
    /// pending; a later [`connect`](Self::connect) starts over.
    pub fn shutdown(&self) {
        self.inner.supervisor.shutdown();
    }

    /// Register a listener for events named `name`.
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.bus.on(name, callback)
    }

    /// Register a listener that fires for the next `name` event only.
    pub fn once<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.bus.once(name, callback)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.inner.bus.off(name, id)
    }

    /// The portal's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Resolve `name` to a built-in or a remote method handle.
    pub fn member(&self, name: &str) -> Member {
        match BuiltIn::lookup(name) {
            Some(builtin) => Member::BuiltIn(builtin),
            None => Member::Remote(self.method(name)),
        }
    }

    /// Invoke any member by name. Built-ins run locally; everything else is
    /// a remote call.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match self.member(name) {
            Member::BuiltIn(builtin) => self.invoke_builtin(builtin),
            Member::Remote(method) => method.call(args).await,
        }
    }

    fn invoke_builtin(&self, builtin: BuiltIn) -> Result<Value> {
        match builtin {
            BuiltIn::Connect => {
                self.connect();
                Ok(Value::Null)
            }
            BuiltIn::Shutdown => {
                self.shutdown();
                Ok(Value::Null)
            }
            BuiltIn::Url => Ok(Value::String(self.url().to_string())),
            BuiltIn::State => Ok(Value::String(self.state().as_str().to_string())),
            BuiltIn::On | BuiltIn::Off | BuiltIn::Once | BuiltIn::Subscribe => {
                Err(PortalError::LocalMember {
                    name: builtin.name().to_string(),
                })
            }
        }
    }

    /// Handle for the remote procedure `name`.
    pub fn method(&self, name: impl Into<String>) -> RemoteMethod {
        RemoteMethod {
            portal: self.clone(),
            name: name.into(),
        }
    }

    /// Call the remote procedure `name` with positional arguments.
    ///
    /// Built-in names are refused with `LocalMember` and never sent.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        if let Some(builtin) = BuiltIn::lookup(name) {
            return Err(PortalError::LocalMember {
                name: builtin.name().to_string(),
            });
        }

        self.ensure_open().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = self.inner.registry.register(id);

        if let Err(e) = self.inner.supervisor.send(&Request::rpc(id, name, args)) {
            self.inner.registry.discard(id);
            return Err(e);
        }
        debug!("Sent call {} '{}'", id, name);

        match self.inner.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.registry.discard(id);
                    debug!("Call {} '{}' timed out after {:?}", id, name, limit);
                    Err(PortalError::Timeout(limit))
                }
            },
            None => reply.await,
        }
    }

    /// Call with any serializable arguments. A sequence becomes the
    /// positional arguments, `()` means none, anything else is one argument.
    pub async fn call_with<A>(&self, name: &str, args: A) -> Result<Value>
    where
        A: Serialize,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        self.call(name, args).await
    }

    /// Call and deserialize the result.
    pub async fn call_as<T>(&self, name: &str, args: Vec<Value>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value = self.call(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Idle starts a connection, Connecting is waited out, and anything that
    /// does not end up Open fails fast.
    async fn ensure_open(&self) -> Result<()> {
        let supervisor = &self.inner.supervisor;
        match supervisor.state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Idle => self.connect(),
            ConnectionState::Connecting | ConnectionState::Closed => {}
        }

        match supervisor.settled_state().await {
            ConnectionState::Open => Ok(()),
            state => {
                debug!("Call refused: portal {} is {}", self.url(), state);
                Err(PortalError::NotConnected {
                    url: self.url().to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("url", &self.url())
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// A remote procedure bound to a portal.
#[derive(Debug, Clone)]
pub struct RemoteMethod {
    portal: Portal,
    name: String,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.portal.call(&self.name, args).await
    }

    pub async fn call_with<A: Serialize>(&self, args: A) -> Result<Value> {
        self.portal.call_with(&self.name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireCodec;
    use crate::transport::{MemoryConnector, MemoryListener, MemoryPeer};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    const URL: &str = "ws://memory/_hy/ws";

    fn options() -> PortalOptions {
        PortalOptions::new().with_url(URL)
    }

    /// Answer `add`, `echo`, `ping` and `fail`; leave anything else pending.
    /// Every decoded frame is appended to `seen`.
    async fn serve_peer(mut peer: MemoryPeer, seen: Arc<Mutex<Vec<Value>>>) {
        let codec = WireCodec::MessagePack;
        while let Some(frame) = peer.recv_value(codec).await {
            seen.lock().unwrap().push(frame.clone());
            if frame["type"] != "rpc" {
                continue;
            }

            let id = frame["id"].as_u64().unwrap();
            let args = frame["args"].as_array().cloned().unwrap_or_default();
            let response = match frame["name"].as_str().unwrap() {
                "add" => json!({"id": id, "result": args[0].as_i64().unwrap() + args[1].as_i64().unwrap()}),
                "echo" => json!({"id": id, "result": args}),
                "ping" => json!({"id": id, "result": "pong"}),
                "fail" => json!({"id": id, "error": "ArithmeticError: Example"}),
                _ => continue,
            };
            peer.send_value(codec, &response).unwrap();
        }
    }

    fn spawn_peers(mut listener: MemoryListener) -> (JoinHandle<()>, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let handle = tokio::spawn(async move {
            while let Some(peer) = listener.accept().await {
                serve_peer(peer, log.clone()).await;
            }
        });
        (handle, seen)
    }

    #[tokio::test]
    async fn test_add_round_trip() {
        let (connector, listener) = MemoryConnector::new();
        let (_peer, seen) = spawn_peers(listener);
        let portal = Portal::with_connector(options(), connector).unwrap();

        let sum = portal.call("add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(sum, json!(5));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], json!({"type": "init", "components": []}));
        assert_eq!(
            seen[1],
            json!({"type": "rpc", "id": 1, "name": "add", "args": [2, 3]})
        );
        assert_eq!(portal.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_ids_increase_and_responses_pair_out_of_order() {
        let (connector, mut listener) = MemoryConnector::new();
        let portal = Portal::with_connector(options(), connector).unwrap();

        let responder = tokio::spawn(async move {
            let codec = WireCodec::MessagePack;
            let mut peer = listener.accept().await.unwrap();
            peer.recv_value(codec).await.unwrap();

            let mut requests = Vec::new();
            for _ in 0..5 {
                requests.push(peer.recv_value(codec).await.unwrap());
            }
            let ids: Vec<u64> = requests.iter().map(|r| r["id"].as_u64().unwrap()).collect();
            assert_eq!(ids, vec![1, 2, 3, 4, 5]);

            for request in requests.iter().rev() {
                let n = request["args"][0].as_i64().unwrap();
                peer.send_value(codec, &json!({"id": request["id"], "result": n * 10}))
                    .unwrap();
            }
            peer
        });

        let calls = (0..5).map(|n| portal.call("scale", vec![json!(n)]));
        let results = futures::future::join_all(calls).await;
        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(n as i64 * 10));
        }
        let _peer = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_message() {
        let (connector, listener) = MemoryConnector::new();
        let (_peer, _seen) = spawn_peers(listener);
        let portal = Portal::with_connector(options(), connector).unwrap();

        match portal.call("fail", vec![]).await {
            Err(PortalError::Remote { message }) => assert_eq!(message, "ArithmeticError: Example"),
            other => panic!("Expected remote error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_builtins_are_local() {
        let (connector, listener) = MemoryConnector::new();
        let (_peer, seen) = spawn_peers(listener);
        let portal = Portal::with_connector(options(), connector).unwrap();
        portal.wait_for_state(ConnectionState::Open).await;

        assert_eq!(portal.invoke("url", vec![]).await.unwrap(), json!(URL));
        assert_eq!(portal.invoke("state", vec![]).await.unwrap(), json!("open"));
        assert_eq!(portal.invoke("connect", vec![]).await.unwrap(), Value::Null);
        assert!(matches!(
            portal.invoke("on", vec![json!("message")]).await,
            Err(PortalError::LocalMember { .. })
        ));
        assert!(matches!(
            portal.call("off", vec![]).await,
            Err(PortalError::LocalMember { .. })
        ));
        assert!(matches!(portal.member("once"), Member::BuiltIn(BuiltIn::Once)));

        assert_eq!(portal.invoke("ping", vec![]).await.unwrap(), json!("pong"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["name"], "ping");
        assert_eq!(seen[1]["id"], 1);
    }

    #[test]
    fn test_builtin_lookup() {
        for builtin in BuiltIn::ALL {
            assert_eq!(BuiltIn::lookup(builtin.name()), Some(builtin));
        }
        assert_eq!(BuiltIn::lookup("add"), None);
        assert_eq!(BuiltIn::lookup("Connect"), None);
        assert!(BuiltIn::Subscribe.takes_callback());
        assert!(!BuiltIn::Url.takes_callback());
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_connect_fails() {
        let (connector, listener) = MemoryConnector::new();
        listener.refuse_next(1);
        let portal = Portal::with_connector(options(), connector).unwrap();

        match portal.call("add", vec![json!(1), json!(2)]).await {
            Err(PortalError::NotConnected { url }) => assert_eq!(url, URL),
            other => panic!("Expected NotConnected, got: {:?}", other),
        }
        assert_eq!(portal.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_on_idle_portal_connects() {
        let (connector, listener) = MemoryConnector::new();
        let (_peer, _seen) = spawn_peers(listener);
        let portal =
            Portal::with_connector(options().with_auto_connect(false), connector).unwrap();
        assert_eq!(portal.state(), ConnectionState::Idle);

        assert_eq!(portal.call("ping", vec![]).await.unwrap(), json!("pong"));
        assert_eq!(portal.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_discards_record() {
        let (connector, listener) = MemoryConnector::new();
        let (_peer, _seen) = spawn_peers(listener);
        let portal = Portal::with_connector(
            options().with_call_timeout(Duration::from_millis(500)),
            connector,
        )
        .unwrap();

        match portal.call("never_answered", vec![]).await {
            Err(PortalError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(500)),
            other => panic!("Expected timeout, got: {:?}", other),
        }
        assert_eq!(portal.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_with_and_call_as() {
        let (connector, listener) = MemoryConnector::new();
        let (_peer, _seen) = spawn_peers(listener);
        let portal = Portal::with_connector(options(), connector).unwrap();

        assert_eq!(portal.call_with("add", (2, 3)).await.unwrap(), json!(5));
        assert_eq!(
            portal.call_with("echo", json!({"a": 1})).await.unwrap(),
            json!([{"a": 1}])
        );
        assert_eq!(portal.call_with("echo", ()).await.unwrap(), json!([]));

        let sum: i64 = portal.call_as("add", vec![json!(40), json!(2)]).await.unwrap();
        assert_eq!(sum, 42);

        let add = portal.method("add");
        assert_eq!(add.name(), "add");
        assert_eq!(add.call(vec![json!(1), json!(1)]).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_events_reach_listeners_and_notifications() {
        let (connector, mut listener) = MemoryConnector::new();
        let portal = Portal::with_connector(options(), connector).unwrap();
        let mut notifications = portal.subscribe();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        portal.on("message", move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        let once_count = Arc::new(AtomicU64::new(0));
        let counter = once_count.clone();
        portal.once("message", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let peer = listener.accept().await.unwrap();
        portal.wait_for_state(ConnectionState::Open).await;

        for text in ["hi", "again"] {
            peer.send_value(
                WireCodec::MessagePack,
                &json!({"type": "event", "name": "message", "payload": {"args": [text], "kwargs": {"room": "lobby"}}}),
            )
            .unwrap();
        }

        let mut events = Vec::new();
        while events.len() < 2 {
            if let Notification::Event(event) = notifications.recv().await.unwrap() {
                events.push(event);
            }
        }
        assert_eq!(events[0].arg(0), Some(&json!("hi")));
        assert_eq!(events[1].arg(0), Some(&json!("again")));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].kwarg("room"), Some(&json!("lobby")));
        assert_eq!(once_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_last_clone_closes_connection() {
        let (connector, mut listener) = MemoryConnector::new();
        let portal = Portal::with_connector(options(), connector).unwrap();
        let clone = portal.clone();

        let mut peer = listener.accept().await.unwrap();
        peer.recv().await.unwrap();

        drop(portal);
        assert_eq!(clone.state(), ConnectionState::Open);

        drop(clone);
        assert!(peer.recv().await.is_none());
    }

    #[test]
    fn test_unresolvable_url_fails_construction() {
        let result = Portal::new(PortalOptions::new().with_auto_connect(false));
        assert!(matches!(result, Err(PortalError::UnresolvableUrl { .. })));
    }
}

//! Connection supervisor.
//!
//! One background task per portal owns the connection. It opens the
//! connection, sends the `init` handshake, pumps frames in both directions,
//! and after any close waits out the reconnect delay before trying again.
//! Inbound responses settle the [`CallRegistry`]; inbound events go to the
//! [`EventBus`] and to notification subscribers.
//!
//! ```text
//! Idle --connect()--> Connecting --open+init--> Open
//!                        ^   |                    |
//!                        |   +--failure--+        | close / error
//!                        |               v        v
//!                        +--delay-------- Closed <+
//! ```
//!
//! # Thread Safety
//!
//! State transitions made by the task and by `connect()`/`shutdown()` are
//! serialized on the run lock. A task that has been told to stop never
//! touches shared state again, so a quick `shutdown()` + `connect()` cannot
//! have two tasks racing over the same portal.

use crate::codec::WireCodec;
use crate::config::{PendingCallPolicy, PortalConfig, PortalOptions, ReconnectPolicy};
use crate::events::{Event, EventBus};
use crate::protocol::{Inbound, Request};
use crate::registry::CallRegistry;
use crate::transport::{Connection, Connector};
use crate::{PortalError, Result};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a portal connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected, or shut down.
    Idle,
    /// An open attempt is in flight.
    Connecting,
    /// Handshake sent; calls go out immediately.
    Open,
    /// Last connection closed or failed; a reconnect may be scheduled.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle and event notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A connection opened and the handshake was sent.
    Connected,
    /// The connection closed or an open attempt failed.
    Disconnected,
    /// The peer pushed an event.
    Event(Event),
}

/// How a single connection ended.
enum Session {
    /// The supervisor was told to stop.
    Stopped,
    /// The connection closed on its own. `opened` is false if it closed
    /// before the handshake went out.
    Ended { opened: bool },
}

pub(crate) struct Supervisor {
    url: String,
    connector: Arc<dyn Connector>,
    codec: WireCodec,
    reconnect: ReconnectPolicy,
    pending_policy: PendingCallPolicy,
    registry: Arc<CallRegistry>,
    bus: Arc<EventBus>,
    notifications: broadcast::Sender<Notification>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Stop signal of the running task, if any.
    run: Mutex<Option<watch::Sender<bool>>>,
    wake: Notify,
}

impl Supervisor {
    pub(crate) fn new(
        url: String,
        connector: Arc<dyn Connector>,
        options: &PortalOptions,
        registry: Arc<CallRegistry>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(PortalConfig::NOTIFICATION_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Idle);

        Arc::new(Self {
            url,
            connector,
            codec: options.codec,
            reconnect: options.reconnect.clone(),
            pending_policy: options.pending,
            registry,
            bus,
            notifications,
            state,
            outbound: Mutex::new(None),
            run: Mutex::new(None),
            wake: Notify::new(),
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Start the supervisor, or cut a pending reconnect delay short.
    ///
    /// No-op while connecting or open. Outside a Tokio runtime nothing can
    /// be spawned, so the portal stays idle.
    pub(crate) fn connect(self: &Arc<Self>) {
        let mut run = self.lock_run();

        if run.is_some() {
            match self.state() {
                ConnectionState::Closed => {
                    debug!("Reconnect to {} requested", self.url);
                    self.wake.notify_one();
                }
                state => debug!("connect() ignored for {}: already {}", self.url, state),
            }
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "connect() called outside a Tokio runtime; portal {} stays idle",
                self.url
            );
            return;
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        self.set_state(ConnectionState::Connecting);
        runtime.spawn(self.clone().run(stop_rx));
        *run = Some(stop_tx);
    }

    /// Stop the task, close the connection and return to `Idle`.
    ///
    /// Outstanding calls are left alone.
    pub(crate) fn shutdown(&self) {
        let mut run = self.lock_run();
        if let Some(stop) = run.take() {
            stop.send_replace(true);
            info!("Portal {} shut down", self.url);
        }
        self.lock_outbound().take();
        self.set_state(ConnectionState::Idle);
    }

    /// Queue an envelope on the open connection.
    pub(crate) fn send(&self, request: &Request) -> Result<()> {
        let frame = self.codec.encode(request)?;
        let sent = match self.lock_outbound().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            return Err(PortalError::NotConnected {
                url: self.url.clone(),
            });
        }
        Ok(())
    }

    /// Wait for any in-flight attempt to finish and report where it landed.
    pub(crate) async fn settled_state(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| *state != ConnectionState::Connecting).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        loop {
            if !self.transition(&stop, ConnectionState::Connecting) {
                return;
            }
            debug!("Opening connection to {}", self.url);

            let opened = tokio::select! {
                opened = self.connector.open(&self.url) => opened,
                _ = stop.changed() => return,
            };

            let was_open = match opened {
                Ok(connection) => match self.serve(connection, &mut stop).await {
                    Session::Stopped => return,
                    Session::Ended { opened } => opened,
                },
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.url, e);
                    false
                }
            };

            if !self.close_session(&stop) {
                return;
            }

            let _ = self.notifications.send(Notification::Disconnected);
            if self.pending_policy == PendingCallPolicy::FailOnDisconnect {
                let failed = self.registry.reject_all();
                if failed > 0 {
                    warn!("Failed {} pending call(s) after losing {}", failed, self.url);
                }
            }

            if was_open {
                failures = 0;
            } else {
                failures += 1;
            }

            let Some(delay) = self.reconnect.delay_for(failures.saturating_sub(1)) else {
                error!(
                    "Giving up on {} after {} consecutive failed attempts",
                    self.url, failures
                );
                self.retire(&stop);
                return;
            };

            info!("Reconnecting to {} in {:?}", self.url, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => debug!("Reconnect delay for {} cut short", self.url),
                _ = stop.changed() => return,
            }
        }
    }

    /// Handshake and pump one connection until it closes or we are stopped.
    async fn serve(&self, connection: Connection, stop: &mut watch::Receiver<bool>) -> Session {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let sent = match self.codec.encode(&Request::init()) {
            Ok(init) => sink.send(init).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Handshake with {} failed: {}", self.url, e);
            return Session::Ended { opened: false };
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.open_session(stop, tx) {
            let _ = sink.close().await;
            return Session::Stopped;
        }
        info!("Connected to {}", self.url);
        let _ = self.notifications.send(Notification::Connected);

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        return Session::Ended { opened: true };
                    };
                    if let Err(e) = sink.send(frame).await {
                        warn!("Write to {} failed: {}", self.url, e);
                        return Session::Ended { opened: true };
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(bytes)) => self.handle_frame(&bytes),
                    Some(Err(e)) => {
                        warn!("Connection to {} failed: {}", self.url, e);
                        return Session::Ended { opened: true };
                    }
                    None => {
                        info!("Connection to {} closed", self.url);
                        return Session::Ended { opened: true };
                    }
                },
                _ = stop.changed() => {
                    let _ = sink.close().await;
                    return Session::Stopped;
                }
            }
        }
    }

    fn handle_frame(&self, bytes: &[u8]) {
        let value: Value = match self.codec.decode(bytes) {
            Ok(value) => value,
            Err(e) => {
                debug!("Dropping undecodable frame from {}: {}", self.url, e);
                return;
            }
        };

        match Inbound::from_value(value) {
            Some(Inbound::Response { id, outcome }) => {
                self.registry.settle(id, outcome.map_err(PortalError::remote));
            }
            Some(Inbound::Event(event)) => {
                let _ = self.notifications.send(Notification::Event(event.clone()));
                let delivered = self.bus.emit_event(&event);
                debug!("Event '{}' delivered to {} listener(s)", event.name, delivered);
            }
            None => debug!("Dropping unrecognized envelope from {}", self.url),
        }
    }

    /// Apply a state change unless this task has been stopped.
    fn transition(&self, stop: &watch::Receiver<bool>, next: ConnectionState) -> bool {
        let _run = self.lock_run();
        if *stop.borrow() {
            return false;
        }
        self.set_state(next);
        true
    }

    fn open_session(
        &self,
        stop: &watch::Receiver<bool>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> bool {
        let _run = self.lock_run();
        if *stop.borrow() {
            return false;
        }
        *self.lock_outbound() = Some(outbound);
        self.set_state(ConnectionState::Open);
        true
    }

    fn close_session(&self, stop: &watch::Receiver<bool>) -> bool {
        let _run = self.lock_run();
        if *stop.borrow() {
            return false;
        }
        self.lock_outbound().take();
        // Only a connect() made during this closed period may cut the delay.
        let _ = self.wake.notified().now_or_never();
        self.set_state(ConnectionState::Closed);
        true
    }

    /// Drop our own run handle so a later `connect()` starts a fresh task.
    fn retire(&self, stop: &watch::Receiver<bool>) {
        let mut run = self.lock_run();
        if !*stop.borrow() {
            run.take();
            self.set_state(ConnectionState::Closed);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("Portal {}: {} -> {}", self.url, state, next);
            *state = next;
            true
        });
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<u8>>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

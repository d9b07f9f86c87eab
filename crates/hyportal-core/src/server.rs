//! WebSocket peer server.
//!
//! The other end of a portal: accepts WebSocket connections on any path,
//! answers `rpc` envelopes through an [`RpcDispatch`] implementation and
//! broadcasts events to every connected client.
//!
//! # Thread Safety
//!
//! Each connection runs in its own spawned task. Events are encoded once and
//! fanned out through a `broadcast` channel; a client that falls behind loses
//! the oldest events rather than stalling the others.

use crate::codec::WireCodec;
use crate::config::PortalConfig;
use crate::protocol::{EventMessage, Request, RpcResponse};
use crate::{PortalError, Result};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Handle to a running peer server. Dropping shuts down the server.
pub struct PortalServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    codec: WireCodec,
    events: broadcast::Sender<Vec<u8>>,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Bumped to make every live connection close.
    disconnect_tx: watch::Sender<u64>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PortalServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL clients can dial, on the default portal path.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, PortalConfig::DEFAULT_WS_PATH)
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Push an event to every connected client. Returns how many clients
    /// it was queued for.
    pub fn emit(
        &self,
        name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<usize> {
        let message = EventMessage::new(name, args, kwargs);
        let frame = self.codec.encode(&message)?;
        let receivers = self.events.send(frame).unwrap_or(0);
        debug!("Event '{}' queued for {} client(s)", message.name, receivers);
        Ok(receivers)
    }

    /// Close every live connection. The server keeps accepting new ones.
    pub fn disconnect_all(&self) {
        self.disconnect_tx.send_modify(|generation| *generation += 1);
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and closes all active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.disconnect_all();
    }
}

impl Drop for PortalServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PortalServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalServerHandle")
            .field("addr", &self.addr)
            .field("codec", &self.codec)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Answers remote procedure calls for the peer server.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    /// Run procedure `name`. An `Err` is sent back as the call's error
    /// message.
    async fn dispatch(&self, name: &str, args: Vec<Value>) -> Result<Value>;
}

type Handler = Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Table of named functions exposed to portal clients.
#[derive(Default)]
pub struct ExposedFunctions {
    handlers: HashMap<String, Handler>,
}

impl ExposedFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `handler` under `name`, replacing any earlier entry.
    pub fn expose<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Box::new(move |args| Box::pin(handler(args))));
        self
    }

    /// Exposed names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ExposedFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposedFunctions")
            .field("names", &self.names())
            .finish()
    }
}

#[async_trait::async_trait]
impl RpcDispatch for ExposedFunctions {
    async fn dispatch(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match self.handlers.get(name) {
            Some(handler) => handler(args).await,
            None => Err(PortalError::Other(format!("Function '{}' is not exposed", name))),
        }
    }
}

/// Peer server that portal clients connect to.
pub struct PortalServer;

impl PortalServer {
    /// Start the server on a random local port.
    pub async fn start<D: RpcDispatch>(dispatch: Arc<D>, codec: WireCodec) -> Result<PortalServerHandle> {
        Self::bind("127.0.0.1:0", dispatch, codec).await
    }

    /// Start the server on `addr`.
    ///
    /// Returns a handle that can be used to emit events and shut down the
    /// server. The server runs in background tokio tasks.
    pub async fn bind<D: RpcDispatch>(
        addr: &str,
        dispatch: Arc<D>,
        codec: WireCodec,
    ) -> Result<PortalServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Portal server listening on {} ({})", addr, codec);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (disconnect_tx, disconnect_rx) = watch::channel(0u64);
        let (events, _) = broadcast::channel(PortalConfig::SERVER_EVENT_CAPACITY);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            codec,
            events.clone(),
            shutdown_rx,
            disconnect_rx,
            active_connections.clone(),
        ));

        Ok(PortalServerHandle {
            addr,
            port,
            codec,
            events,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            disconnect_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: RpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        codec: WireCodec,
        events: broadcast::Sender<Vec<u8>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        disconnect_rx: watch::Receiver<u64>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Portal server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= PortalConfig::MAX_SERVER_CONNECTIONS {
                                warn!(
                                    "Rejecting portal connection from {}: at max capacity ({})",
                                    peer_addr,
                                    PortalConfig::MAX_SERVER_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let events = events.subscribe();
                            let mut disconnect = disconnect_rx.clone();
                            disconnect.borrow_and_update();

                            tokio::spawn(async move {
                                debug!("Portal connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*dispatch, codec, events, &mut disconnect).await {
                                    debug!("Portal connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Portal server accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: RpcDispatch>(
        stream: TcpStream,
        dispatch: &D,
        codec: WireCodec,
        mut events: broadcast::Receiver<Vec<u8>>,
        disconnect: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        let socket = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut stream) = socket.split();
        let mut initialized = false;

        loop {
            tokio::select! {
                message = stream.next() => {
                    let frame = match message {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    if let Some(response) = Self::process_frame(&frame, dispatch, codec, &mut initialized).await {
                        sink.send(Message::Binary(codec.encode(&response)?)).await?;
                    }
                }
                event = events.recv() => match event {
                    Ok(frame) => sink.send(Message::Binary(frame)).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Portal client fell behind; dropped {} event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = disconnect.changed() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn process_frame<D: RpcDispatch>(
        frame: &[u8],
        dispatch: &D,
        codec: WireCodec,
        initialized: &mut bool,
    ) -> Option<RpcResponse> {
        let value: Value = match codec.decode(frame) {
            Ok(value) => value,
            Err(e) => {
                debug!("Dropping undecodable frame: {}", e);
                return None;
            }
        };

        let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
        match kind.as_deref() {
            Some("init") => {
                *initialized = true;
                debug!("Portal client initialized");
                None
            }
            Some("rpc") => {
                if !*initialized {
                    warn!("Portal client sent rpc before init");
                    *initialized = true;
                }

                let (id, name, args) = match serde_json::from_value::<Request>(value) {
                    Ok(Request::Rpc { id, name, args }) => (id, name, args),
                    Ok(Request::Init { .. }) => return None,
                    Err(e) => {
                        warn!("Malformed rpc envelope: {}", e);
                        return None;
                    }
                };

                debug!("Dispatching call {} '{}'", id, name);
                Some(match dispatch.dispatch(&name, args).await {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(e) => RpcResponse::error(id, error_message(e)),
                })
            }
            other => {
                warn!("Ignoring envelope of unknown type {:?}", other);
                None
            }
        }
    }
}

/// Message sent back for a failed call. Remote errors pass through verbatim.
fn error_message(err: PortalError) -> String {
    match err {
        PortalError::Remote { message } => message,
        PortalError::Other(message) => message,
        other => other.to_string(),
    }
}

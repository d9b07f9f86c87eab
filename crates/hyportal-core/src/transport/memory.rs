//! In-process transport.
//!
//! [`MemoryConnector`] hands every opened connection to a [`MemoryListener`]
//! as a [`MemoryPeer`], which plays the server side: it reads the frames the
//! portal sends and pushes frames back. Useful for driving the supervisor
//! deterministically under a paused clock.

use super::{Connection, Connector};
use crate::codec::WireCodec;
use crate::{PortalError, Result};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicUsize,
    refuse: AtomicUsize,
}

/// Connector whose connections terminate in a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    counters: Arc<Counters>,
}

/// Receives the far end of every connection opened by the paired connector.
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    counters: Arc<Counters>,
}

/// Server side of one in-memory connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    to_client: mpsc::UnboundedSender<Result<Vec<u8>>>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryConnector {
    /// Create a connected connector/listener pair.
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded();
        let counters = Arc::new(Counters::default());
        (
            Self {
                accept_tx,
                counters: counters.clone(),
            },
            MemoryListener {
                accept_rx,
                counters,
            },
        )
    }

    /// Claim one refusal token, if any are left.
    fn take_refusal(&self) -> bool {
        self.counters
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<Connection> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);

        if self.take_refusal() {
            debug!("Refusing in-memory connection to {}", url);
            return Err(PortalError::Transport {
                message: format!("connection to {} refused", url),
            });
        }

        let (client_tx, from_client) = mpsc::unbounded::<Vec<u8>>();
        let (to_client, client_rx) = mpsc::unbounded::<Result<Vec<u8>>>();

        let peer = MemoryPeer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx
            .unbounded_send(peer)
            .map_err(|_| PortalError::Transport {
                message: "in-memory listener was dropped".to_string(),
            })?;

        let sink = client_tx.sink_map_err(|e| PortalError::Transport {
            message: e.to_string(),
        });
        Ok(Connection::new(Box::pin(sink), Box::pin(client_rx)))
    }
}

impl MemoryListener {
    /// Wait for the next connection. Returns `None` once every connector
    /// clone has been dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.next().await
    }

    /// Take an already opened connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Make the next `count` open attempts fail.
    pub fn refuse_next(&self, count: usize) {
        self.counters.refuse.store(count, Ordering::SeqCst);
    }

    /// Open attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.counters.attempts.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    /// URL the portal dialed.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next raw frame from the portal, or `None` once it closed its side.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.next().await
    }

    /// Next frame from the portal decoded as a dynamic value. Frames that do
    /// not decode are skipped.
    pub async fn recv_value(&mut self, codec: WireCodec) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            match codec.decode(&frame) {
                Ok(value) => return Some(value),
                Err(e) => debug!("Skipping undecodable frame from portal: {}", e),
            }
        }
    }

    /// Push a raw frame to the portal. Returns `false` if it is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.to_client.unbounded_send(Ok(frame)).is_ok()
    }

    /// Encode `value` and push it to the portal.
    pub fn send_value<T: Serialize + ?Sized>(&self, codec: WireCodec, value: &T) -> Result<bool> {
        Ok(self.send(codec.encode(value)?))
    }

    /// Surface a transport error on the portal's inbound stream.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.to_client
            .unbounded_send(Err(PortalError::Transport {
                message: message.into(),
            }))
            .is_ok()
    }

    /// Close the connection from the server side.
    pub fn close(self) {
        debug!("Closing in-memory connection to {}", self.url);
    }
}

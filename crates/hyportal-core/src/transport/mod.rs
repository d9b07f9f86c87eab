//! Frame transports for the portal connection.
//!
//! The supervisor only sees a [`Connection`]: a sink of outbound frames and a
//! stream of inbound frames. Where those frames travel is decided by the
//! [`Connector`] handed to the portal.
//!
//! # Architecture
//!
//! - **ws**: WebSocket connector used in production
//! - **memory**: In-process connector whose far end is driven by test code

pub mod memory;
pub mod ws;

use crate::{PortalError, Result};
use futures::{Sink, Stream};
use std::pin::Pin;

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use ws::WsConnector;

/// Outbound half of a connection. Each item is one encoded frame.
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = PortalError> + Send>>;

/// Inbound half of a connection. The stream ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// One open, message-framed connection.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to a resolved portal URL.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection. An `Err` counts as a failed attempt and is
    /// followed by the reconnect schedule.
    async fn open(&self, url: &str) -> Result<Connection>;
}

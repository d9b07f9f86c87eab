//! WebSocket connector.
//!
//! Frames are sent as binary messages. Inbound binary and text messages are
//! both accepted; control messages are handled by tungstenite and skipped here.

use super::{Connection, Connector};
use crate::{PortalError, Result};
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Connector that dials `ws://` and `wss://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Connection> {
        let (socket, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(
            "WebSocket handshake with {} completed ({})",
            url,
            response.status()
        );
        Ok(framed(socket))
    }
}

/// Split an established WebSocket into a frame sink and stream.
pub(crate) fn framed<S>(socket: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();

    let sink = sink.with(|frame: Vec<u8>| future::ready(Ok::<_, PortalError>(Message::Binary(frame))));

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Binary(data)) => Some(Ok(data)),
            Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
            Ok(Message::Close(frame)) => {
                debug!("Peer sent close frame: {:?}", frame);
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(PortalError::from(e))),
        })
    });

    Connection::new(Box::pin(sink), Box::pin(stream))
}

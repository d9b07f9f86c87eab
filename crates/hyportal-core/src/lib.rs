//! # hyportal
//!
//! Bidirectional RPC and event bridge over one persistent WebSocket.
//!
//! A [`Portal`] turns remote procedures into async calls and routes events
//! pushed by the peer to local listeners. The connection is supervised: it is
//! opened on demand, reconnected after every close, and shared by all clones
//! of the portal.
//!
//! ## Architecture
//!
//! - [`protocol`] / [`codec`]: envelope types and their MessagePack or JSON encoding
//! - [`registry`]: outstanding calls keyed by correlation id
//! - [`events`]: named event fan-out
//! - [`transport`]: WebSocket and in-memory connectors
//! - [`portal`]: the public client, with built-in members resolved locally
//! - [`server`]: a peer server for the other end of the bridge
//!
//! ## Example
//!
//! ```no_run
//! use hyportal::{HostContext, Portal, PortalOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> hyportal::Result<()> {
//!     let portal = Portal::new(
//!         PortalOptions::new().with_host(HostContext::new("localhost:8000", false)),
//!     )?;
//!
//!     portal.on("message", |event| println!("message: {:?}", event.args));
//!     let sum = portal.call("add", vec![json!(2), json!(3)]).await?;
//!     println!("2 + 3 = {}", sum);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod portal;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod server;
mod supervisor;
pub mod transport;
pub mod url;

// Re-export commonly used types
pub use codec::WireCodec;
pub use config::{PendingCallPolicy, PortalConfig, PortalOptions, ReconnectPolicy};
pub use error::{PortalError, Result};
pub use events::{Event, EventBus, ListenerId};
pub use portal::{BuiltIn, Member, Portal, RemoteMethod};
pub use retry::RetryConfig;
pub use server::{ExposedFunctions, PortalServer, PortalServerHandle, RpcDispatch};
pub use supervisor::{ConnectionState, Notification};
pub use transport::{Connector, MemoryConnector, WsConnector};
pub use crate::url::{resolve_url, HostContext};

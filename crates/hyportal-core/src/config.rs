//! Centralized configuration for the portal.
//!
//! Fixed protocol constants live on [`PortalConfig`]; per-instance settings are
//! carried by [`PortalOptions`].

use crate::codec::WireCodec;
use crate::retry::RetryConfig;
use crate::url::HostContext;
use std::time::Duration;

/// Protocol and runtime constants.
pub struct PortalConfig;

impl PortalConfig {
    /// Path used when no URL is configured.
    pub const DEFAULT_WS_PATH: &'static str = "/_hy/ws";
    /// Delay between a closed connection and the next attempt.
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);
    /// Buffered notifications per subscriber before the oldest are dropped.
    pub const NOTIFICATION_CAPACITY: usize = 64;
    /// Largest frame accepted from the wire.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Concurrent clients accepted by the peer server.
    pub const MAX_SERVER_CONNECTIONS: usize = 64;
    /// Buffered outbound events per server connection.
    pub const SERVER_EVENT_CAPACITY: usize = 256;
}

/// How the supervisor schedules reconnection after a close.
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    /// Same delay every time, forever.
    Fixed(Duration),
    /// Exponential backoff with optional jitter. `max_attempts` of consecutive
    /// failures stops the supervisor until `connect()` is called again.
    Backoff(RetryConfig),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(PortalConfig::RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed count of consecutive
    /// failures), or `None` once the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Fixed(delay) => Some(*delay),
            ReconnectPolicy::Backoff(config) => {
                if attempt >= config.max_attempts {
                    None
                } else {
                    Some(config.calculate_delay(attempt))
                }
            }
        }
    }
}

/// What happens to outstanding calls when the connection drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PendingCallPolicy {
    /// Leave them pending; a response after reconnect still settles them.
    #[default]
    KeepPending,
    /// Reject all of them with `ConnectionLost`.
    FailOnDisconnect,
}

/// Options for a single portal instance.
#[derive(Debug, Clone)]
pub struct PortalOptions {
    /// Configured URL or path. See [`crate::url::resolve_url`].
    pub url: Option<String>,
    /// Page the portal is embedded in, if any.
    pub host: Option<HostContext>,
    /// Payload encoding.
    pub codec: WireCodec,
    /// Reconnect scheduling.
    pub reconnect: ReconnectPolicy,
    /// Outstanding call handling on disconnect.
    pub pending: PendingCallPolicy,
    /// Upper bound on a single remote call.
    pub call_timeout: Option<Duration>,
    /// Connect as soon as the portal is created.
    pub auto_connect: bool,
}

impl Default for PortalOptions {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            codec: WireCodec::default(),
            reconnect: ReconnectPolicy::default(),
            pending: PendingCallPolicy::default(),
            call_timeout: None,
            auto_connect: true,
        }
    }
}

impl PortalOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configured URL or path.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the host context used to resolve relative paths.
    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the payload encoding.
    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the pending call policy.
    pub fn with_pending_policy(mut self, policy: PendingCallPolicy) -> Self {
        self.pending = policy;
        self
    }

    /// Bound every remote call by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Enable or disable connecting at construction.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

//! Portal URL resolution.
//!
//! The configured URL may be absolute (`ws`, `wss`, `http`, `https`) or a bare
//! path that is resolved against the page hosting the portal. The hosting page
//! is passed explicitly as a [`HostContext`].

use crate::config::PortalConfig;
use crate::{PortalError, Result};

/// Scheme and authority of the page the portal runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Page was served over https.
    pub secure: bool,
    /// `host[:port]` of the page.
    pub host: String,
}

impl HostContext {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            secure,
            host: host.into(),
        }
    }

    /// WebSocket scheme matching the page scheme.
    pub fn ws_scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }
}

/// Resolve the WebSocket URL for a portal.
///
/// - `http(s)://...` is rewritten to `ws(s)://...` and used as-is.
/// - `ws(s)://...` is used as-is.
/// - Anything else is a path, prefixed with `/` if needed, on the host page.
/// - No URL (or an empty one) means [`PortalConfig::DEFAULT_WS_PATH`] on the host page.
///
/// Paths need a host context; without one this fails with `UnresolvableUrl`.
pub fn resolve_url(configured: Option<&str>, host: Option<&HostContext>) -> Result<String> {
    let configured = configured.filter(|url| !url.is_empty());

    let resolved = match configured {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            format!("ws{}", &url["http".len()..])
        }
        Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => url.to_string(),
        other => {
            let host = host.ok_or_else(|| PortalError::UnresolvableUrl {
                reason: match other {
                    Some(path) => format!("path '{}' needs a host context", path),
                    None => "no URL configured and no host context".to_string(),
                },
            })?;

            let path = match other {
                Some(path) if path.starts_with('/') => path.to_string(),
                Some(path) => format!("/{}", path),
                None => PortalConfig::DEFAULT_WS_PATH.to_string(),
            };

            format!("{}://{}{}", host.ws_scheme(), host.host, path)
        }
    };

    ::url::Url::parse(&resolved).map_err(|e| PortalError::InvalidUrl {
        url: resolved.clone(),
        message: e.to_string(),
    })?;

    Ok(resolved)
}

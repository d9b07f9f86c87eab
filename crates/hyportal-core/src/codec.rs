//! Payload encoding for envelopes.
//!
//! Each frame on the wire is exactly one encoded value. MessagePack is the
//! default; JSON is available for peers that speak text.

use crate::config::PortalConfig;
use crate::{PortalError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encoder/decoder for a single frame payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireCodec {
    /// MessagePack with named struct fields (maps keyed by field name).
    #[default]
    MessagePack,
    /// UTF-8 JSON.
    Json,
}

impl WireCodec {
    /// Encode a value into a frame payload.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireCodec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
            WireCodec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decode a frame payload.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() > PortalConfig::MAX_FRAME_SIZE {
            return Err(PortalError::Codec {
                message: format!(
                    "frame size {} exceeds maximum {}",
                    bytes.len(),
                    PortalConfig::MAX_FRAME_SIZE
                ),
            });
        }

        match self {
            WireCodec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
            WireCodec::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WireCodec::MessagePack => "msgpack",
            WireCodec::Json => "json",
        }
    }
}

impl std::fmt::Display for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Envelope types exchanged over the portal connection.
//!
//! Every frame carries one envelope, encoded with the connection's
//! [`WireCodec`](crate::codec::WireCodec):
//!
//! ```text
//! client -> peer   {type:"init", components:[]}
//! client -> peer   {type:"rpc", id, name, args}
//! peer -> client   {id, result} | {id, error}
//! peer -> client   {type:"event", name, payload:{args, kwargs}}
//! ```

use crate::events::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope sent by the client side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// First frame of every connection.
    Init {
        #[serde(default)]
        components: Vec<Value>,
    },
    /// Remote procedure invocation.
    Rpc {
        id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl Request {
    /// The handshake frame. The component list is always empty.
    pub fn init() -> Self {
        Request::Init {
            components: Vec::new(),
        }
    }

    /// Create a remote procedure request.
    pub fn rpc(id: u64, name: impl Into<String>, args: Vec<Value>) -> Self {
        Request::Rpc {
            id,
            name: name.into(),
            args,
        }
    }
}

/// Response to an [`Request::Rpc`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Create a success response. A `null` result is still sent.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Positional and keyword arguments of an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Event pushed by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "event")]
pub struct EventMessage {
    pub name: String,
    #[serde(default)]
    pub payload: EventPayload,
}

impl EventMessage {
    pub fn new(name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            payload: EventPayload { args, kwargs },
        }
    }
}

/// Classified inbound envelope on the client side.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Settles the call with this id.
    Response {
        id: u64,
        outcome: std::result::Result<Value, String>,
    },
    /// Fans out to listeners.
    Event(Event),
}

impl Inbound {
    /// Classify a decoded frame. Returns `None` for anything unrecognized.
    ///
    /// A response is a map with a positive integer `id` and a `result` or
    /// `error` key. An `error` that is null, `false`, `""` or `0` counts as
    /// no error at all. An event is a map with
    /// `type == "event"` and a string `name`; missing `args`/`kwargs` default
    /// to empty.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            return None;
        };

        let id = map.get("id").and_then(Value::as_u64).filter(|id| *id > 0);
        if let Some(id) = id {
            if map.contains_key("result") || map.contains_key("error") {
                let outcome = match map.remove("error").filter(|error| !is_blank(error)) {
                    None => Ok(map.remove("result").unwrap_or(Value::Null)),
                    Some(Value::String(message)) => Err(message),
                    Some(other) => Err(other.to_string()),
                };
                return Some(Inbound::Response { id, outcome });
            }
        }

        if map.get("type").and_then(Value::as_str) != Some("event") {
            return None;
        }

        let name = match map.remove("name") {
            Some(Value::String(name)) => name,
            _ => return None,
        };

        let (args, kwargs) = match map.remove("payload") {
            Some(Value::Object(mut payload)) => {
                let args = match payload.remove("args") {
                    Some(Value::Array(args)) => args,
                    _ => Vec::new(),
                };
                let kwargs = match payload.remove("kwargs") {
                    Some(Value::Object(kwargs)) => kwargs,
                    _ => Map::new(),
                };
                (args, kwargs)
            }
            _ => (Vec::new(), Map::new()),
        };

        Some(Inbound::Event(Event { name, args, kwargs }))
    }
}

/// Error values peers send to mean "no error".
fn is_blank(error: &Value) -> bool {
    match error {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::String(message) => message.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

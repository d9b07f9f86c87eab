//! Outstanding remote calls keyed by correlation id.
//!
//! Each registered id owns a oneshot reply channel. Settling removes the
//! record, so a second response for the same id finds nothing and is ignored.
//!
//! # Thread Safety
//!
//! The map is behind a `std::sync::Mutex` that is never held across an
//! `.await`, so registration and settlement can happen from any task.

use crate::{PortalError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type ReplySender = oneshot::Sender<Result<Value>>;

/// Future for the settlement of one registered call.
///
/// Resolves to `ConnectionLost` if the registry is dropped or the record is
/// discarded before a response arrives.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    /// Correlation id of the call.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(PortalError::ConnectionLost)))
    }
}

/// Registry of calls waiting for a response.
#[derive(Debug, Default)]
pub struct CallRegistry {
    pending: Mutex<HashMap<u64, ReplySender>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a call before its request is sent.
    pub fn register(&self, id: u64) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(id, tx).is_some() {
            warn!("Call id {} registered twice; the earlier caller will see ConnectionLost", id);
        }
        PendingReply { id, rx }
    }

    /// Resolve the call with a value. Returns `false` if the id is unknown.
    pub fn resolve(&self, id: u64, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    /// Reject the call with a remote error message. Returns `false` if the id
    /// is unknown.
    pub fn reject(&self, id: u64, message: impl Into<String>) -> bool {
        self.settle(id, Err(PortalError::remote(message)))
    }

    /// Remove the record for `id` and hand it `outcome`.
    pub fn settle(&self, id: u64, outcome: Result<Value>) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            debug!("Ignoring response for unknown call id {}", id);
            return false;
        };

        if tx.send(outcome).is_err() {
            debug!("Caller for call id {} is no longer waiting", id);
        }
        true
    }

    /// Drop the record for `id` without settling it.
    pub fn discard(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every outstanding call with `ConnectionLost`. Returns how many were failed.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(PortalError::ConnectionLost));
        }
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `id` is still waiting for a response.
    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ReplySender>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

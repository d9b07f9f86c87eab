//! Named event fan-out to local listeners.
//!
//! Listeners are grouped by event name and called in registration order.
//! Emission works on a snapshot of the group, so listeners added or removed
//! by a callback only see the effect on the next emission.
//!
//! # Thread Safety
//!
//! The listener map is guarded by a `std::sync::Mutex`; callbacks run with the
//! lock released so they may call back into the bus.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
            kwargs,
        }
    }

    /// Positional argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument `key`.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::on`] and [`EventBus::once`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    callback: Listener,
    once: bool,
    /// Claimed by the first emission that delivers a `once` subscription.
    fired: AtomicBool,
}

/// Listener registry keyed by event name.
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .lock()
            .iter()
            .map(|(name, subs)| (name.clone(), subs.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every `name` event.
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(name.into(), Arc::new(callback), false)
    }

    /// Register `callback` for the next `name` event only.
    ///
    /// The subscription is claimed and removed before the callback runs, so it
    /// fires at most once even when emissions race.
    pub fn once<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(name.into(), Arc::new(callback), true)
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(subs) = listeners.get_mut(name) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        let removed = subs.len() != before;

        if subs.is_empty() {
            listeners.remove(name);
        }
        removed
    }

    /// Deliver an event built from its parts. Returns the number of callbacks
    /// that completed.
    pub fn emit(&self, name: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> usize {
        self.emit_event(&Event::new(name, args, kwargs))
    }

    /// Deliver `event` to every listener registered for its name.
    ///
    /// A panicking callback is logged and skipped; later callbacks still run.
    pub fn emit_event(&self, event: &Event) -> usize {
        let snapshot = match self.lock().get(&event.name) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for sub in snapshot {
            if sub.once {
                if sub.fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                self.off(&event.name, sub.id);
            }

            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        "Listener for event '{}' panicked: {}",
                        event.name,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        debug!("Event '{}' delivered to {} listener(s)", event.name, delivered);
        delivered
    }

    /// Number of subscriptions for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, Vec::len)
    }

    /// Names that currently have at least one subscription.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn subscribe(&self, name: String, callback: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscription {
            id,
            callback,
            once,
            fired: AtomicBool::new(false),
        });
        self.lock().entry(name).or_default().push(sub);
        id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Subscription>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

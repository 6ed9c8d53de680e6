//! Emitter/receiver event model
//!
//! Emitters declare the names of the events they raise. Receivers subscribe
//! a callback to one name (or to all of them); a callback returning `false`
//! is unsubscribed. Callbacks run synchronously on the emitting task, so
//! anything slow should subscribe through [`Emitter::subscribe_channel`]
//! and consume events on its own task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Identifier of one subscription
pub type ReceiverId = u64;

/// A structured event delivered to a receiver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Name of the emitter that raised the event
    pub emitter: String,
    /// Subscription the event is delivered to
    pub receiver: ReceiverId,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Emitter {emitter} does not declare event {name}")]
    UnknownEvent { emitter: String, name: String },
}

type Callback = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscription {
    id: ReceiverId,
    /// `None` subscribes to every declared event
    name: Option<String>,
    callback: Callback,
}

struct EmitterInner {
    name: String,
    events: Vec<String>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

/// Source of events. Clones share subscriptions.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("name", &self.inner.name)
            .field("events", &self.inner.events)
            .finish()
    }
}

impl Emitter {
    pub fn new<I, S>(name: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(EmitterInner {
                name: name.into(),
                events: events.into_iter().map(Into::into).collect(),
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declared event names
    pub fn events(&self) -> &[String] {
        &self.inner.events
    }

    pub fn declares(&self, name: &str) -> bool {
        self.inner.events.iter().any(|e| e == name)
    }

    /// Subscribes `callback` to the event `name`.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> Result<ReceiverId, EventError>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        if !self.declares(name) {
            return Err(EventError::UnknownEvent {
                emitter: self.inner.name.clone(),
                name: name.to_string(),
            });
        }
        Ok(self.add(Some(name.to_string()), Arc::new(callback)))
    }

    /// Subscribes `callback` to every declared event.
    pub fn subscribe_all<F>(&self, callback: F) -> ReceiverId
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.add(None, Arc::new(callback))
    }

    /// Forwards every event into a bounded channel.
    ///
    /// Events are dropped while the channel is full; the subscription ends
    /// once the receiver is dropped.
    pub fn subscribe_channel(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe_all(move |event| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = %event.name, "Event channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        rx
    }

    pub fn unsubscribe(&self, id: ReceiverId) {
        self.subscriptions().retain(|s| s.id != id);
    }

    pub fn receiver_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// A receiver that panicked must not silence the others.
    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, name: Option<String>, callback: Callback) -> ReceiverId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions().push(Subscription { id, name, callback });
        id
    }

    /// Delivers the event `name` to its receivers.
    pub fn emit(&self, name: &str, args: Value) {
        if !self.declares(name) {
            warn!(emitter = %self.inner.name, event = name, "Emitting undeclared event");
            return;
        }

        let targets: Vec<(ReceiverId, Callback)> = self
            .subscriptions()
            .iter()
            .filter(|s| s.name.as_deref().map_or(true, |n| n == name))
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        trace!(emitter = %self.inner.name, event = name, receivers = targets.len(), "Emit");

        let mut finished = Vec::new();
        for (id, callback) in targets {
            let event = Event {
                emitter: self.inner.name.clone(),
                receiver: id,
                name: name.to_string(),
                args: args.clone(),
            };
            if !callback(&event) {
                finished.push(id);
            }
        }

        if !finished.is_empty() {
            self.subscriptions().retain(|s| !finished.contains(&s.id));
        }
    }
}

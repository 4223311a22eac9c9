// src/connection/subscription.rs
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

// Generate unique subscription IDs
static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(NEXT_SUB_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// A named event delivered by the peer, or a lifecycle event raised by the
/// manager itself (`connect`, `disconnect`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

type HandlerFn = dyn Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync;

/// Function type for handling events from a subscription
pub struct EventHandler {
    // Using a string description for better debug output
    description: String,
    handler: Box<HandlerFn>,
}

impl EventHandler {
    pub fn new<F, S>(description: S, handler: F) -> Self
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Into<String>,
    {
        Self {
            description: description.into(),
            handler: Box::new(handler),
        }
    }

    pub fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        (self.handler)(event)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Debug)]
struct Registration {
    id: SubscriptionId,
    handler: Arc<EventHandler>,
}

/// Event name -> handlers in registration order.
#[derive(Debug, Default)]
pub(crate) struct EventRegistry {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
}

impl EventRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn subscribe(self: &Arc<Self>, event: &str, handler: EventHandler) -> Unsubscribe {
        let id = SubscriptionId::new();
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .entry(event.to_string())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });

        Unsubscribe {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Remove a single registration. Returns true if it was still present.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut removed = false;
        handlers.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
            !registrations.is_empty()
        });
        removed
    }

    pub(crate) fn subscriber_count(&self, event: &str) -> usize {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(event).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for `event.name`, in registration order.
    ///
    /// The handler list is snapshotted before the first call so handlers can
    /// subscribe or unsubscribe without deadlocking; such changes take effect
    /// from the next event.
    pub(crate) fn dispatch(&self, event: &InboundEvent) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<EventHandler>)> = {
            let handlers = match self.handlers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match handlers.get(&event.name) {
                Some(registrations) => registrations
                    .iter()
                    .map(|r| (r.id, Arc::clone(&r.handler)))
                    .collect(),
                None => return 0,
            }
        };

        for (id, handler) in &snapshot {
            if let Err(e) = handler.handle(event) {
                error!(
                    "Error handling '{}' for subscription {} ({}): {:#}",
                    event.name, id, handler.description, e
                );
            }
        }
        snapshot.len()
    }
}

/// Handle returned by `subscribe`; removes exactly the registration it was
/// created for. Dropping it without calling [`Unsubscribe::unsubscribe`]
/// leaves the handler registered.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    id: SubscriptionId,
    registry: Weak<EventRegistry>,
}

impl Unsubscribe {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(&self) {
        match self.registry.upgrade() {
            Some(registry) => {
                if !registry.remove(self.id) {
                    warn!("Subscription {} was already removed", self.id);
                }
            }
            None => warn!("Subscription {} outlived its connection manager", self.id),
        }
    }
}

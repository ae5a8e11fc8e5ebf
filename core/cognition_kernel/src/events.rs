//! Process-wide event registry.
//!
//! EVENT cognitions register a named trigger with a handler stored as
//! canonical text, so no live tree is referenced after the registering
//! execution completes. Firing is driven from outside the core through the
//! kernel's `fire_event`; the registry only resolves handlers and wakes any
//! AWAIT suspended on the event name.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRegistration {
    pub name: String,
    pub trigger: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Canonical text of the handler cognition.
    pub handler_text: String,
    pub registered_at: DateTime<Utc>,
}

struct EventEntry {
    registration: EventRegistration,
    notify: Arc<Notify>,
}

#[derive(Default)]
pub struct EventRegistry {
    events: DashMap<String, EventEntry>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry {
            events: DashMap::new(),
        }
    }

    /// Register or replace an event. Returns whether an earlier registration
    /// was replaced.
    pub fn register(&self, registration: EventRegistration) -> bool {
        let name = registration.name.clone();
        let replaced = self.events.contains_key(&name);

        // Keep the existing notifier on replacement so suspended AWAITs
        // still wake when the renamed handler fires.
        let notify = self
            .events
            .get(&name)
            .map(|entry| entry.notify.clone())
            .unwrap_or_else(|| Arc::new(Notify::new()));

        self.events.insert(
            name,
            EventEntry {
                registration,
                notify,
            },
        );
        replaced
    }

    /// Remove an event registration, for administrative callers.
    pub fn remove(&self, name: &str) -> bool {
        self.events.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<EventRegistration> {
        self.events.get(name).map(|entry| entry.registration.clone())
    }

    /// Notifier for an event name, used by AWAIT to suspend until firing.
    pub fn notifier(&self, name: &str) -> Option<Arc<Notify>> {
        self.events.get(name).map(|entry| entry.notify.clone())
    }

    /// Wake every waiter suspended on this event. Returns whether the event
    /// is registered.
    pub fn signal(&self, name: &str) -> bool {
        match self.events.get(name) {
            Some(entry) => {
                entry.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// All registrations, sorted by name.
    pub fn list(&self) -> Vec<EventRegistration> {
        let mut out: Vec<EventRegistration> = self
            .events
            .iter()
            .map(|entry| entry.registration.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

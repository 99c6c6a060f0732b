//! In-process event dispatch with durable append.
//!
//! The bus invokes subscribers synchronously in registration order, then
//! persists the event through the attached store. A subscriber that
//! panics is isolated (logged, remaining subscribers still run), and a
//! persistence failure never prevents in-memory observers from seeing
//! the event.

use super::{Event, EventType};
use crate::store::{EventFilter, Store};
use anyhow::Result;
use serde_json::{Map, Value};
use std::panic::{AssertUnwindSafe, catch_unwind};
use uuid::Uuid;

type Handler = Box<dyn Fn(&Event) + Send>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

pub struct EventBus {
    store: Option<Store>,
    subscribers: Vec<(SubscriptionId, Handler)>,
    next_id: u64,
}

impl EventBus {
    /// A bus with no durable backing (in-memory observers only).
    pub fn new() -> Self {
        Self {
            store: None,
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    /// A bus that appends every emitted event to the store.
    pub fn with_store(store: Store) -> Self {
        Self {
            store: Some(store),
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    /// Build, dispatch, and persist an event. Emission always succeeds;
    /// subscriber panics and persistence failures are logged and
    /// swallowed.
    pub fn emit(
        &self,
        event_type: EventType,
        audit_id: Uuid,
        phase: Option<u32>,
        data: Map<String, Value>,
    ) -> Event {
        let event = Event::new(event_type, audit_id, phase, data);
        self.dispatch(&event);
        if let Some(store) = &self.store
            && let Err(e) = store.append_event(&event)
        {
            tracing::warn!("failed to persist event {}: {:#}", event.event_type, e);
        }
        event
    }

    fn dispatch(&self, event: &Event) {
        for (id, handler) in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(
                    "event subscriber {:?} panicked on {}; continuing",
                    id,
                    event.event_type
                );
            }
        }
    }

    /// Replay an audit's stored events through a handler in timestamp
    /// order. Returns the number of events replayed.
    pub fn replay<F>(&self, audit_id: Uuid, mut handler: F) -> Result<usize>
    where
        F: FnMut(&Event),
    {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let events = store.get_events(&EventFilter {
            audit_id: Some(audit_id),
            ..Default::default()
        })?;
        for event in &events {
            handler(event);
        }
        Ok(events.len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-connection subscription and observation sets.

use crate::messaging::vocab::*;
use crate::messaging::{NotificationMessage, RequestMessage};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Key set `thingID -> name -> correlationID`. An empty thingID or name is a wildcard.
#[derive(Debug, Default)]
pub struct Subscriptions {
    entries: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Subscribing twice keeps the first correlation ID.
    pub fn subscribe(&self, thing_id: &str, name: &str, correlation_id: &str) {
        let mut entries = self.entries.lock();
        entries
            .entry(thing_id.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| correlation_id.to_string());
    }

    /// Remove a subscription. Unknown keys are ignored.
    pub fn unsubscribe(&self, thing_id: &str, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(names) = entries.get_mut(thing_id) {
            names.remove(name);
            if names.is_empty() {
                entries.remove(thing_id);
            }
        }
    }

    /// Correlation ID of the entry matching `(thing_id, name)`, exact entries first, then
    /// wildcards.
    pub fn get_subscription(&self, thing_id: &str, name: &str) -> Option<String> {
        let entries = self.entries.lock();
        let candidates = [(thing_id, name), (thing_id, ""), ("", name), ("", "")];
        candidates.iter().find_map(|(t, n)| {
            entries
                .get(*t)
                .and_then(|names| names.get(*n))
                .cloned()
        })
    }

    pub fn is_subscribed(&self, thing_id: &str, name: &str) -> bool {
        self.get_subscription(thing_id, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Event subscriptions plus property observations of one server-side connection.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    pub events: Subscriptions,
    pub properties: Subscriptions,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a (un)subscribe or (un)observe request. Returns false for any other operation.
    pub fn apply_request(&self, req: &RequestMessage) -> bool {
        let op = req.operation.as_str();
        let name = match op {
            OP_SUBSCRIBE_ALL_EVENTS
            | OP_UNSUBSCRIBE_ALL_EVENTS
            | OP_OBSERVE_ALL_PROPERTIES
            | OP_UNOBSERVE_ALL_PROPERTIES => "",
            _ => req.name.as_str(),
        };
        if is_subscribe_op(op) {
            self.events.subscribe(&req.thing_id, name, &req.correlation_id);
        } else if is_unsubscribe_op(op) {
            self.events.unsubscribe(&req.thing_id, name);
        } else if is_observe_op(op) {
            self.properties.subscribe(&req.thing_id, name, &req.correlation_id);
        } else if is_unobserve_op(op) {
            self.properties.unsubscribe(&req.thing_id, name);
        } else {
            return false;
        }
        log::debug!(
            "{} thing='{}' name='{}' by '{}'",
            op,
            req.thing_id,
            name,
            req.sender_id
        );
        true
    }

    /// Whether this connection wants the notification. Action progress follows the event
    /// subscriptions.
    pub fn matches(&self, notif: &NotificationMessage) -> bool {
        match notif.operation.as_str() {
            OP_SUBSCRIBE_EVENT | OP_SUBSCRIBE_ALL_EVENTS | OP_INVOKE_ACTION => {
                self.events.is_subscribed(&notif.thing_id, &notif.name)
            }
            OP_OBSERVE_PROPERTY | OP_OBSERVE_ALL_PROPERTIES => {
                self.properties.is_subscribed(&notif.thing_id, &notif.name)
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        self.events.clear();
        self.properties.clear();
    }
}

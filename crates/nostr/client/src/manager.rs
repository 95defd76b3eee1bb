//! Process-wide subscription registry
//!
//! Relays hand every inbound event to the manager, which fans it out to the
//! live subscriptions whose filters match. The manager also remembers which
//! relays delivered each event and which signatures were already verified.

use crate::message::matches_any;
use crate::relay::Relay;
use crate::subscription::{EventOrigin, SubscriptionInner};
use indexmap::IndexMap;
use nostr::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Verified signatures remembered to skip re-verification
const MAX_VERIFIED_SIGNATURES: usize = 1000;

/// Events whose delivering relays are remembered
const MAX_SEEN_EVENTS: usize = 10_000;

#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: Mutex<HashMap<u64, Weak<SubscriptionInner>>>,
    seen_events: Mutex<IndexMap<String, Vec<String>>>,
    verified_signatures: Mutex<IndexMap<String, String>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add(&self, id: u64, subscription: Weak<SubscriptionInner>) {
        self.subscriptions.lock().insert(id, subscription);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.subscriptions.lock().remove(&id);
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|_, s| s.strong_count() > 0);
        subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `relay_url` delivered `event_id`. Re-recording the same
    /// relay is a no-op.
    pub fn record_seen(&self, event_id: &str, relay_url: &str) {
        let mut seen = self.seen_events.lock();
        let relays = seen.entry(event_id.to_string()).or_default();
        if !relays.iter().any(|r| r == relay_url) {
            relays.push(relay_url.to_string());
        }
        while seen.len() > MAX_SEEN_EVENTS {
            seen.shift_remove_index(0);
        }
    }

    /// Relays that have delivered an event, in first-seen order.
    pub fn seen_relays(&self, event_id: &str) -> Vec<String> {
        self.seen_events
            .lock()
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_verified(&self, event_id: &str) -> bool {
        self.verified_signatures.lock().contains_key(event_id)
    }

    pub fn verified_sig(&self, event_id: &str) -> Option<String> {
        self.verified_signatures.lock().get(event_id).cloned()
    }

    pub fn record_verified(&self, event_id: &str, sig: &str) {
        let mut verified = self.verified_signatures.lock();
        verified.insert(event_id.to_string(), sig.to_string());
        while verified.len() > MAX_VERIFIED_SIGNATURES {
            verified.shift_remove_index(0);
        }
    }

    /// Deliver an event to every matching subscription.
    pub fn dispatch_event(&self, event: Event, relay: Option<&Relay>, optimistic: bool) {
        if let Some(relay) = relay {
            self.record_seen(&event.id, relay.url());
        }

        let targets: Vec<Arc<SubscriptionInner>> = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.retain(|_, s| s.strong_count() > 0);
            subscriptions.values().filter_map(Weak::upgrade).collect()
        };

        let origin = relay.map_or(EventOrigin::Local, EventOrigin::Relay);
        let mut delivered = 0;
        for subscription in targets {
            if matches_any(subscription.filters(), &event) {
                subscription.event_received(event.clone(), origin, optimistic);
                delivered += 1;
            }
        }
        trace!("Event {} dispatched to {} subscriptions", event.id, delivered);
    }
}

//! Cache adapter interface and the in-memory implementation

use crate::message::{Filter, matches_any};
use futures::future::BoxFuture;
use nostr::{Event, EventIdentity, RelayInformation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// An event returned by a cache together with the relays it was seen on.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEvent {
    pub event: Event,
    pub relays: Vec<String>,
}

/// Answer to a cache query. Locking caches answer synchronously.
pub enum CacheResponse {
    Ready(Vec<CachedEvent>),
    Pending(BoxFuture<'static, Vec<CachedEvent>>),
}

/// What a cache remembers about a relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayStatusRecord {
    /// Unix milliseconds
    pub last_connected_at: Option<u64>,
    /// Unix milliseconds before which the relay should not be connected
    pub dont_connect_before: Option<u64>,
    pub consecutive_failures: u32,
    pub info: Option<RelayInformation>,
    /// Unix seconds
    pub info_fetched_at: Option<u64>,
}

/// Storage the subscription engine consults before and alongside relays.
pub trait CacheAdapter: Send + Sync {
    /// Whether `query` is fast enough to block relay dispatch on.
    fn locking(&self) -> bool;

    fn query(&self, filters: &[Filter]) -> CacheResponse;

    fn set_event(&self, event: &Event, filters: &[Filter], relay: Option<&str>);

    /// Another relay delivered an already-stored event.
    fn set_event_dup(&self, _event: &Event, _relay: &str) {}

    fn delete_event_ids(&self, _ids: &[String]) {}

    fn relay_status(&self, _url: &str) -> Option<RelayStatusRecord> {
        None
    }

    fn update_relay_status(&self, _url: &str, _record: RelayStatusRecord) {}
}

/// Configuration for event cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of events to store
    pub max_events: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_events: 10000 }
    }
}

/// Local event store with LRU eviction
pub struct EventCache {
    config: CacheConfig,
    events: HashMap<String, Event>,
    /// Event ids in access order, oldest first
    lru_queue: VecDeque<String>,
    by_kind: HashMap<u16, HashSet<String>>,
    by_author: HashMap<String, HashSet<String>>,
    /// Replaceable and addressable events, newest wins
    by_identity: HashMap<EventIdentity, String>,
    /// Relays each stored event was delivered by
    relays: HashMap<String, Vec<String>>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            events: HashMap::new(),
            lru_queue: VecDeque::new(),
            by_kind: HashMap::new(),
            by_author: HashMap::new(),
            by_identity: HashMap::new(),
            relays: HashMap::new(),
        }
    }

    /// Insert an event. Returns `false` when an equal or newer version of a
    /// replaceable event is already stored.
    pub fn insert(&mut self, event: Event, relay: Option<&str>) -> bool {
        let event_id = event.id.clone();

        if self.events.contains_key(&event_id) {
            self.touch(&event_id);
            if let Some(relay) = relay {
                self.add_relay(&event_id, relay);
            }
            return true;
        }

        let identity = event.identity();
        if !matches!(identity, EventIdentity::Id(_)) {
            if let Some(old_id) = self.by_identity.get(&identity).cloned()
                && let Some(old_event) = self.events.get(&old_id)
            {
                if event.created_at <= old_event.created_at {
                    return false;
                }
                self.remove(&old_id);
            }
            self.by_identity.insert(identity, event_id.clone());
        }

        if self.events.len() >= self.config.max_events
            && let Some(old_id) = self.lru_queue.pop_front()
        {
            self.remove(&old_id);
        }

        self.by_kind.entry(event.kind).or_default().insert(event_id.clone());
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(event_id.clone());

        self.events.insert(event_id.clone(), event);
        self.lru_queue.push_back(event_id.clone());
        if let Some(relay) = relay {
            self.add_relay(&event_id, relay);
        }
        true
    }

    fn touch(&mut self, event_id: &str) {
        self.lru_queue.retain(|id| id != event_id);
        self.lru_queue.push_back(event_id.to_string());
    }

    pub fn add_relay(&mut self, event_id: &str, relay: &str) {
        if !self.events.contains_key(event_id) {
            return;
        }
        let relays = self.relays.entry(event_id.to_string()).or_default();
        if !relays.iter().any(|r| r == relay) {
            relays.push(relay.to_string());
        }
    }

    pub fn get(&mut self, event_id: &str) -> Option<&Event> {
        if self.events.contains_key(event_id) {
            self.touch(event_id);
            return self.events.get(event_id);
        }
        None
    }

    pub fn relays_for(&self, event_id: &str) -> Vec<String> {
        self.relays.get(event_id).cloned().unwrap_or_default()
    }

    /// Events matching any filter, newest first. A filter's `limit` caps the
    /// events that filter contributes.
    pub fn query(&self, filters: &[Filter]) -> Vec<CachedEvent> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for filter in filters {
            let mut matched: Vec<&Event> = self
                .candidates(filter)
                .into_iter()
                .filter(|e| filter.matches(e))
                .collect();
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            if let Some(limit) = filter.limit {
                matched.truncate(limit as usize);
            }

            for event in matched {
                if seen.insert(event.id.clone()) {
                    out.push(CachedEvent {
                        event: event.clone(),
                        relays: self.relays_for(&event.id),
                    });
                }
            }
        }
        out
    }

    /// Narrowest index lookup for a filter.
    fn candidates(&self, filter: &Filter) -> Vec<&Event> {
        let lookup = |ids: Option<&HashSet<String>>| -> Vec<&Event> {
            ids.map(|ids| ids.iter().filter_map(|id| self.events.get(id)).collect())
                .unwrap_or_default()
        };

        if let Some(ids) = &filter.ids {
            return ids.iter().filter_map(|id| self.events.get(id)).collect();
        }
        if let Some(authors) = &filter.authors {
            return authors
                .iter()
                .flat_map(|a| lookup(self.by_author.get(a)))
                .collect();
        }
        if let Some(kinds) = &filter.kinds {
            return kinds.iter().flat_map(|k| lookup(self.by_kind.get(k))).collect();
        }
        self.events.values().collect()
    }

    pub fn remove(&mut self, event_id: &str) -> Option<Event> {
        let event = self.events.remove(event_id)?;
        self.lru_queue.retain(|id| id != event_id);
        self.relays.remove(event_id);

        if let Some(ids) = self.by_kind.get_mut(&event.kind) {
            ids.remove(event_id);
        }
        if let Some(ids) = self.by_author.get_mut(&event.pubkey) {
            ids.remove(event_id);
        }

        let identity = event.identity();
        if self.by_identity.get(&identity) == Some(&event.id) {
            self.by_identity.remove(&identity);
        }

        Some(event)
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.lru_queue.clear();
        self.by_kind.clear();
        self.by_author.clear();
        self.by_identity.clear();
        self.relays.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronous in-process [`CacheAdapter`].
#[derive(Default)]
pub struct MemoryCache {
    events: Mutex<EventCache>,
    relay_status: Mutex<HashMap<String, RelayStatusRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            events: Mutex::new(EventCache::with_config(config)),
            relay_status: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn relays_for(&self, event_id: &str) -> Vec<String> {
        self.events.lock().relays_for(event_id)
    }
}

impl CacheAdapter for MemoryCache {
    fn locking(&self) -> bool {
        true
    }

    fn query(&self, filters: &[Filter]) -> CacheResponse {
        CacheResponse::Ready(self.events.lock().query(filters))
    }

    fn set_event(&self, event: &Event, filters: &[Filter], relay: Option<&str>) {
        if !filters.is_empty() && !matches_any(filters, event) {
            tracing::trace!("Caching event {} outside its subscription filters", event.id);
        }
        self.events.lock().insert(event.clone(), relay);
    }

    fn set_event_dup(&self, event: &Event, relay: &str) {
        self.events.lock().add_relay(&event.id, relay);
    }

    fn delete_event_ids(&self, ids: &[String]) {
        let mut events = self.events.lock();
        for id in ids {
            events.remove(id);
        }
    }

    fn relay_status(&self, url: &str) -> Option<RelayStatusRecord> {
        self.relay_status.lock().get(url).cloned()
    }

    fn update_relay_status(&self, url: &str, record: RelayStatusRecord) {
        self.relay_status.lock().insert(url.to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: vec![],
            content: "test".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = EventCache::new();
        cache.insert(create_test_event("id1", "pubkey1", 1, 1234567890), Some("wss://a/"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("id1").unwrap().id, "id1");
        assert_eq!(cache.relays_for("id1"), vec!["wss://a/"]);
    }

    #[test]
    fn test_cache_relay_provenance_accumulates() {
        let mut cache = EventCache::new();
        let event = create_test_event("id1", "pubkey1", 1, 1234567890);
        cache.insert(event.clone(), Some("wss://a/"));
        cache.insert(event.clone(), Some("wss://b/"));
        cache.insert(event, Some("wss://a/"));
        assert_eq!(cache.relays_for("id1"), vec!["wss://a/", "wss://b/"]);
    }

    #[test]
    fn test_cache_query() {
        let mut cache = EventCache::new();
        cache.insert(create_test_event("id1", "pubkey1", 1, 100), None);
        cache.insert(create_test_event("id2", "pubkey1", 1, 300), None);
        cache.insert(create_test_event("id3", "pubkey2", 1, 200), None);
        cache.insert(create_test_event("id4", "pubkey1", 7, 400), None);

        let result = cache.query(&[Filter::new().authors(vec!["pubkey1".to_string()]).kinds(vec![1])]);
        let ids: Vec<&str> = result.iter().map(|c| c.event.id.as_str()).collect();
        assert_eq!(ids, vec!["id2", "id1"]);

        let limited = cache.query(&[Filter::new().kinds(vec![1]).limit(2)]);
        let ids: Vec<&str> = limited.iter().map(|c| c.event.id.as_str()).collect();
        assert_eq!(ids, vec!["id2", "id3"]);

        let union = cache.query(&[
            Filter::new().ids(vec!["id4".to_string()]),
            Filter::new().ids(vec!["id4".to_string(), "id1".to_string()]),
        ]);
        assert_eq!(union.len(), 2);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = EventCache::with_config(CacheConfig { max_events: 3 });
        for i in 1..=3 {
            cache.insert(create_test_event(&format!("id{}", i), "pk", 1, 1000 + i), None);
        }
        cache.get("id1");
        cache.insert(create_test_event("id4", "pk", 1, 2000), None);

        assert_eq!(cache.len(), 3);
        assert!(cache.get("id1").is_some());
        assert!(cache.get("id2").is_none());
    }

    #[test]
    fn test_cache_replaceable_events() {
        let mut cache = EventCache::new();
        assert!(cache.insert(create_test_event("id1", "pubkey1", 0, 1234567890), None));
        assert!(cache.insert(create_test_event("id2", "pubkey1", 0, 1234567900), None));

        assert_eq!(cache.len(), 1);
        assert!(cache.get("id1").is_none());
        assert!(cache.get("id2").is_some());

        assert!(!cache.insert(create_test_event("id3", "pubkey1", 0, 1234567800), None));
        assert!(cache.get("id3").is_none());
    }

    #[test]
    fn test_cache_addressable_events() {
        let mut cache = EventCache::new();

        let mut event1 = create_test_event("id1", "pubkey1", 30023, 1234567890);
        event1.tags = vec![vec!["d".to_string(), "article1".to_string()]];
        cache.insert(event1, None);

        let mut event2 = create_test_event("id2", "pubkey1", 30023, 1234567900);
        event2.tags = vec![vec!["d".to_string(), "article1".to_string()]];
        cache.insert(event2, None);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("id2").is_some());

        let mut event3 = create_test_event("id3", "pubkey1", 30023, 1234567910);
        event3.tags = vec![vec!["d".to_string(), "article2".to_string()]];
        cache.insert(event3, None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_memory_cache_adapter() {
        let cache = MemoryCache::new();
        assert!(cache.locking());

        let event = create_test_event("id1", "pubkey1", 1, 100);
        cache.set_event(&event, &[Filter::new().kinds(vec![1])], Some("wss://a/"));
        cache.set_event_dup(&event, "wss://b/");

        let CacheResponse::Ready(events) = cache.query(&[Filter::new().kinds(vec![1])]) else {
            panic!("memory cache answers synchronously");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].relays, vec!["wss://a/", "wss://b/"]);

        cache.delete_event_ids(&["id1".to_string()]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_relay_status_records() {
        let cache = MemoryCache::new();
        assert!(cache.relay_status("wss://a/").is_none());

        cache.update_relay_status(
            "wss://a/",
            RelayStatusRecord {
                dont_connect_before: Some(5000),
                ..Default::default()
            },
        );
        assert_eq!(
            cache.relay_status("wss://a/").unwrap().dont_connect_before,
            Some(5000)
        );

        let json = serde_json::to_string(&cache.relay_status("wss://a/").unwrap()).unwrap();
        assert!(json.contains("\"dontConnectBefore\":5000"));
    }
}

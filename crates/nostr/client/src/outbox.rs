//! Outbox model for relay selection
//!
//! Implements the NIP-65 outbox model: events FROM a user are fetched from
//! their WRITE relays, events ABOUT a user are delivered to their READ
//! relays. Subscriptions use [`RelaySelector::calculate_relay_sets`] to split
//! author-constrained filters across relays.

use crate::message::Filter;
use crate::normalize::try_normalize_relay_url;
use crate::pool::RelayPool;
use indexmap::IndexMap;
use nostr::{Event, RELAY_LIST_METADATA_KIND, RelayListMetadata};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Relays used when nothing else applies
const FALLBACK_RELAY_COUNT: usize = 5;

/// Decides which relays a query or an event should go to.
pub trait RelaySelector: Send + Sync {
    /// Map each relay URL to the filters it should receive. Author lists are
    /// split so every author reaches up to `goal_per_author` relays.
    fn calculate_relay_sets(
        &self,
        filters: &[Filter],
        pool: &RelayPool,
        goal_per_author: usize,
    ) -> HashMap<String, Vec<Filter>>;

    /// Where `pubkey` publishes.
    fn write_relays(&self, pubkey: &str) -> Vec<String>;

    /// Where `pubkey` reads mentions.
    fn read_relays(&self, pubkey: &str) -> Vec<String>;

    /// Feed a kind 10002 relay list.
    fn update_relay_list(&self, _event: &Event) {}
}

#[derive(Debug, Clone)]
struct CacheEntry {
    metadata: RelayListMetadata,
    created_at: u64,
    cached_at: SystemTime,
}

/// Configuration for outbox model
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How long a relay list stays usable
    pub cache_ttl: Duration,
    /// Relays to use when a user has no relay list
    pub fallback_relays: Vec<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            fallback_relays: vec![],
        }
    }
}

/// Outbox model relay selector backed by cached relay lists.
pub struct OutboxModel {
    config: OutboxConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl OutboxModel {
    pub fn new() -> Self {
        Self::with_config(OutboxConfig::default())
    }

    pub fn with_config(config: OutboxConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Store a relay list. Older lists never replace newer ones.
    pub fn set_relay_list(&self, event: &Event) -> bool {
        if event.kind != RELAY_LIST_METADATA_KIND {
            debug!("Ignoring kind {} as relay list", event.kind);
            return false;
        }

        let metadata = match RelayListMetadata::from_event(event) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("Invalid relay list from {}: {}", event.pubkey, e);
                return false;
            }
        };

        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&event.pubkey)
            && existing.created_at > event.created_at
        {
            return false;
        }
        cache.insert(
            event.pubkey.clone(),
            CacheEntry {
                metadata,
                created_at: event.created_at,
                cached_at: SystemTime::now(),
            },
        );
        true
    }

    fn cached(&self, pubkey: &str, pick: impl Fn(&RelayListMetadata) -> Vec<String>) -> Vec<String> {
        let cache = self.cache.read();
        if let Some(entry) = cache.get(pubkey)
            && entry
                .cached_at
                .elapsed()
                .is_ok_and(|elapsed| elapsed < self.config.cache_ttl)
        {
            let relays: Vec<String> = pick(&entry.metadata)
                .iter()
                .filter_map(|r| try_normalize_relay_url(r))
                .collect();
            if !relays.is_empty() {
                return relays;
            }
        }
        self.config.fallback_relays.clone()
    }

    pub fn has_relay_list(&self, pubkey: &str) -> bool {
        self.cache.read().get(pubkey).is_some_and(|entry| {
            entry
                .cached_at
                .elapsed()
                .is_ok_and(|elapsed| elapsed < self.config.cache_ttl)
        })
    }

    /// Author's WRITE relays plus READ relays of every tagged user.
    pub fn publish_relays(&self, event: &Event) -> Vec<String> {
        let mut relays = self.write_relays(&event.pubkey);
        for pubkey in event.tag_values("p") {
            relays.extend(self.read_relays(pubkey));
        }
        crate::normalize::normalize(&relays)
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub fn remove_from_cache(&self, pubkey: &str) {
        self.cache.write().remove(pubkey);
    }
}

impl Default for OutboxModel {
    fn default() -> Self {
        Self::new()
    }
}

impl RelaySelector for OutboxModel {
    fn calculate_relay_sets(
        &self,
        filters: &[Filter],
        pool: &RelayPool,
        goal_per_author: usize,
    ) -> HashMap<String, Vec<Filter>> {
        let connected: HashSet<String> = pool.connected_urls().into_iter().collect();
        let permanent = pool.permanent_and_connected_urls();
        let mut sets: IndexMap<String, Vec<Filter>> = IndexMap::new();
        let mut unconstrained = Vec::new();

        for filter in filters {
            let Some(authors) = filter.authors.as_ref().filter(|a| !a.is_empty()) else {
                unconstrained.push(filter.clone());
                continue;
            };

            let mut per_relay: IndexMap<String, Vec<String>> = IndexMap::new();
            for author in authors {
                let mut relays = self.write_relays(author);
                if relays.is_empty() {
                    relays = permanent.clone();
                }
                relays.sort_by_key(|r| !connected.contains(r));
                for relay in relays.into_iter().take(goal_per_author.max(1)) {
                    per_relay.entry(relay).or_default().push(author.clone());
                }
            }

            for (relay, relay_authors) in per_relay {
                if relay_authors.is_empty() {
                    continue;
                }
                let mut narrowed = filter.clone();
                narrowed.authors = Some(relay_authors);
                sets.entry(relay).or_default().push(narrowed);
            }
        }

        if !unconstrained.is_empty() {
            if sets.is_empty() {
                for url in pool.explicit_urls() {
                    sets.entry(url).or_default();
                }
            }
            for relay_filters in sets.values_mut() {
                relay_filters.extend(unconstrained.iter().cloned());
            }
        }

        if sets.is_empty() {
            for url in permanent.into_iter().take(FALLBACK_RELAY_COUNT) {
                sets.insert(url, filters.to_vec());
            }
        }

        trace!("Calculated relay sets for {} relays", sets.len());
        sets.into_iter().filter(|(_, f)| !f.is_empty()).collect()
    }

    fn write_relays(&self, pubkey: &str) -> Vec<String> {
        self.cached(pubkey, RelayListMetadata::write_relays)
    }

    fn read_relays(&self, pubkey: &str) -> Vec<String> {
        self.cached(pubkey, RelayListMetadata::read_relays)
    }

    fn update_relay_list(&self, event: &Event) {
        self.set_relay_list(event);
    }
}

//! Subscriptions across the relay pool.
//!
//! A [`Subscription`] is one logical query. It probes the cache, assigns
//! filters to relays, deduplicates and validates what comes back, and
//! decides when stored events are exhausted (EOSE). Results are read from a
//! [`SubscriptionStream`].

use crate::cache::{CacheAdapter, CacheResponse, CachedEvent};
use crate::client::ClientNotification;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::filter::filter_fingerprint;
use crate::grouping::{GroupableDelayType, RelaySubscriber, SubscriptionItem};
use crate::message::Filter;
use crate::normalize::normalize;
use crate::outbox::RelaySelector;
use crate::pool::{PoolNotification, RelayPool};
use crate::relay::Relay;
use futures::Stream;
use nostr::{Event, EventIdentity, validate_event, verify_event};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Returns `true` for events the user does not want to see.
pub type MuteFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// How a subscription uses the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheUsage {
    /// Never contact relays
    OnlyCache,
    /// Ask the cache first; relays are skipped if it fully answers
    #[default]
    CacheFirst,
    /// Query cache and relays at the same time
    Parallel,
    /// Ignore the cache
    OnlyRelay,
}

#[derive(Clone)]
pub struct SubscriptionOptions {
    pub close_on_eose: bool,
    pub cache_usage: CacheUsage,
    pub dont_save_to_cache: bool,
    pub groupable: bool,
    pub groupable_delay: Duration,
    pub groupable_delay_type: GroupableDelayType,
    /// Prefix for the wire subscription id
    pub sub_id: Option<String>,
    pub skip_verification: bool,
    pub skip_validation: bool,
    /// Ignore events this process publishes before relays confirm them
    pub skip_optimistic_publish_event: bool,
    /// Explicit relay set; bypasses relay selection
    pub relay_urls: Option<Vec<String>>,
    /// Only request events newer than the newest cached one
    pub add_since_from_cache: bool,
    pub relay_goal_per_author: usize,
    /// Drop events from relays outside `relay_urls`
    pub exclusive_relay: bool,
    pub include_muted: bool,
    /// Filter keys removed before querying the cache
    pub cache_unconstrain_filter: Vec<String>,
    pub on_stopped: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            close_on_eose: false,
            cache_usage: CacheUsage::CacheFirst,
            dont_save_to_cache: false,
            groupable: true,
            groupable_delay: Duration::from_millis(10),
            groupable_delay_type: GroupableDelayType::AtMost,
            sub_id: None,
            skip_verification: false,
            skip_validation: false,
            skip_optimistic_publish_event: false,
            relay_urls: None,
            add_since_from_cache: false,
            relay_goal_per_author: 2,
            exclusive_relay: false,
            include_muted: false,
            cache_unconstrain_filter: vec!["limit".to_string(), "since".to_string(), "until".to_string()],
            on_stopped: None,
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("close_on_eose", &self.close_on_eose)
            .field("cache_usage", &self.cache_usage)
            .field("groupable", &self.groupable)
            .field("relay_urls", &self.relay_urls)
            .field("exclusive_relay", &self.exclusive_relay)
            .finish_non_exhaustive()
    }
}

impl SubscriptionOptions {
    /// One-shot query: stop once stored events are exhausted.
    pub fn close_on_eose() -> Self {
        Self {
            close_on_eose: true,
            ..Self::default()
        }
    }

    pub fn with_relays(mut self, urls: Vec<String>) -> Self {
        self.relay_urls = Some(urls);
        self
    }

    pub fn with_relay_set(self, relay_set: &crate::relay_set::RelaySet) -> Self {
        self.with_relays(relay_set.urls())
    }
}

/// What a subscription yields.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// First sighting of an event
    Event {
        event: Event,
        relay: Option<String>,
        from_cache: bool,
        optimistic: bool,
    },
    /// A known event delivered again
    Duplicate {
        event_id: String,
        relay: Option<String>,
        since_first_seen: Duration,
    },
    Eose,
    /// A relay terminated the subscription
    Closed { relay: String, reason: String },
    /// The subscription stopped; nothing follows
    Close,
}

/// Where an event came from.
#[derive(Clone, Copy)]
pub(crate) enum EventOrigin<'a> {
    Relay(&'a Relay),
    /// Cache hit with the relays it was recorded against
    Cache(&'a [String]),
    /// Published by this process
    Local,
}

impl EventOrigin<'_> {
    fn relay_url(&self) -> Option<&str> {
        match self {
            EventOrigin::Relay(relay) => Some(relay.url()),
            _ => None,
        }
    }
}

/// Collaborators a subscription needs.
#[derive(Clone)]
pub(crate) struct SubscriptionContext {
    pub pool: RelayPool,
    pub cache: Option<Arc<dyn CacheAdapter>>,
    pub selector: Option<Arc<dyn RelaySelector>>,
    pub mute_filter: Option<MuteFilter>,
    pub notifications: Option<broadcast::Sender<ClientNotification>>,
    pub config: Arc<ClientConfig>,
}

impl SubscriptionContext {
    pub(crate) fn for_pool(pool: RelayPool) -> Self {
        Self {
            cache: pool.cache(),
            config: Arc::new(pool.config().clone()),
            pool,
            selector: None,
            mute_filter: None,
            notifications: None,
        }
    }
}

#[derive(Default)]
struct SubscriptionState {
    relay_filters: HashMap<String, Vec<Filter>>,
    relays: HashMap<String, Relay>,
    eosed: HashSet<String>,
    event_first_seen: HashMap<String, Instant>,
    replaceable_latest: HashMap<EventIdentity, u64>,
    eose_emitted: bool,
    eose_timer: Option<JoinHandle<()>>,
    last_event_received_at: Option<Instant>,
    monitor: Option<JoinHandle<()>>,
    cache_task: Option<JoinHandle<()>>,
    started: bool,
}

pub(crate) struct SubscriptionInner {
    id: u64,
    filters: Vec<Filter>,
    options: SubscriptionOptions,
    ctx: SubscriptionContext,
    explicit_relays: Option<HashSet<String>>,
    state: Mutex<SubscriptionState>,
    stopped: AtomicBool,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionEvent>>>,
    self_ref: Weak<SubscriptionInner>,
}

/// Handle to a running query. Dropping every handle (and the stream) stops
/// it.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("filters", &self.inner.filters)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Subscription {
    pub(crate) fn new(
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        ctx: SubscriptionContext,
    ) -> Result<Self> {
        if filters.is_empty() {
            return Err(ClientError::Subscription(
                "Subscription must have at least one filter".to_string(),
            ));
        }

        let id = ctx.pool.manager().next_id();
        let explicit_relays = options
            .relay_urls
            .as_ref()
            .map(|urls| normalize(urls).into_iter().collect::<HashSet<_>>());
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|self_ref| SubscriptionInner {
            id,
            filters,
            options,
            ctx,
            explicit_relays,
            state: Mutex::new(SubscriptionState::default()),
            stopped: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
            self_ref: self_ref.clone(),
        });
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.inner.filters
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.inner.options
    }

    /// The result stream. Available once.
    pub fn take_stream(&self) -> Option<SubscriptionStream> {
        let rx = self.inner.rx.lock().take()?;
        Some(SubscriptionStream {
            rx,
            done: false,
            _subscription: self.clone(),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Whether EOSE has been emitted.
    pub fn eose_received(&self) -> bool {
        self.inner.state.lock().eose_emitted
    }

    /// Filters sent to each relay.
    pub fn relay_filters(&self) -> HashMap<String, Vec<Filter>> {
        self.inner.state.lock().relay_filters.clone()
    }

    /// Assigned relays that have not signalled EOSE.
    pub fn relays_missing_eose(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut missing: Vec<String> = state
            .relay_filters
            .keys()
            .filter(|url| !state.eosed.contains(*url))
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    /// Relays that have delivered `event_id` so far.
    pub fn seen_relays(&self, event_id: &str) -> Vec<String> {
        self.inner.ctx.pool.manager().seen_relays(event_id)
    }

    /// Query the cache, then the relays.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.started || inner.is_stopped() {
                return Ok(());
            }
            state.started = true;
        }
        inner.ctx.pool.manager().add(inner.id, Arc::downgrade(inner));

        let usage = inner.options.cache_usage;
        let mut cached = Vec::new();
        if let Some(cache) = inner.ctx.cache.clone().filter(|_| usage != CacheUsage::OnlyRelay) {
            let query: Vec<Filter> = inner
                .filters
                .iter()
                .map(|f| f.without_keys(&inner.options.cache_unconstrain_filter))
                .collect();

            match cache.query(&query) {
                CacheResponse::Ready(events) => cached = events,
                CacheResponse::Pending(pending) => {
                    let must_wait = usage == CacheUsage::OnlyCache
                        || inner.options.add_since_from_cache
                        || (inner.options.close_on_eose
                            && cache.locking()
                            && usage != CacheUsage::Parallel);
                    if must_wait {
                        cached = pending.await;
                    } else {
                        let weak = Arc::downgrade(inner);
                        let handle = tokio::spawn(async move {
                            let events = pending.await;
                            if let Some(inner) = weak.upgrade() {
                                inner.deliver_cached(events);
                            }
                        });
                        inner.state.lock().cache_task = Some(handle);
                    }
                }
            }
        }

        let newest_cached = cached.iter().map(|c| c.event.created_at).max();
        inner.deliver_cached(cached);

        if usage == CacheUsage::OnlyCache {
            inner.perform_eose();
            return Ok(());
        }
        if usage == CacheUsage::CacheFirst && inner.query_fully_filled() {
            debug!("Subscription {} answered from cache", inner.id);
            inner.perform_eose();
            return Ok(());
        }

        let since = newest_cached.filter(|_| inner.options.add_since_from_cache);
        inner.start_with_relays(since);
        Ok(())
    }

    /// Stop delivering results. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Attach relays the selector newly assigns.
    pub fn refresh_relay_connections(&self) {
        self.inner.refresh_relay_connections();
    }

    #[cfg(test)]
    pub(crate) fn register_for_test(&self) {
        self.inner.state.lock().started = true;
        self.inner
            .ctx
            .pool
            .manager()
            .add(self.inner.id, Arc::downgrade(&self.inner));
    }

    #[cfg(test)]
    pub(crate) fn attach_for_test(&self, relay: &Relay) {
        self.inner.attach(relay.clone(), self.inner.filters.clone());
    }

    #[cfg(test)]
    pub(crate) fn eose_from_for_test(&self, relay: &Relay) {
        self.inner.on_eose(relay);
    }
}

impl SubscriptionInner {
    pub(crate) fn filters(&self) -> &[Filter] {
        &self.filters
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn deliver_cached(&self, events: Vec<CachedEvent>) {
        for cached in events {
            let CachedEvent { event, relays } = cached;
            self.event_received(event, EventOrigin::Cache(&relays), false);
        }
    }

    fn query_fully_filled(&self) -> bool {
        let state = self.state.lock();
        self.filters.iter().all(|f| {
            f.ids.as_ref().is_some_and(|ids| {
                !ids.is_empty() && ids.iter().all(|id| state.event_first_seen.contains_key(id))
            })
        })
    }

    fn start_with_relays(&self, since: Option<u64>) {
        let mut filters = self.filters.clone();
        if let Some(since) = since {
            for filter in &mut filters {
                if filter.since.is_none_or(|existing| existing < since) {
                    filter.since = Some(since);
                }
            }
        }

        let assignment = self.compute_assignment(&filters);
        if assignment.is_empty() {
            if self.options.close_on_eose {
                debug!("Subscription {} has no relays, ending", self.id);
                self.perform_eose();
                return;
            }
            warn!("Subscription {} has no relays to query", self.id);
        }

        for (url, relay_filters) in assignment {
            match self.ctx.pool.get_relay(&url, true, true) {
                Ok(relay) => self.attach(relay, relay_filters),
                Err(e) => debug!("Skipping relay {} for subscription {}: {}", url, self.id, e),
            }
        }

        if self.explicit_relays.is_none() && !self.is_stopped() {
            self.spawn_monitor();
        }
    }

    fn compute_assignment(&self, filters: &[Filter]) -> HashMap<String, Vec<Filter>> {
        if let Some(explicit) = &self.explicit_relays {
            return explicit
                .iter()
                .map(|url| (url.clone(), filters.to_vec()))
                .collect();
        }

        if self.ctx.config.enable_outbox_model
            && let Some(selector) = &self.ctx.selector
        {
            return selector.calculate_relay_sets(
                filters,
                &self.ctx.pool,
                self.options.relay_goal_per_author,
            );
        }

        let mut urls = self.ctx.pool.explicit_urls();
        if urls.is_empty() {
            urls = self.ctx.pool.urls();
        }
        urls.into_iter().map(|url| (url, filters.to_vec())).collect()
    }

    fn attach(&self, relay: Relay, filters: Vec<Filter>) {
        let url = relay.url().to_string();
        {
            let mut state = self.state.lock();
            if self.is_stopped() || state.relays.contains_key(&url) {
                return;
            }
            state.relay_filters.insert(url.clone(), filters.clone());
            state.relays.insert(url.clone(), relay.clone());
        }

        let subscriber: Weak<dyn RelaySubscriber> = self.self_ref.clone();
        let fingerprint = if self.options.groupable {
            filter_fingerprint(&filters, self.options.close_on_eose)
        } else {
            None
        };
        let item = SubscriptionItem {
            subscriber,
            internal_id: self.id,
            filters,
            fingerprint,
            groupable: self.options.groupable,
            delay: self.options.groupable_delay,
            delay_type: self.options.groupable_delay_type,
            sub_id: self.options.sub_id.clone(),
        };

        if let Err(e) = relay.add_subscription_item(item) {
            warn!("Could not subscribe {} on {}: {}", self.id, url, e);
        }
    }

    fn spawn_monitor(&self) {
        let mut notifications = self.ctx.pool.notifications();
        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(PoolNotification::RelayConnect { .. }) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.refresh_relay_connections();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.state.lock().monitor = Some(handle);
    }

    fn refresh_relay_connections(&self) {
        if self.explicit_relays.is_some() || self.is_stopped() {
            return;
        }
        let assignment = self.compute_assignment(&self.filters);
        let fresh: Vec<(String, Vec<Filter>)> = {
            let state = self.state.lock();
            assignment
                .into_iter()
                .filter(|(url, _)| !state.relays.contains_key(url))
                .collect()
        };

        for (url, filters) in fresh {
            if let Ok(relay) = self.ctx.pool.get_relay(&url, true, true) {
                debug!("Subscription {} adding relay {}", self.id, url);
                self.attach(relay, filters);
            }
        }
    }

    /// Run an incoming event through exclusivity, dedup, validation,
    /// verification, caching and muting, then emit it.
    pub(crate) fn event_received(&self, event: Event, origin: EventOrigin<'_>, optimistic: bool) {
        if self.is_stopped() {
            return;
        }
        if optimistic && self.options.skip_optimistic_publish_event {
            return;
        }

        if self.options.exclusive_relay
            && let Some(explicit) = &self.explicit_relays
        {
            let allowed = match origin {
                EventOrigin::Relay(relay) => explicit.contains(relay.url()),
                EventOrigin::Cache(relays) => relays.iter().any(|r| explicit.contains(r)),
                EventOrigin::Local => true,
            };
            if !allowed {
                trace!("Subscription {} dropping event {} from outside its relays", self.id, event.id);
                return;
            }
        }

        let now = Instant::now();
        let first_seen = self.state.lock().event_first_seen.get(&event.id).copied();
        if let Some(first_seen) = first_seen {
            self.duplicate_received(&event, origin, now.saturating_duration_since(first_seen));
            return;
        }

        if let Some(grace) = self.ctx.config.future_timestamp_grace_secs
            && event.created_at > unix_now() + grace
        {
            debug!("Dropping event {} dated in the future", event.id);
            return;
        }

        if let EventOrigin::Relay(relay) = origin {
            if !self.options.skip_validation && !validate_event(&event) {
                debug!("Invalid event {} from {}", event.id, relay.url());
                return;
            }
            if !self.options.skip_verification && !self.verify(&event, relay) {
                return;
            }
        }

        let from_cache = matches!(origin, EventOrigin::Cache(_));
        if !from_cache
            && !optimistic
            && !self.options.dont_save_to_cache
            && !event.is_ephemeral()
            && let Some(cache) = &self.ctx.cache
        {
            cache.set_event(&event, &self.filters, origin.relay_url());
        }

        if !self.options.include_muted
            && let Some(mute) = &self.ctx.mute_filter
            && mute(&event)
        {
            trace!("Muted event {}", event.id);
            return;
        }

        let mut state = self.state.lock();
        state.last_event_received_at = Some(now);
        if self.is_stopped() {
            return;
        }
        if state.event_first_seen.contains_key(&event.id) {
            let _ = self.tx.send(SubscriptionEvent::Duplicate {
                event_id: event.id,
                relay: origin.relay_url().map(str::to_string),
                since_first_seen: Duration::ZERO,
            });
            return;
        }

        let identity = event.identity();
        state.event_first_seen.insert(event.id.clone(), now);
        if !matches!(identity, EventIdentity::Id(_)) {
            if state
                .replaceable_latest
                .get(&identity)
                .is_some_and(|latest| *latest >= event.created_at)
            {
                let _ = self.tx.send(SubscriptionEvent::Duplicate {
                    event_id: event.id,
                    relay: origin.relay_url().map(str::to_string),
                    since_first_seen: Duration::ZERO,
                });
                return;
            }
            state.replaceable_latest.insert(identity, event.created_at);
        }

        let _ = self.tx.send(SubscriptionEvent::Event {
            relay: origin.relay_url().map(str::to_string),
            event,
            from_cache,
            optimistic,
        });
    }

    /// Sampled signature verification. Returns `false` if the event must be
    /// dropped.
    fn verify(&self, event: &Event, relay: &Relay) -> bool {
        let manager = self.ctx.pool.manager();
        if manager.is_verified(&event.id) {
            relay.add_non_validated_event();
            return true;
        }
        if !relay.should_validate_event() {
            relay.add_non_validated_event();
            return true;
        }

        match verify_event(event) {
            Ok(true) => {
                manager.record_verified(&event.id, &event.sig);
                relay.add_validated_event();
                true
            }
            Ok(false) | Err(_) => {
                self.report_invalid_signature(event, relay);
                false
            }
        }
    }

    fn duplicate_received(&self, event: &Event, origin: EventOrigin<'_>, since_first_seen: Duration) {
        if let EventOrigin::Relay(relay) = origin {
            if !self.options.skip_verification
                && let Some(sig) = self.ctx.pool.manager().verified_sig(&event.id)
                && sig != event.sig
            {
                self.report_invalid_signature(event, relay);
                return;
            }
            if !self.options.dont_save_to_cache
                && let Some(cache) = &self.ctx.cache
            {
                cache.set_event_dup(event, relay.url());
            }
        }

        let mut state = self.state.lock();
        state.last_event_received_at = Some(Instant::now());
        if self.is_stopped() {
            return;
        }
        let _ = self.tx.send(SubscriptionEvent::Duplicate {
            event_id: event.id.clone(),
            relay: origin.relay_url().map(str::to_string),
            since_first_seen,
        });
    }

    fn report_invalid_signature(&self, event: &Event, relay: &Relay) {
        warn!("Invalid signature on event {} from {}", event.id, relay.url());
        if let Some(notifications) = &self.ctx.notifications {
            let _ = notifications.send(ClientNotification::InvalidSignature {
                event: Box::new(event.clone()),
                relay: relay.url().to_string(),
            });
        }
        if self.ctx.config.evict_on_invalid_signature {
            self.ctx.pool.blacklist_relay(relay.url());
        }
    }

    fn eose_received_from(&self, url: &str) {
        let action = {
            let mut state = self.state.lock();
            if self.is_stopped() || state.eose_emitted {
                return;
            }
            state.eosed.insert(url.to_string());

            let all_eosed = state.relay_filters.keys().all(|u| state.eosed.contains(u));
            let filled = !self.filters.is_empty()
                && self.filters.iter().all(|f| {
                    f.ids.as_ref().is_some_and(|ids| {
                        !ids.is_empty() && ids.iter().all(|id| state.event_first_seen.contains_key(id))
                    })
                });

            if all_eosed || filled {
                EoseAction::Now
            } else {
                let connected = state
                    .relay_filters
                    .keys()
                    .filter(|u| state.relays.get(*u).is_some_and(Relay::is_connected))
                    .count();
                let seen = state.eosed.len();
                let config = &self.ctx.config.eose;
                if connected == 0 {
                    EoseAction::None
                } else {
                    let fraction = seen as f64 / connected as f64;
                    if seen >= config.min_relays && fraction >= config.min_fraction {
                        let wait = (config.base_wait_ms as f64 * (1.0 - fraction).max(0.0)) as u64;
                        if wait == 0 {
                            EoseAction::Now
                        } else {
                            EoseAction::After(Duration::from_millis(wait))
                        }
                    } else {
                        EoseAction::None
                    }
                }
            }
        };

        match action {
            EoseAction::Now => self.perform_eose(),
            EoseAction::After(wait) => self.arm_eose_timer(wait),
            EoseAction::None => {}
        }
    }

    fn arm_eose_timer(&self, wait: Duration) {
        let guard = Duration::from_millis(self.ctx.config.eose.streaming_guard_ms);
        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(wait).await;
                let Some(inner) = weak.upgrade() else { return };
                let streaming = inner
                    .state
                    .lock()
                    .last_event_received_at
                    .is_some_and(|at| at.elapsed() < guard);
                // Still streaming: wait out the same decayed interval again
                if streaming {
                    continue;
                }
                inner.perform_eose();
                return;
            }
        });

        let mut state = self.state.lock();
        if let Some(old) = state.eose_timer.replace(handle) {
            old.abort();
        }
    }

    fn perform_eose(&self) {
        {
            let mut state = self.state.lock();
            if state.eose_emitted || self.is_stopped() {
                return;
            }
            state.eose_emitted = true;
            if let Some(timer) = state.eose_timer.take() {
                timer.abort();
            }
            let _ = self.tx.send(SubscriptionEvent::Eose);
        }

        if self.options.close_on_eose {
            self.stop();
        }
    }

    fn stop(&self) {
        let (relays, tasks) = {
            let mut state = self.state.lock();
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            let relays: Vec<Relay> = state.relays.values().cloned().collect();
            let tasks: Vec<JoinHandle<()>> = [
                state.eose_timer.take(),
                state.monitor.take(),
                state.cache_task.take(),
            ]
            .into_iter()
            .flatten()
            .collect();
            (relays, tasks)
        };

        for task in tasks {
            task.abort();
        }
        for relay in relays {
            relay.remove_subscription_item(self.id);
        }
        self.ctx.pool.manager().remove(self.id);
        let _ = self.tx.send(SubscriptionEvent::Close);
        debug!("Subscription {} stopped", self.id);

        if let Some(on_stopped) = &self.options.on_stopped {
            on_stopped();
        }
    }
}

enum EoseAction {
    Now,
    After(Duration),
    None,
}

impl RelaySubscriber for SubscriptionInner {
    fn on_eose(&self, relay: &Relay) {
        trace!("EOSE from {} for subscription {}", relay.url(), self.id);
        self.eose_received_from(relay.url());
    }

    fn on_closed(&self, relay: &Relay, reason: &str) {
        {
            let mut state = self.state.lock();
            if self.is_stopped() {
                return;
            }
            state.relays.remove(relay.url());
            let _ = self.tx.send(SubscriptionEvent::Closed {
                relay: relay.url().to_string(),
                reason: reason.to_string(),
            });
        }
        self.eose_received_from(relay.url());
    }
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stream of [`SubscriptionEvent`]s. Ends after `Close`.
pub struct SubscriptionStream {
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    done: bool,
    _subscription: Subscription,
}

impl SubscriptionStream {
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        if matches!(event, Some(SubscriptionEvent::Close) | None) {
            self.done = true;
        }
        event
    }
}

impl Stream for SubscriptionStream {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(SubscriptionEvent::Close) | None) = &polled {
            self.done = true;
        }
        polled
    }
}

//! The client: one pool, one subscription registry, one notification stream.

use crate::auth::AuthPolicy;
use crate::cache::CacheAdapter;
use crate::config::ClientConfig;
use crate::error::{ClientError, PublishError, Result};
use crate::filter::process_filters;
use crate::message::Filter;
use crate::normalize::try_normalize_relay_url;
use crate::outbox::{OutboxModel, RelaySelector};
use crate::pool::{PoolNotification, RelayPool, WeakPool};
use crate::relay::Relay;
use crate::relay_set::RelaySet;
use crate::signer::Signer;
use crate::subscription::{
    MuteFilter, Subscription, SubscriptionContext, SubscriptionEvent, SubscriptionOptions,
};
use dashmap::DashMap;
use indexmap::IndexSet;
use nostr::{
    Event, EventTemplate, RELAY_LIST_METADATA_KIND, RelayInformation, RelayListMetadata,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Publish statuses kept, oldest forgotten first
const MAX_PUBLISH_STATUSES: usize = 1000;

/// Relay hints taken from an event's tags when picking publish relays
const MAX_TAG_HINTS: usize = 5;

/// Below this many `p` tags the tagged users' read relays are included
const MAX_P_TAGS_FOR_INBOX: usize = 5;

/// Process-wide notifications.
#[derive(Debug, Clone)]
pub enum ClientNotification {
    Published {
        event_id: String,
        relays: HashSet<String>,
    },
    PublishFailed {
        event_id: String,
        error: PublishError,
    },
    /// A sampled signature did not verify
    InvalidSignature { event: Box<Event>, relay: String },
    RelayConnect { url: String },
    RelayDisconnect { url: String },
    Flapping { url: String, backoff: Duration },
    Notice { url: String, message: String },
    AuthRequested { url: String, challenge: String },
    Authed { url: String },
    /// Periodic per-relay verification counters
    ValidationStats(Vec<RelayValidationStats>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayValidationStats {
    pub url: String,
    pub validated: u64,
    pub non_validated: u64,
    pub target_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    Pending,
    Success,
    Error,
}

/// Builder for [`NostrClient`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    cache: Option<Arc<dyn CacheAdapter>>,
    signer: Option<Arc<dyn Signer>>,
    auth_policy: Option<Arc<dyn AuthPolicy>>,
    selector: Option<Arc<dyn RelaySelector>>,
    mute_filter: Option<MuteFilter>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Default auth policy for every relay.
    pub fn auth_policy(mut self, policy: Arc<dyn AuthPolicy>) -> Self {
        self.auth_policy = Some(policy);
        self
    }

    /// Replaces the built-in outbox model.
    pub fn relay_selector(mut self, selector: Arc<dyn RelaySelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn mute_filter(mut self, mute: MuteFilter) -> Self {
        self.mute_filter = Some(mute);
        self
    }

    pub fn build(self) -> NostrClient {
        let pool = RelayPool::with_cache(self.config.clone(), self.cache.clone());
        pool.set_auth_policy(self.auth_policy);
        pool.set_signer(self.signer.clone());

        let selector = self.selector.or_else(|| {
            self.config
                .enable_outbox_model
                .then(|| Arc::new(OutboxModel::new()) as Arc<dyn RelaySelector>)
        });
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        NostrClient {
            inner: Arc::new(ClientInner {
                config: Arc::new(self.config),
                pool,
                cache: self.cache,
                selector,
                signer: RwLock::new(self.signer),
                mute_filter: RwLock::new(self.mute_filter),
                notifications,
                publish_status: DashMap::new(),
                publish_order: Mutex::new(VecDeque::new()),
                background_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

struct ClientInner {
    config: Arc<ClientConfig>,
    pool: RelayPool,
    cache: Option<Arc<dyn CacheAdapter>>,
    selector: Option<Arc<dyn RelaySelector>>,
    signer: RwLock<Option<Arc<dyn Signer>>>,
    mute_filter: RwLock<Option<MuteFilter>>,
    notifications: broadcast::Sender<ClientNotification>,
    publish_status: DashMap<String, PublishStatus>,
    publish_order: Mutex<VecDeque<String>>,
    background_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Nostr client. Cheap to clone.
#[derive(Clone)]
pub struct NostrClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for NostrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NostrClient")
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl NostrClient {
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder::new().config(config).build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn pool(&self) -> &RelayPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn notifications(&self) -> broadcast::Receiver<ClientNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn add_relay(&self, url: &str) -> Result<Relay> {
        self.inner.pool.add_relay(url, true)
    }

    pub async fn remove_relay(&self, url: &str) -> bool {
        self.inner.pool.remove_relay(url).await
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        *self.inner.signer.write() = signer.clone();
        self.inner.pool.set_signer(signer);
    }

    pub fn signer(&self) -> Option<Arc<dyn Signer>> {
        self.inner.signer.read().clone()
    }

    pub fn set_mute_filter(&self, mute: Option<MuteFilter>) {
        *self.inner.mute_filter.write() = mute;
    }

    /// Connect the pool. Partial connectivity counts as success; returns
    /// the number of connected relays.
    pub async fn connect(&self, timeout: Option<Duration>) -> usize {
        self.start_background_tasks();
        let connected = self.inner.pool.connect(timeout).await;

        if self.inner.config.auto_connect_user_relays
            && let Some(signer) = self.signer()
        {
            let client = self.clone();
            self.track(tokio::spawn(async move {
                if let Err(e) = client.connect_user_relays(signer).await {
                    debug!("Could not load the user's relay list: {}", e);
                }
            }));
        }
        connected
    }

    pub async fn disconnect(&self) {
        self.inner.pool.disconnect().await;
    }

    async fn connect_user_relays(&self, signer: Arc<dyn Signer>) -> Result<()> {
        let pubkey = signer.public_key().await?;
        let lists = self.fetch_relay_lists(&[pubkey.clone()]).await?;
        let Some(list) = lists.get(&pubkey) else {
            return Ok(());
        };
        let mut urls = list.read_relays();
        urls.extend(list.write_relays());
        for url in urls {
            if let Err(e) = self.inner.pool.add_relay(&url, true) {
                debug!("Skipping user relay {}: {}", url, e);
            }
        }
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn start_background_tasks(&self) {
        if self.inner.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.track(spawn_forwarder(
            self.inner.pool.notifications(),
            self.inner.notifications.clone(),
        ));

        if let Some(ms) = self.inner.config.validation_stats_interval_ms {
            self.track(spawn_stats_reporter(
                self.inner.pool.downgrade(),
                self.inner.notifications.clone(),
                Duration::from_millis(ms),
            ));
        }
    }

    fn context(&self) -> SubscriptionContext {
        SubscriptionContext {
            pool: self.inner.pool.clone(),
            cache: self.inner.cache.clone(),
            selector: self.inner.selector.clone(),
            mute_filter: self.inner.mute_filter.read().clone(),
            notifications: Some(self.inner.notifications.clone()),
            config: self.inner.config.clone(),
        }
    }

    /// Create a subscription without starting it.
    pub fn subscription(&self, filters: Vec<Filter>, options: SubscriptionOptions) -> Result<Subscription> {
        let filters = process_filters(filters, self.inner.config.filter_validation_mode)?;
        Subscription::new(filters, options, self.context())
    }

    /// Create and start a subscription.
    pub async fn subscribe(&self, filters: Vec<Filter>, options: SubscriptionOptions) -> Result<Subscription> {
        self.start_background_tasks();
        let subscription = self.subscription(filters, options)?;
        subscription.start().await?;
        Ok(subscription)
    }

    /// Run a one-shot query and collect everything up to EOSE.
    pub async fn fetch_events(&self, filters: Vec<Filter>, options: SubscriptionOptions) -> Result<Vec<Event>> {
        let options = SubscriptionOptions {
            close_on_eose: true,
            ..options
        };
        let subscription = self.subscription(filters, options)?;
        let mut stream = subscription
            .take_stream()
            .ok_or_else(|| ClientError::Subscription("stream already taken".to_string()))?;
        subscription.start().await?;

        let mut events = Vec::new();
        while let Some(item) = stream.next_event().await {
            match item {
                SubscriptionEvent::Event { event, .. } => events.push(event),
                SubscriptionEvent::Eose | SubscriptionEvent::Close => break,
                _ => {}
            }
        }
        Ok(events)
    }

    /// Newest event matching `filter`.
    pub async fn fetch_event(&self, filter: Filter, options: SubscriptionOptions) -> Result<Option<Event>> {
        let events = self.fetch_events(vec![filter], options).await?;
        Ok(events.into_iter().max_by_key(|e| e.created_at))
    }

    /// Newest NIP-65 relay list of each pubkey. Lists are handed to the
    /// relay selector.
    pub async fn fetch_relay_lists(&self, pubkeys: &[String]) -> Result<HashMap<String, RelayListMetadata>> {
        let filter = Filter::new()
            .kinds(vec![RELAY_LIST_METADATA_KIND])
            .authors(pubkeys.to_vec());
        let events = self
            .fetch_events(vec![filter], SubscriptionOptions::default())
            .await?;

        let mut newest: HashMap<String, Event> = HashMap::new();
        for event in events {
            if newest
                .get(&event.pubkey)
                .is_none_or(|current| current.created_at < event.created_at)
            {
                newest.insert(event.pubkey.clone(), event);
            }
        }

        let mut lists = HashMap::new();
        for (pubkey, event) in newest {
            if let Some(selector) = &self.inner.selector {
                selector.update_relay_list(&event);
            }
            match RelayListMetadata::from_event(&event) {
                Ok(list) => {
                    lists.insert(pubkey, list);
                }
                Err(e) => warn!("Ignoring malformed relay list {}: {}", event.id, e),
            }
        }
        Ok(lists)
    }

    /// Relays an event should go to: the author's write relays, relay hints
    /// on referenced events, tagged users' read relays (for events with few
    /// `p` tags) and every permanently connected relay.
    pub fn calculate_relay_set_from_event(&self, event: &Event) -> Result<RelaySet> {
        let mut urls: IndexSet<String> = IndexSet::new();

        if let Some(selector) = &self.inner.selector {
            urls.extend(selector.write_relays(&event.pubkey));
        }

        let hints = event
            .tags
            .iter()
            .filter(|tag| matches!(tag.first().map(String::as_str), Some("e" | "a")))
            .filter_map(|tag| tag.get(2))
            .filter(|hint| hint.starts_with("wss://"))
            .filter_map(|hint| try_normalize_relay_url(hint))
            .take(MAX_TAG_HINTS);
        urls.extend(hints);

        let tagged: Vec<&str> = event.tag_values("p").collect();
        if tagged.len() < MAX_P_TAGS_FOR_INBOX
            && let Some(selector) = &self.inner.selector
        {
            for pubkey in tagged {
                urls.extend(selector.read_relays(pubkey));
            }
        }

        urls.extend(self.inner.pool.permanent_and_connected_urls());
        if urls.is_empty() {
            urls.extend(self.inner.pool.explicit_urls());
        }

        let urls: Vec<String> = urls.into_iter().collect();
        RelaySet::from_urls(&urls, &self.inner.pool)
    }

    pub fn publish_status(&self, event_id: &str) -> Option<PublishStatus> {
        self.inner.publish_status.get(event_id).map(|s| *s)
    }

    fn set_publish_status(&self, event_id: &str, status: PublishStatus) {
        if self
            .inner
            .publish_status
            .insert(event_id.to_string(), status)
            .is_some()
        {
            return;
        }
        let mut order = self.inner.publish_order.lock();
        order.push_back(event_id.to_string());
        while order.len() > MAX_PUBLISH_STATUSES {
            if let Some(oldest) = order.pop_front() {
                self.inner.publish_status.remove(&oldest);
            }
        }
    }

    /// Publish a signed event.
    ///
    /// Goes to `relay_set` or, without one, to the relays computed from the
    /// event. Fails when fewer than `required` relays accepted it.
    /// Subscriptions see the event at once, flagged optimistic.
    pub async fn publish(
        &self,
        event: Event,
        relay_set: Option<&RelaySet>,
        timeout: Option<Duration>,
        required: usize,
    ) -> Result<HashSet<String>> {
        let computed;
        let relay_set = match relay_set {
            Some(set) => set,
            None => {
                computed = self.calculate_relay_set_from_event(&event)?;
                &computed
            }
        };
        let timeout = timeout.unwrap_or(self.inner.config.publish_timeout());

        self.set_publish_status(&event.id, PublishStatus::Pending);
        if !event.is_ephemeral()
            && let Some(cache) = &self.inner.cache
        {
            cache.set_event(&event, &[], None);
        }
        self.inner
            .pool
            .manager()
            .dispatch_event(event.clone(), None, true);

        info!(
            "Publishing {} to {} relays ({} required)",
            event.id,
            relay_set.size(),
            required
        );
        match relay_set.publish(&event, timeout, required).await {
            Ok(relays) => {
                // An ephemeral event nobody took stays pending
                if !(relays.is_empty() && event.is_ephemeral()) {
                    self.set_publish_status(&event.id, PublishStatus::Success);
                }
                let _ = self.inner.notifications.send(ClientNotification::Published {
                    event_id: event.id.clone(),
                    relays: relays.clone(),
                });
                Ok(relays)
            }
            Err(error) => {
                self.set_publish_status(&event.id, PublishStatus::Error);
                let _ = self.inner.notifications.send(ClientNotification::PublishFailed {
                    event_id: event.id.clone(),
                    error: error.clone(),
                });
                Err(ClientError::Publish(error))
            }
        }
    }

    pub async fn sign(&self, template: EventTemplate) -> Result<Event> {
        let signer = self.signer().ok_or(ClientError::NoSigner)?;
        signer.sign(template).await
    }

    pub async fn sign_and_publish(&self, template: EventTemplate, required: usize) -> Result<(Event, HashSet<String>)> {
        let event = self.sign(template).await?;
        let relays = self.publish(event.clone(), None, None, required).await?;
        Ok((event, relays))
    }

    /// NIP-45 COUNT. Asks every connected relay (or `relay_urls`) and
    /// returns the largest answer.
    pub async fn count(&self, filters: Vec<Filter>, relay_urls: Option<&[String]>, timeout: Duration) -> Result<u64> {
        let filters = process_filters(filters, self.inner.config.filter_validation_mode)?;
        let relays: Vec<Relay> = match relay_urls {
            Some(urls) => urls.iter().filter_map(|url| self.inner.pool.relay(url)).collect(),
            None => self.inner.pool.connected_relays(),
        };
        if relays.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let answers = futures::future::join_all(
            relays.iter().map(|relay| relay.count(filters.clone(), timeout)),
        )
        .await;

        let mut best = None;
        let mut last_error = None;
        for answer in answers {
            match answer {
                Ok(count) => best = Some(best.map_or(count, |b: u64| b.max(count))),
                Err(e) => last_error = Some(e),
            }
        }
        match (best, last_error) {
            (Some(count), _) => Ok(count),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ClientError::NotConnected),
        }
    }

    pub async fn fetch_relay_info(&self, url: &str, force: bool) -> Result<RelayInformation> {
        let relay = self.inner.pool.get_relay(url, false, true)?;
        relay.fetch_info(force).await
    }

    /// Current per-relay verification counters.
    pub fn validation_stats(&self) -> Vec<RelayValidationStats> {
        collect_validation_stats(&self.inner.pool)
    }
}

fn collect_validation_stats(pool: &RelayPool) -> Vec<RelayValidationStats> {
    pool.relays()
        .into_iter()
        .map(|relay| {
            let (validated, non_validated, target_ratio) = relay.validation_stats();
            RelayValidationStats {
                url: relay.url().to_string(),
                validated,
                non_validated,
                target_ratio,
            }
        })
        .collect()
}

fn spawn_forwarder(
    mut pool: broadcast::Receiver<PoolNotification>,
    out: broadcast::Sender<ClientNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let notification = match pool.recv().await {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client lagged {} pool notifications", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let forwarded = match notification {
                PoolNotification::RelayConnect { url } => ClientNotification::RelayConnect { url },
                PoolNotification::RelayDisconnect { url } => {
                    ClientNotification::RelayDisconnect { url }
                }
                PoolNotification::Flapping { url, backoff } => {
                    ClientNotification::Flapping { url, backoff }
                }
                PoolNotification::Notice { url, message } => {
                    ClientNotification::Notice { url, message }
                }
                PoolNotification::AuthRequested { url, challenge } => {
                    ClientNotification::AuthRequested { url, challenge }
                }
                PoolNotification::Authed { url } => ClientNotification::Authed { url },
                _ => continue,
            };
            let _ = out.send(forwarded);
        }
    })
}

fn spawn_stats_reporter(
    pool: WeakPool,
    out: broadcast::Sender<ClientNotification>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(pool) = pool.upgrade() else { break };
            let stats = collect_validation_stats(&pool);
            for s in &stats {
                info!(
                    "Relay {} validated {} / skipped {} events (target ratio {:?})",
                    s.url, s.validated, s.non_validated, s.target_ratio
                );
            }
            let _ = out.send(ClientNotification::ValidationStats(stats));
        }
    })
}

//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns every [`Relay`] the client knows about. It decides which
//! URLs may join, evicts temporary relays once idle, backs off flapping
//! relays and reconnects everything when the local network comes back.

use crate::auth::AuthPolicy;
use crate::cache::CacheAdapter;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::manager::SubscriptionManager;
use crate::normalize::normalize_relay_url;
use crate::relay::{Relay, RelayConfig, RelayNotification};
use crate::signer::Signer;
use crate::status::RelayStatus;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Events emitted by the relay pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolNotification {
    RelayConnect { url: String },
    /// Relay can take requests
    RelayReady { url: String },
    RelayDisconnect { url: String },
    /// `connect()` finished
    Connect,
    /// Relay was taken offline for `backoff`
    Flapping { url: String, backoff: Duration },
    Notice { url: String, message: String },
    /// Relay asked for auth and nobody answered
    AuthRequested { url: String, challenge: String },
    Authed { url: String },
    RelayRemoved { url: String },
    /// Most relays dropped at once; everything was reconnected
    SystemDisconnect,
}

/// Decides whether a URL may join the pool.
pub type ConnectionFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Snapshot of pool health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub connecting: usize,
    pub temporary: usize,
    pub flapping: usize,
}

struct PoolEntry {
    relay: Relay,
    temporary: bool,
    eviction: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl PoolEntry {
    fn shutdown(&mut self) {
        for task in [self.eviction.take(), self.watcher.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct PoolState {
    relays: IndexMap<String, PoolEntry>,
    blacklist: HashSet<String>,
    /// Current backoff of each flapping relay
    flapping: HashMap<String, Duration>,
    backoff_tasks: HashMap<String, JoinHandle<()>>,
    disconnects: VecDeque<Instant>,
    last_system_reset: Option<Instant>,
}

pub(crate) struct PoolInner {
    config: ClientConfig,
    relay_config: RelayConfig,
    state: Mutex<PoolState>,
    manager: Arc<SubscriptionManager>,
    cache: Option<Arc<dyn CacheAdapter>>,
    notifications: broadcast::Sender<PoolNotification>,
    connection_filter: RwLock<Option<ConnectionFilter>>,
    auth_policy: RwLock<Option<Arc<dyn AuthPolicy>>>,
    signer: RwLock<Option<Arc<dyn Signer>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for entry in state.relays.values_mut() {
            entry.shutdown();
        }
        for (_, task) in state.backoff_tasks.drain() {
            task.abort();
        }
    }
}

/// A pool of Nostr relay connections. Cheap to clone.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.urls())
            .finish()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl RelayPool {
    /// Create a pool holding the configured explicit relays. Nothing
    /// connects until [`RelayPool::connect`].
    pub fn new(config: ClientConfig) -> Self {
        Self::with_cache(config, None)
    }

    pub fn with_cache(config: ClientConfig, cache: Option<Arc<dyn CacheAdapter>>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let blacklist = config
            .blacklist_relay_urls
            .iter()
            .filter_map(|url| normalize_relay_url(url).ok())
            .collect();

        let pool = Self {
            inner: Arc::new(PoolInner {
                relay_config: RelayConfig::from(&config),
                config,
                state: Mutex::new(PoolState {
                    blacklist,
                    ..Default::default()
                }),
                manager: Arc::new(SubscriptionManager::new()),
                cache,
                notifications,
                connection_filter: RwLock::new(None),
                auth_policy: RwLock::new(None),
                signer: RwLock::new(None),
            }),
        };

        for url in pool.inner.config.explicit_relay_urls.clone() {
            if let Err(e) = pool.add_relay(&url, false) {
                warn!("Skipping explicit relay {}: {}", url, e);
            }
        }
        pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> Arc<SubscriptionManager> {
        self.inner.manager.clone()
    }

    pub fn cache(&self) -> Option<Arc<dyn CacheAdapter>> {
        self.inner.cache.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<PoolNotification> {
        self.inner.notifications.subscribe()
    }

    fn emit(&self, notification: PoolNotification) {
        let _ = self.inner.notifications.send(notification);
    }

    /// Only URLs the predicate accepts may join the pool.
    pub fn set_connection_filter(&self, filter: Option<ConnectionFilter>) {
        *self.inner.connection_filter.write() = filter;
    }

    /// Auth policy for every current and future relay.
    pub fn set_auth_policy(&self, policy: Option<Arc<dyn AuthPolicy>>) {
        *self.inner.auth_policy.write() = policy.clone();
        for relay in self.relays() {
            relay.set_auth_policy(policy.clone());
        }
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        *self.inner.signer.write() = signer.clone();
        for relay in self.relays() {
            relay.set_signer(signer.clone());
        }
    }

    /// Add a permanent relay. Idempotent on the normalized URL; a temporary
    /// relay added again this way becomes permanent.
    pub fn add_relay(&self, url: &str, connect: bool) -> Result<Relay> {
        self.admit(url, connect, false)
    }

    /// Look a relay up, adding it if unknown. Temporary relays are evicted
    /// after the configured idle time; every lookup renews the timer.
    pub fn get_relay(&self, url: &str, connect: bool, temporary: bool) -> Result<Relay> {
        let relay = self.admit(url, connect, temporary)?;
        if temporary {
            self.use_temporary_relay(&relay, self.inner.config.temporary_relay_ttl());
        }
        Ok(relay)
    }

    fn admit(&self, url: &str, connect: bool, temporary: bool) -> Result<Relay> {
        let url = normalize_relay_url(url)?;
        if url.contains("/npub1") {
            return Err(ClientError::InvalidUrl(format!(
                "{} looks like a profile link, not a relay",
                url
            )));
        }

        let (relay, created) = {
            let mut state = self.inner.state.lock();
            if state.blacklist.contains(&url) {
                return Err(ClientError::RelayRefused(format!("{} is blacklisted", url)));
            }

            match state.relays.get_mut(&url) {
                Some(entry) => {
                    if !temporary && entry.temporary {
                        debug!("Relay {} is now permanent", url);
                        entry.temporary = false;
                        if let Some(eviction) = entry.eviction.take() {
                            eviction.abort();
                        }
                    }
                    (entry.relay.clone(), false)
                }
                None => {
                    if let Some(filter) = self.inner.connection_filter.read().as_ref()
                        && !filter(&url)
                    {
                        return Err(ClientError::RelayRefused(format!(
                            "{} rejected by connection filter",
                            url
                        )));
                    }

                    let relay = Relay::with_config(
                        &url,
                        self.inner.relay_config.clone(),
                        Arc::downgrade(&self.inner.manager),
                        self.inner.cache.clone(),
                    )?;
                    relay.set_auth_policy(self.inner.auth_policy.read().clone());
                    relay.set_signer(self.inner.signer.read().clone());
                    state.relays.insert(
                        url.clone(),
                        PoolEntry {
                            relay: relay.clone(),
                            temporary,
                            eviction: None,
                            watcher: None,
                        },
                    );
                    (relay, true)
                }
            }
        };

        if created {
            debug!("Added relay {} to pool (temporary: {})", url, temporary);
        }
        if connect && relay.status().can_connect() {
            self.spawn_connect(relay.clone());
        }
        Ok(relay)
    }

    /// Start (or renew) the idle eviction timer of a temporary relay.
    pub fn use_temporary_relay(&self, relay: &Relay, ttl: Duration) {
        let url = relay.url().to_string();
        let mut state = self.inner.state.lock();
        let Some(entry) = state.relays.get_mut(&url) else {
            return;
        };
        if !entry.temporary {
            return;
        }
        if let Some(old) = entry.eviction.take() {
            old.abort();
        }

        let pool = Arc::downgrade(&self.inner);
        entry.eviction = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = pool.upgrade() else { return };
            let pool = RelayPool { inner };
            let still_temporary = pool
                .inner
                .state
                .lock()
                .relays
                .get(&url)
                .is_some_and(|e| e.temporary);
            if still_temporary {
                debug!("Evicting idle temporary relay {}", url);
                pool.remove_relay(&url).await;
            }
        }));
    }

    /// Remove a relay and close its connection.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let Some(relay) = self.detach(url) else {
            return false;
        };
        relay.disconnect().await;
        info!("Removed relay {} from pool", relay.url());
        self.emit(PoolNotification::RelayRemoved {
            url: relay.url().to_string(),
        });
        true
    }

    fn detach(&self, url: &str) -> Option<Relay> {
        let url = normalize_relay_url(url).ok()?;
        let mut state = self.inner.state.lock();
        let mut entry = state.relays.shift_remove(&url)?;
        entry.shutdown();
        state.flapping.remove(&url);
        if let Some(task) = state.backoff_tasks.remove(&url) {
            task.abort();
        }
        Some(entry.relay)
    }

    /// Refuse a URL from now on and drop it if present.
    pub fn blacklist_relay(&self, url: &str) {
        let Ok(url) = normalize_relay_url(url) else {
            return;
        };
        warn!("Blacklisting relay {}", url);
        self.inner.state.lock().blacklist.insert(url.clone());

        if let Some(relay) = self.detach(&url) {
            let pool = self.clone();
            tokio::spawn(async move {
                relay.disconnect().await;
                pool.emit(PoolNotification::RelayRemoved {
                    url: relay.url().to_string(),
                });
            });
        }
    }

    pub fn is_blacklisted(&self, url: &str) -> bool {
        normalize_relay_url(url)
            .map(|url| self.inner.state.lock().blacklist.contains(&url))
            .unwrap_or(false)
    }

    /// Connect every relay that is not connected yet.
    ///
    /// Returns once all attempts settled or `timeout` elapsed, whichever is
    /// first. Partial connectivity counts as ready. Returns the number of
    /// connected relays.
    pub async fn connect(&self, timeout: Option<Duration>) -> usize {
        let pending: Vec<Relay> = self
            .relays()
            .into_iter()
            .filter(|r| r.status().can_connect())
            .collect();

        info!(
            "Connecting to {} relays (timeout {:?})",
            pending.len(),
            timeout
        );
        let handles: Vec<JoinHandle<()>> = pending
            .into_iter()
            .map(|relay| self.spawn_connect(relay))
            .collect();

        let attempts = futures::future::join_all(handles);
        match timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, attempts).await.is_err() {
                    debug!("Pool connect timed out after {:?}", timeout);
                }
            }
            None => {
                attempts.await;
            }
        }

        let connected = self.connected_relays().len();
        info!("Pool ready with {}/{} relays connected", connected, self.len());
        self.emit(PoolNotification::Connect);
        connected
    }

    /// Connect a relay in the background, honoring a cached
    /// `dont_connect_before`.
    fn spawn_connect(&self, relay: Relay) -> JoinHandle<()> {
        self.ensure_watcher(&relay);

        let delay = self
            .inner
            .cache
            .as_ref()
            .and_then(|cache| cache.relay_status(relay.url()))
            .and_then(|record| record.dont_connect_before)
            .map(|at| Duration::from_millis(at.saturating_sub(unix_millis())))
            .unwrap_or_default();

        let cache = self.inner.cache.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!("Delaying connect to {} by {:?}", relay.url(), delay);
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = relay.connect(None, true).await {
                debug!("Connect to {} failed: {}", relay.url(), e);
                if let Some(cache) = cache {
                    let mut record = cache.relay_status(relay.url()).unwrap_or_default();
                    record.consecutive_failures += 1;
                    cache.update_relay_status(relay.url(), record);
                }
            }
        })
    }

    /// Forward the relay's lifecycle notifications into the pool.
    fn ensure_watcher(&self, relay: &Relay) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.relays.get_mut(relay.url()) else {
            return;
        };
        if entry.watcher.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }

        let mut notifications = relay.notifications();
        let pool = Arc::downgrade(&self.inner);
        let url = relay.url().to_string();
        entry.watcher = Some(tokio::spawn(async move {
            loop {
                let notification = match notifications.recv().await {
                    Ok(notification) => notification,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Pool lagged {} notifications from {}", skipped, url);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = pool.upgrade() else { break };
                RelayPool { inner }.on_relay_notification(&url, notification);
            }
        }));
    }

    fn on_relay_notification(&self, url: &str, notification: RelayNotification) {
        match notification {
            RelayNotification::Connect => {
                if let Some(cache) = &self.inner.cache {
                    let mut record = cache.relay_status(url).unwrap_or_default();
                    record.last_connected_at = Some(unix_millis());
                    record.consecutive_failures = 0;
                    record.dont_connect_before = None;
                    cache.update_relay_status(url, record);
                }
                self.emit(PoolNotification::RelayConnect { url: url.to_string() });
            }
            RelayNotification::Ready => {
                self.emit(PoolNotification::RelayReady { url: url.to_string() });
            }
            RelayNotification::Disconnect => {
                self.emit(PoolNotification::RelayDisconnect { url: url.to_string() });
                self.record_disconnect(Instant::now());
            }
            RelayNotification::Flapping(_) => self.handle_flapping(url),
            RelayNotification::Notice(message) => {
                self.emit(PoolNotification::Notice {
                    url: url.to_string(),
                    message,
                });
            }
            RelayNotification::AuthChallenge(challenge) => {
                self.emit(PoolNotification::AuthRequested {
                    url: url.to_string(),
                    challenge,
                });
            }
            RelayNotification::Authed => {
                self.emit(PoolNotification::Authed { url: url.to_string() });
            }
            _ => {}
        }
    }

    /// Take a flapping relay offline with exponential backoff. If most of
    /// the pool is flapping the problem is local: every backoff is dropped
    /// and all flapping relays reconnect at once.
    fn handle_flapping(&self, url: &str) {
        let config = &self.inner.config.flapping;
        let (backoff, reset_all) = {
            let mut state = self.inner.state.lock();
            if !state.relays.contains_key(url) {
                return;
            }
            let backoff = state
                .flapping
                .get(url)
                .map_or(Duration::from_millis(config.base_backoff_ms), |b| *b * 2);
            state.flapping.insert(url.to_string(), backoff);

            let total = state.relays.len();
            let ratio = state.flapping.len() as f64 / total as f64;
            if ratio >= config.mass_flapping_ratio {
                let urls: Vec<String> = state.flapping.drain().map(|(url, _)| url).collect();
                for url in &urls {
                    if let Some(task) = state.backoff_tasks.remove(url) {
                        task.abort();
                    }
                }
                (backoff, Some(urls))
            } else {
                (backoff, None)
            }
        };

        if let Some(urls) = reset_all {
            warn!(
                "{} relays flapping at once, resetting every backoff",
                urls.len()
            );
            for url in urls {
                if let Some(relay) = self.relay(&url) {
                    relay.reset_reconnection_state();
                    self.spawn_connect(relay);
                }
            }
            return;
        }

        warn!("Relay {} is flapping, backing off for {:?}", url, backoff);
        if let Some(cache) = &self.inner.cache {
            let mut record = cache.relay_status(url).unwrap_or_default();
            record.dont_connect_before = Some(unix_millis() + backoff.as_millis() as u64);
            cache.update_relay_status(url, record);
        }
        self.emit(PoolNotification::Flapping {
            url: url.to_string(),
            backoff,
        });

        let pool = Arc::downgrade(&self.inner);
        let target = url.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let Some(inner) = pool.upgrade() else { return };
            let pool = RelayPool { inner };
            pool.inner.state.lock().backoff_tasks.remove(&target);
            if let Some(relay) = pool.relay(&target) {
                relay.reset_reconnection_state();
                if let Err(e) = relay.connect(None, true).await {
                    debug!("Reconnect to {} after backoff failed: {}", target, e);
                }
            }
        });
        if let Some(old) = self
            .inner
            .state
            .lock()
            .backoff_tasks
            .insert(url.to_string(), task)
        {
            old.abort();
        }
    }

    /// Detect many relays dropping at once (sleep, network switch) and
    /// reconnect all of them immediately.
    fn record_disconnect(&self, now: Instant) {
        let config = &self.inner.config.system_disconnect;
        let retention = Duration::from_millis(config.retention_ms);
        let window = Duration::from_millis(config.window_ms);
        let cooldown = Duration::from_millis(config.cooldown_ms);

        let triggered = {
            let mut state = self.inner.state.lock();
            state.disconnects.push_back(now);
            while state
                .disconnects
                .front()
                .is_some_and(|at| now.saturating_duration_since(*at) > retention)
            {
                state.disconnects.pop_front();
            }

            let total = state.relays.len();
            let recent = state
                .disconnects
                .iter()
                .filter(|at| now.saturating_duration_since(**at) <= window)
                .count();
            let cooled_down = state
                .last_system_reset
                .is_none_or(|at| now.saturating_duration_since(at) >= cooldown);

            if total > 1 && recent * 2 > total && cooled_down {
                state.last_system_reset = Some(now);
                state.disconnects.clear();
                true
            } else {
                false
            }
        };

        if triggered {
            warn!("Most relays disconnected at once, reconnecting all");
            self.emit(PoolNotification::SystemDisconnect);
            for relay in self.relays() {
                relay.reset_reconnection_state();
                if relay.status().can_connect() {
                    self.spawn_connect(relay);
                }
            }
        }
    }

    /// Close every connection.
    pub async fn disconnect(&self) {
        let relays = self.relays();
        futures::future::join_all(relays.iter().map(Relay::disconnect)).await;
    }

    pub fn relay(&self, url: &str) -> Option<Relay> {
        let url = normalize_relay_url(url).ok()?;
        self.inner
            .state
            .lock()
            .relays
            .get(&url)
            .map(|e| e.relay.clone())
    }

    pub fn relays(&self) -> Vec<Relay> {
        self.inner
            .state
            .lock()
            .relays
            .values()
            .map(|e| e.relay.clone())
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.state.lock().relays.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// URLs of permanent (non-temporary) relays.
    pub fn explicit_urls(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .relays
            .iter()
            .filter(|(_, e)| !e.temporary)
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn connected_relays(&self) -> Vec<Relay> {
        self.relays().into_iter().filter(Relay::is_connected).collect()
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.connected_relays()
            .into_iter()
            .map(|r| r.url().to_string())
            .collect()
    }

    pub fn permanent_and_connected_relays(&self) -> Vec<Relay> {
        self.inner
            .state
            .lock()
            .relays
            .values()
            .filter(|e| !e.temporary && e.relay.is_connected())
            .map(|e| e.relay.clone())
            .collect()
    }

    pub fn permanent_and_connected_urls(&self) -> Vec<String> {
        self.permanent_and_connected_relays()
            .into_iter()
            .map(|r| r.url().to_string())
            .collect()
    }

    pub fn is_temporary(&self, url: &str) -> bool {
        normalize_relay_url(url)
            .map(|url| {
                self.inner
                    .state
                    .lock()
                    .relays
                    .get(&url)
                    .is_some_and(|e| e.temporary)
            })
            .unwrap_or(false)
    }

    /// Current backoff of a flapping relay.
    pub fn backoff(&self, url: &str) -> Option<Duration> {
        let url = normalize_relay_url(url).ok()?;
        self.inner.state.lock().flapping.get(&url).copied()
    }

    pub fn flapping_relays(&self) -> Vec<String> {
        self.inner.state.lock().flapping.keys().cloned().collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats {
            total: state.relays.len(),
            flapping: state.flapping.len(),
            ..Default::default()
        };
        for entry in state.relays.values() {
            if entry.temporary {
                stats.temporary += 1;
            }
            match entry.relay.status() {
                status if status.is_connected() => stats.connected += 1,
                RelayStatus::Connecting | RelayStatus::Reconnecting => stats.connecting += 1,
                _ => stats.disconnected += 1,
            }
        }
        stats
    }

    #[cfg(test)]
    pub(crate) fn notify_for_test(&self, url: &str, notification: RelayNotification) {
        self.on_relay_notification(url, notification);
    }
}

/// Non-owning pool handle for long-lived tasks.
#[derive(Clone)]
pub(crate) struct WeakPool(Weak<PoolInner>);

impl WeakPool {
    pub(crate) fn upgrade(&self) -> Option<RelayPool> {
        self.0.upgrade().map(|inner| RelayPool { inner })
    }
}

impl RelayPool {
    pub(crate) fn downgrade(&self) -> WeakPool {
        WeakPool(Arc::downgrade(&self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use pretty_assertions::assert_eq;

    fn pool_with(urls: &[&str]) -> RelayPool {
        RelayPool::new(ClientConfig {
            explicit_relay_urls: urls.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_explicit_relays_are_added() {
        let pool = pool_with(&["wss://a.example", "WSS://B.example/"]);
        assert_eq!(pool.urls(), vec!["wss://a.example/", "wss://b.example/"]);
        assert_eq!(pool.explicit_urls(), pool.urls());
        assert!(pool.connected_urls().is_empty());
    }

    #[test]
    fn test_add_relay_is_idempotent() {
        let pool = pool_with(&[]);
        let a = pool.add_relay("wss://a.example", false).unwrap();
        let again = pool.add_relay("wss://a.example/", false).unwrap();
        assert_eq!(a, again);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_admission_rules() {
        let pool = RelayPool::new(ClientConfig {
            blacklist_relay_urls: vec!["wss://bad.example".to_string()],
            ..Default::default()
        });

        assert!(matches!(
            pool.add_relay("wss://bad.example/", false),
            Err(ClientError::RelayRefused(_))
        ));
        assert!(matches!(
            pool.add_relay("wss://njump.example/npub1abc", false),
            Err(ClientError::InvalidUrl(_))
        ));

        pool.set_connection_filter(Some(Arc::new(|url: &str| !url.contains("onion"))));
        assert!(pool.add_relay("wss://hidden.onion", false).is_err());
        assert!(pool.add_relay("wss://fine.example", false).is_ok());
        assert!(pool.is_blacklisted("wss://bad.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_temporary_relay_eviction() {
        let pool = pool_with(&[]);
        let relay = pool.get_relay("wss://temp.example", false, true).unwrap();
        assert!(pool.is_temporary(relay.url()));
        assert!(pool.explicit_urls().is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        pool.get_relay("wss://temp.example", false, true).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(pool.relay("wss://temp.example").is_some());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(pool.relay("wss://temp.example").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_temporary_relay_made_permanent() {
        let pool = pool_with(&[]);
        pool.get_relay("wss://temp.example", false, true).unwrap();
        pool.add_relay("wss://temp.example", false).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(pool.relay("wss://temp.example").is_some());
        assert!(!pool.is_temporary("wss://temp.example"));
    }

    #[tokio::test]
    async fn test_remove_relay() {
        let pool = pool_with(&["wss://a.example"]);
        let mut notifications = pool.notifications();

        assert!(pool.remove_relay("wss://a.example").await);
        assert!(!pool.remove_relay("wss://a.example").await);
        assert!(pool.is_empty());
        assert_eq!(
            notifications.recv().await.unwrap(),
            PoolNotification::RelayRemoved {
                url: "wss://a.example/".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_backoff_doubles() {
        let pool = pool_with(&[
            "wss://a.example",
            "wss://b.example",
            "wss://c.example",
            "wss://d.example",
            "wss://e.example",
        ]);
        let mut notifications = pool.notifications();

        pool.handle_flapping("wss://a.example/");
        assert_eq!(pool.backoff("wss://a.example"), Some(Duration::from_secs(5)));
        pool.handle_flapping("wss://a.example/");
        assert_eq!(pool.backoff("wss://a.example"), Some(Duration::from_secs(10)));

        assert_eq!(
            notifications.recv().await.unwrap(),
            PoolNotification::Flapping {
                url: "wss://a.example/".to_string(),
                backoff: Duration::from_secs(5)
            }
        );
        assert_eq!(pool.flapping_relays(), vec!["wss://a.example/"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mass_flapping_resets_backoff() {
        let pool = pool_with(&["wss://a.example", "wss://b.example"]);

        pool.handle_flapping("wss://a.example/");
        assert_eq!(pool.backoff("wss://a.example"), Some(Duration::from_secs(5)));

        pool.handle_flapping("wss://b.example/");
        assert_eq!(pool.backoff("wss://a.example"), None);
        assert_eq!(pool.backoff("wss://b.example"), None);
        assert!(pool.flapping_relays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_disconnect_detection() {
        let pool = pool_with(&["wss://a.example", "wss://b.example", "wss://c.example"]);
        let mut notifications = pool.notifications();

        pool.notify_for_test("wss://a.example/", RelayNotification::Disconnect);
        pool.notify_for_test("wss://b.example/", RelayNotification::Disconnect);

        let mut seen = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            seen.push(notification);
        }
        assert!(seen.contains(&PoolNotification::SystemDisconnect));

        // cooldown
        pool.notify_for_test("wss://a.example/", RelayNotification::Disconnect);
        pool.notify_for_test("wss://c.example/", RelayNotification::Disconnect);
        while let Ok(notification) = notifications.try_recv() {
            assert_ne!(notification, PoolNotification::SystemDisconnect);
        }
    }

    #[test]
    fn test_single_disconnect_is_not_systemic() {
        let pool = pool_with(&["wss://a.example", "wss://b.example", "wss://c.example"]);
        let mut notifications = pool.notifications();
        pool.record_disconnect(Instant::now());

        assert!(notifications.try_recv().is_err());
        assert!(pool.inner.state.lock().last_system_reset.is_none());
    }

    #[tokio::test]
    async fn test_connect_records_relay_status() {
        let cache = Arc::new(MemoryCache::new());
        let pool = RelayPool::with_cache(ClientConfig::default(), Some(cache.clone()));
        pool.add_relay("wss://a.example", false).unwrap();

        pool.notify_for_test("wss://a.example/", RelayNotification::Connect);
        let record = cache.relay_status("wss://a.example/").unwrap();
        assert!(record.last_connected_at.is_some());
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_connect_with_no_relays_is_ready() {
        let pool = pool_with(&[]);
        let mut notifications = pool.notifications();
        assert_eq!(pool.connect(Some(Duration::from_millis(10))).await, 0);
        assert_eq!(notifications.recv().await.unwrap(), PoolNotification::Connect);
    }

    #[test]
    fn test_stats() {
        let pool = pool_with(&["wss://a.example", "wss://b.example"]);
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.disconnected, 2);
        assert_eq!(stats.connected, 0);
    }
}

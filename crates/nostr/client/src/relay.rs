//! Single relay connection
//!
//! A [`Relay`] owns one WebSocket and walks the connection state machine
//! described by [`RelayStatus`]. Lifecycle changes are broadcast as
//! [`RelayNotification`]s; the pool listens to them for flapping and
//! system-wide disconnect detection.

use crate::auth::{AuthDecision, AuthPolicy};
use crate::cache::CacheAdapter;
use crate::config::{ClientConfig, FlappingConfig};
use crate::error::{ClientError, Result};
use crate::grouping::GroupingState;
use crate::manager::SubscriptionManager;
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::normalize::normalize_relay_url;
use crate::pending::{PendingRequests, wait_for};
use crate::signer::Signer;
use crate::status::{ConnectionStats, RelayStatus};
use crate::validation::{ValidationRatioFn, ValidationSampler};
use futures::{SinkExt, StreamExt};
use nostr::{Event, RelayInformation, create_auth_template};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Capacity of the per-relay notification channel
const NOTIFICATION_CAPACITY: usize = 256;

/// How long `disconnect()` waits for the socket task to wind down
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle and protocol notifications of a relay.
#[derive(Debug, Clone)]
pub enum RelayNotification {
    /// Socket established
    Connect,
    /// Relay can take requests (after connect, and again after auth)
    Ready,
    Disconnect,
    Notice(String),
    /// Connection durations look like a flapping relay
    Flapping(ConnectionStats),
    /// A reconnect attempt was scheduled after this delay
    DelayedConnect(Duration),
    /// Challenge received and no auth policy is configured
    AuthChallenge(String),
    Authed,
    AuthFailed(String),
    Published { event_id: String },
    PublishFailed { event_id: String, error: String },
    /// Relay terminated a subscription
    Closed { sub_id: String, reason: String },
}

/// Acknowledgment of an EVENT or AUTH message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub success: bool,
    pub message: String,
}

/// Per-relay connection settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    /// Silence after which a ping is sent
    pub keepalive_interval: Duration,
    pub auth_timeout: Duration,
    pub flapping: FlappingConfig,
    pub initial_validation_ratio: f64,
    pub lowest_validation_ratio: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            flapping: FlappingConfig::default(),
            initial_validation_ratio: 1.0,
            lowest_validation_ratio: 0.1,
        }
    }
}

impl From<&ClientConfig> for RelayConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            flapping: config.flapping.clone(),
            initial_validation_ratio: config.initial_validation_ratio,
            lowest_validation_ratio: config.lowest_validation_ratio,
            ..Self::default()
        }
    }
}

pub(crate) struct RelayInner {
    url: String,
    config: RelayConfig,
    status: RwLock<RelayStatus>,
    stats: Mutex<ConnectionStats>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    notifications: broadcast::Sender<RelayNotification>,
    pub(crate) publishes: PendingRequests<String, PublishAck>,
    counts: PendingRequests<String, u64>,
    count_seq: AtomicU64,
    pub(crate) groups: Mutex<GroupingState>,
    auth_policy: RwLock<Option<Arc<dyn AuthPolicy>>>,
    signer: RwLock<Option<Arc<dyn Signer>>>,
    sampler: Mutex<ValidationSampler>,
    manager: Weak<SubscriptionManager>,
    pub(crate) info: Mutex<Option<(RelayInformation, Instant)>>,
    pub(crate) cache: Option<Arc<dyn CacheAdapter>>,
}

/// Handle to one relay connection. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    pub(crate) inner: Arc<RelayInner>,
}

/// Non-owning handle used by background tasks.
#[derive(Clone)]
pub(crate) struct WeakRelay(Weak<RelayInner>);

impl WeakRelay {
    pub(crate) fn upgrade(&self) -> Option<Relay> {
        self.0.upgrade().map(|inner| Relay { inner })
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.inner.url)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Relay {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Relay {
    /// Create a relay handle. Does not connect.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default(), Weak::new(), None)
    }

    pub(crate) fn with_config(
        url: &str,
        config: RelayConfig,
        manager: Weak<SubscriptionManager>,
        cache: Option<Arc<dyn CacheAdapter>>,
    ) -> Result<Self> {
        let url = normalize_relay_url(url)?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let sampler = ValidationSampler::new(config.initial_validation_ratio, config.lowest_validation_ratio);

        Ok(Self {
            inner: Arc::new(RelayInner {
                url,
                config,
                status: RwLock::new(RelayStatus::Disconnected),
                stats: Mutex::new(ConnectionStats::default()),
                outbound: Mutex::new(None),
                connection_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                notifications,
                publishes: PendingRequests::new(),
                counts: PendingRequests::new(),
                count_seq: AtomicU64::new(0),
                groups: Mutex::new(GroupingState::default()),
                auth_policy: RwLock::new(None),
                signer: RwLock::new(None),
                sampler: Mutex::new(sampler),
                manager,
                info: Mutex::new(None),
                cache,
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakRelay {
        WeakRelay(Arc::downgrade(&self.inner))
    }

    /// Normalized relay URL
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> RelayStatus {
        *self.inner.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.inner.stats.lock().clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.inner.notifications.subscribe()
    }

    pub(crate) fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub(crate) fn manager(&self) -> Option<Arc<SubscriptionManager>> {
        self.inner.manager.upgrade()
    }

    pub(crate) fn emit(&self, notification: RelayNotification) {
        let _ = self.inner.notifications.send(notification);
    }

    fn set_status(&self, status: RelayStatus) {
        *self.inner.status.write() = status;
    }

    /// Change status only while the socket is up, so a late auth result
    /// never resurrects a dropped connection.
    fn set_status_if_connected(&self, status: RelayStatus) -> bool {
        let mut current = self.inner.status.write();
        if current.is_connected() {
            *current = status;
            true
        } else {
            false
        }
    }

    pub fn set_auth_policy(&self, policy: Option<Arc<dyn AuthPolicy>>) {
        *self.inner.auth_policy.write() = policy;
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        *self.inner.signer.write() = signer;
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.inner.sampler.lock().set_trusted(trusted);
    }

    pub fn is_trusted(&self) -> bool {
        self.inner.sampler.lock().is_trusted()
    }

    pub fn set_validation_ratio_fn(&self, ratio_fn: ValidationRatioFn) {
        let mut sampler = self.inner.sampler.lock();
        let replaced = std::mem::replace(&mut *sampler, ValidationSampler::unconfigured());
        *sampler = replaced.with_ratio_fn(ratio_fn);
    }

    /// Probabilistic gate for signature verification of the next event.
    pub fn should_validate_event(&self) -> bool {
        self.inner.sampler.lock().should_validate()
    }

    pub fn add_validated_event(&self) {
        self.inner.sampler.lock().add_validated();
    }

    pub fn add_non_validated_event(&self) {
        self.inner.sampler.lock().add_non_validated();
    }

    /// `(validated, non_validated, target_ratio)`
    pub fn validation_stats(&self) -> (u64, u64, Option<f64>) {
        let sampler = self.inner.sampler.lock();
        (
            sampler.validated_count(),
            sampler.non_validated_count(),
            sampler.target_ratio(),
        )
    }

    /// Connect to the relay.
    ///
    /// Only starts from `Disconnected` or `Reconnecting` with no reconnect
    /// pending; otherwise returns immediately. The result reflects this
    /// attempt only. With `reconnect` set a failed attempt schedules
    /// background retries.
    pub async fn connect(&self, timeout: Option<Duration>, reconnect: bool) -> Result<()> {
        {
            let mut status = self.inner.status.write();
            let reconnect_pending = self
                .inner
                .reconnect_task
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished());
            if !status.can_connect() || reconnect_pending {
                debug!("Skipping connect to {} (status {})", self.inner.url, *status);
                return Ok(());
            }
            *status = RelayStatus::Connecting;
        }

        self.inner.stats.lock().record_attempt();
        let timeout = timeout.unwrap_or(self.inner.config.connect_timeout);
        info!("Connecting to relay: {}", self.inner.url);

        let connect_start = Instant::now();
        match tokio::time::timeout(timeout, connect_async(self.inner.url.as_str())).await {
            Ok(Ok((ws, _))) => {
                if self.status() != RelayStatus::Connecting {
                    debug!("Connection to {} abandoned during handshake", self.inner.url);
                    return Err(ClientError::NotConnected);
                }
                info!(
                    "Connected to relay: {} (took {:?})",
                    self.inner.url,
                    connect_start.elapsed()
                );
                self.on_connected(ws);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", self.inner.url, e);
                self.on_connect_failed(reconnect);
                Err(ClientError::WebSocket(e.to_string()))
            }
            Err(_) => {
                warn!("Connection to {} timed out after {:?}", self.inner.url, timeout);
                self.on_connect_failed(reconnect);
                Err(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    timeout
                )))
            }
        }
    }

    fn on_connect_failed(&self, reconnect: bool) {
        {
            let mut status = self.inner.status.write();
            if *status == RelayStatus::Connecting {
                *status = RelayStatus::Disconnected;
            }
        }
        if reconnect {
            self.handle_reconnection(0);
        }
    }

    fn on_connected<S>(&self, ws: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        self.set_status(RelayStatus::Connected);
        self.inner.stats.lock().record_success(Instant::now());

        let handle = tokio::spawn(run_connection(
            self.downgrade(),
            self.inner.url.clone(),
            self.inner.config.keepalive_interval,
            ws,
            rx,
        ));
        *self.inner.connection_task.lock() = Some(handle);

        self.emit(RelayNotification::Connect);
        self.emit(RelayNotification::Ready);
        self.execute_waiting_groups();
    }

    /// Called once the socket task has ended, for any reason.
    fn on_disconnected(&self) {
        let previous = {
            let mut status = self.inner.status.write();
            let previous = *status;
            if previous == RelayStatus::Disconnected {
                return;
            }
            *status = RelayStatus::Disconnected;
            previous
        };

        self.inner.stats.lock().record_disconnect(Instant::now());
        *self.inner.outbound.lock() = None;
        self.inner.publishes.clear();
        self.inner.counts.clear();
        self.on_connection_lost();

        info!("Disconnected from relay: {}", self.inner.url);
        self.emit(RelayNotification::Disconnect);

        if previous.is_connected() {
            self.handle_reconnection(0);
        }
    }

    /// Schedule a reconnect, unless one is already pending or the relay is
    /// flapping (the pool owns flapping backoff).
    pub(crate) fn handle_reconnection(&self, attempt: u32) {
        if self
            .inner
            .reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            return;
        }

        let now = Instant::now();
        let delay = {
            let mut stats = self.inner.stats.lock();
            if stats.is_flapping(self.inner.config.flapping.stddev_threshold_ms) {
                let snapshot = stats.clone();
                drop(stats);
                warn!("Relay {} is flapping", self.inner.url);
                self.set_status(RelayStatus::Flapping);
                self.emit(RelayNotification::Flapping(snapshot));
                return;
            }
            let delay = stats.reconnect_delay(now, &self.inner.config.flapping);
            stats.next_reconnect_at = Some(now + delay);
            delay
        };

        debug!(
            "Reconnecting to {} in {:?} (attempt {})",
            self.inner.url, delay, attempt
        );
        let weak = self.downgrade();
        let max_attempts = self.inner.config.flapping.max_reconnect_attempts;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(relay) = weak.upgrade() else { return };
            relay.inner.reconnect_task.lock().take();
            {
                let mut status = relay.inner.status.write();
                if *status != RelayStatus::Disconnected {
                    return;
                }
                *status = RelayStatus::Reconnecting;
            }

            if relay.connect(None, false).await.is_err() {
                if attempt < max_attempts {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
                    relay.handle_reconnection(attempt + 1);
                } else {
                    debug!("Giving up reconnecting to {}", relay.inner.url);
                }
            }
        });
        *self.inner.reconnect_task.lock() = Some(handle);
        self.emit(RelayNotification::DelayedConnect(delay));
    }

    /// Drop pending reconnect state so the next `connect()` runs at once.
    pub fn reset_reconnection_state(&self) {
        if let Some(handle) = self.inner.reconnect_task.lock().take() {
            handle.abort();
        }
        self.inner.stats.lock().reset_reconnect_state();
        let mut status = self.inner.status.write();
        if matches!(*status, RelayStatus::Reconnecting | RelayStatus::Flapping) {
            *status = RelayStatus::Disconnected;
        }
    }

    /// Close the connection. No reconnect follows.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.inner.reconnect_task.lock().take() {
            handle.abort();
        }

        {
            let mut status = self.inner.status.write();
            if *status == RelayStatus::Disconnected {
                return;
            }
            *status = RelayStatus::Disconnecting;
        }

        info!("Disconnecting from relay: {}", self.inner.url);
        if let Some(tx) = self.inner.outbound.lock().as_ref() {
            let _ = tx.send(Message::Close(None));
        }

        let task = self.inner.connection_task.lock().take();
        if let Some(mut handle) = task
            && tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err()
        {
            warn!("Relay {} did not close in time, aborting", self.inner.url);
            handle.abort();
        }

        if self.status() != RelayStatus::Disconnected {
            self.on_disconnected();
        }
    }

    /// Send a message. Fails with `NotConnected` when the socket is down.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            debug!(
                "Not sending {} to {}: not connected",
                message.verb(),
                self.inner.url
            );
            return Err(ClientError::NotConnected);
        }

        let json = message.to_json()?;
        debug!("Sending {} to {}", message.verb(), self.inner.url);
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(Message::Text(json.into()))
                .map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Send REQ for a subscription id.
    pub(crate) fn req(&self, sub_id: &str, filters: Vec<Filter>) -> Result<()> {
        self.send(ClientMessage::Req {
            subscription_id: sub_id.to_string(),
            filters,
        })
    }

    pub(crate) fn close_subscription(&self, sub_id: &str) {
        if let Err(e) = self.send(ClientMessage::Close {
            subscription_id: sub_id.to_string(),
        }) {
            debug!("Could not close {} on {}: {}", sub_id, self.inner.url, e);
        }
    }

    fn handle_text(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring malformed message from {}: {}", self.inner.url, e);
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.on_subscription_event(&subscription_id, event),
            RelayMessage::Eose { subscription_id } => self.on_subscription_eose(&subscription_id),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                debug!(
                    "Relay {} closed subscription {}: {}",
                    self.inner.url, subscription_id, message
                );
                self.on_subscription_closed(&subscription_id, &message);
                self.emit(RelayNotification::Closed {
                    sub_id: subscription_id,
                    reason: message,
                });
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                let ack = PublishAck { success, message };
                if !self.inner.publishes.resolve(&event_id, ack) {
                    debug!("Unexpected OK for {} from {}", event_id, self.inner.url);
                }
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", self.inner.url, message);
                self.emit(RelayNotification::Notice(message));
            }
            RelayMessage::Auth { challenge } => self.on_auth_challenge(challenge),
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                if !self.inner.counts.resolve(&subscription_id, count) {
                    debug!("Unexpected COUNT {} from {}", subscription_id, self.inner.url);
                }
            }
        }
    }

    fn on_auth_challenge(&self, challenge: String) {
        {
            let mut status = self.inner.status.write();
            if *status == RelayStatus::Authenticating {
                debug!("Already authenticating with {}, ignoring challenge", self.inner.url);
                return;
            }
            if status.is_connected() {
                *status = RelayStatus::AuthRequested;
            }
        }

        let policy = self.inner.auth_policy.read().clone();
        let Some(policy) = policy else {
            debug!("Auth challenge from {} with no policy", self.inner.url);
            self.emit(RelayNotification::AuthChallenge(challenge));
            return;
        };

        self.set_status_if_connected(RelayStatus::Authenticating);
        let relay = self.clone();
        tokio::spawn(async move {
            relay.run_auth_policy(policy, challenge).await;
        });
    }

    async fn run_auth_policy(&self, policy: Arc<dyn AuthPolicy>, challenge: String) {
        let decision = match policy.on_challenge(&self.inner.url, &challenge).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Auth policy for {} failed: {}", self.inner.url, e);
                AuthDecision::Reject
            }
        };

        let event = match decision {
            AuthDecision::Event(event) => event,
            AuthDecision::Accept => match self.sign_auth(&challenge).await {
                Ok(event) => event,
                Err(e) => {
                    self.auth_failed(e.to_string());
                    return;
                }
            },
            AuthDecision::Reject => {
                self.auth_failed("auth policy rejected the challenge".to_string());
                return;
            }
        };

        if let Err(e) = self.authenticate(event).await {
            debug!("Authentication with {} failed: {}", self.inner.url, e);
        }
    }

    async fn sign_auth(&self, challenge: &str) -> Result<Event> {
        let signer = self.inner.signer.read().clone().ok_or(ClientError::NoSigner)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        signer
            .sign(create_auth_template(&self.inner.url, challenge, now))
            .await
    }

    fn auth_failed(&self, reason: String) {
        warn!("Authentication with {} failed: {}", self.inner.url, reason);
        self.set_status_if_connected(RelayStatus::AuthRequested);
        self.emit(RelayNotification::AuthFailed(reason));
    }

    /// Send a signed AUTH event and wait for the relay's verdict.
    pub async fn authenticate(&self, event: Event) -> Result<()> {
        let rx = self.inner.publishes.register(event.id.clone());
        self.send(ClientMessage::Auth(event))?;

        match wait_for(rx, self.inner.config.auth_timeout).await {
            Ok(ack) if ack.success => {
                info!("Authenticated with {}", self.inner.url);
                self.set_status_if_connected(RelayStatus::Authenticated);
                self.emit(RelayNotification::Authed);
                self.emit(RelayNotification::Ready);
                self.on_authenticated();
                Ok(())
            }
            Ok(ack) => {
                self.auth_failed(ack.message.clone());
                Err(ClientError::AuthFailed(ack.message))
            }
            Err(e) => {
                self.auth_failed(e.to_string());
                Err(ClientError::AuthFailed(e.to_string()))
            }
        }
    }

    /// NIP-45 COUNT against this relay.
    pub async fn count(&self, filters: Vec<Filter>, timeout: Duration) -> Result<u64> {
        let seq = self.inner.count_seq.fetch_add(1, Ordering::Relaxed);
        let sub_id = format!("count:{}", seq);
        let rx = self.inner.counts.register(sub_id.clone());

        if let Err(e) = self.send(ClientMessage::Count {
            subscription_id: sub_id.clone(),
            filters,
        }) {
            self.inner.counts.cancel(&sub_id);
            return Err(e);
        }

        wait_for(rx, timeout).await.map_err(|e| {
            self.inner.counts.cancel(&sub_id);
            ClientError::Timeout(format!("COUNT {} on {}: {}", sub_id, self.inner.url, e))
        })
    }

    /// Wire a fake socket for unit tests. Returns what the relay sends.
    #[cfg(test)]
    pub(crate) fn attach_test_channel(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        self.set_status(RelayStatus::Connected);
        rx
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, text: &str) {
        self.handle_text(text);
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: RelayStatus) {
        self.set_status(status);
    }
}

async fn run_connection<S>(
    relay: WeakRelay,
    url: String,
    keepalive_interval: Duration,
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.tick().await;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    last_activity = Instant::now();
                    let Some(relay) = relay.upgrade() else { break };
                    relay.handle_text(text.as_str());
                }
                Some(Ok(Message::Ping(data))) => {
                    last_activity = Instant::now();
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Relay {} closed connection", url);
                    break;
                }
                Some(Ok(_)) => {
                    last_activity = Instant::now();
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from {}: {}", url, e);
                    break;
                }
                None => break,
            },
            outgoing = outbound.recv() => match outgoing {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    let _ = sink.close().await;
                    break;
                }
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!("Failed to send to {}: {}", url, e);
                        break;
                    }
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if last_activity.elapsed() >= keepalive_interval {
                    debug!("No traffic from {} for {:?}, pinging", url, keepalive_interval);
                    if sink.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Some(relay) = relay.upgrade() {
        relay.inner.connection_task.lock().take();
        relay.on_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> Relay {
        Relay::new("wss://relay.example").unwrap()
    }

    #[test]
    fn test_new_relay_normalizes_url() {
        let relay = relay();
        assert_eq!(relay.url(), "wss://relay.example/");
        assert_eq!(relay.status(), RelayStatus::Disconnected);
        assert!(Relay::new("https://relay.example").is_err());
    }

    #[test]
    fn test_send_when_disconnected() {
        let relay = relay();
        let result = relay.send(ClientMessage::Close {
            subscription_id: "x".to_string(),
        });
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_when_connected() {
        let relay = relay();
        let mut rx = relay.attach_test_channel();
        relay
            .send(ClientMessage::Close {
                subscription_id: "x".to_string(),
            })
            .unwrap();

        match rx.recv().await.unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"["CLOSE","x"]"#),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ok_resolves_pending_publish() {
        let relay = relay();
        let _rx = relay.attach_test_channel();
        let ack = relay.inner.publishes.register("abc".to_string());

        relay.inject(r#"["OK","abc",false,"blocked: spam"]"#);
        let ack = ack.await.unwrap();
        assert!(!ack.success);
        assert_eq!(ack.message, "blocked: spam");
    }

    #[tokio::test]
    async fn test_notice_is_broadcast() {
        let relay = relay();
        let _rx = relay.attach_test_channel();
        let mut notifications = relay.notifications();

        relay.inject(r#"["NOTICE","slow down"]"#);
        match notifications.recv().await.unwrap() {
            RelayNotification::Notice(message) => assert_eq!(message, "slow down"),
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_challenge_without_policy() {
        let relay = relay();
        let _rx = relay.attach_test_channel();
        let mut notifications = relay.notifications();

        relay.inject(r#"["AUTH","challenge-1"]"#);
        assert_eq!(relay.status(), RelayStatus::AuthRequested);
        match notifications.recv().await.unwrap() {
            RelayNotification::AuthChallenge(challenge) => assert_eq!(challenge, "challenge-1"),
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_challenge_ignored_while_authenticating() {
        let relay = relay();
        let _rx = relay.attach_test_channel();
        relay.force_status(RelayStatus::Authenticating);
        let mut notifications = relay.notifications();

        relay.inject(r#"["AUTH","challenge-2"]"#);
        assert_eq!(relay.status(), RelayStatus::Authenticating);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sign_in_policy_authenticates() {
        use crate::auth::SignInPolicy;
        use crate::signer::Keys;

        let relay = relay();
        let mut rx = relay.attach_test_channel();
        relay.set_auth_policy(Some(Arc::new(SignInPolicy)));
        relay.set_signer(Some(Arc::new(Keys::generate().unwrap())));
        let mut notifications = relay.notifications();

        relay.inject(r#"["AUTH","challenge-3"]"#);

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value[0], "AUTH");
        assert_eq!(value[1]["kind"], 22242);
        let event_id = value[1]["id"].as_str().unwrap().to_string();

        relay.inject(&format!(r#"["OK","{}",true,""]"#, event_id));
        loop {
            if let RelayNotification::Authed = notifications.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(relay.status(), RelayStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_count() {
        let relay = relay();
        let mut rx = relay.attach_test_channel();

        let counter = relay.clone();
        let task = tokio::spawn(async move {
            counter
                .count(vec![Filter::new().kinds(vec![1])], Duration::from_secs(1))
                .await
        });

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert_eq!(text.as_str(), r#"["COUNT","count:0",{"kinds":[1]}]"#);

        relay.inject(r#"["COUNT","count:0",{"count":12}]"#);
        assert_eq!(task.await.unwrap().unwrap(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_scheduled_with_delay() {
        let relay = relay();
        let mut notifications = relay.notifications();

        relay.handle_reconnection(0);
        match notifications.recv().await.unwrap() {
            RelayNotification::DelayedConnect(delay) => assert_eq!(delay, Duration::from_secs(5)),
            other => panic!("unexpected notification {:?}", other),
        }
        assert!(relay.connection_stats().next_reconnect_at.is_some());

        // A second request while one is pending is a no-op.
        relay.handle_reconnection(0);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flapping_stops_reconnection() {
        let relay = relay();
        relay
            .inner
            .stats
            .lock()
            .durations
            .extend([1000, 1010, 990]);
        let mut notifications = relay.notifications();

        relay.handle_reconnection(0);
        assert_eq!(relay.status(), RelayStatus::Flapping);
        assert!(matches!(
            notifications.recv().await.unwrap(),
            RelayNotification::Flapping(_)
        ));

        relay.reset_reconnection_state();
        assert_eq!(relay.status(), RelayStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_without_socket() {
        let relay = relay();
        let _rx = relay.attach_test_channel();
        let ack = relay.inner.publishes.register("pending".to_string());
        let mut notifications = relay.notifications();

        relay.disconnect().await;
        assert_eq!(relay.status(), RelayStatus::Disconnected);
        assert!(ack.await.is_err());
        assert!(matches!(
            notifications.recv().await.unwrap(),
            RelayNotification::Disconnect
        ));
    }
}

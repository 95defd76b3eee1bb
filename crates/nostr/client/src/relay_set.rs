//! Fan-out publishing to a set of relays.
//!
//! Two signals decide whether a relay took the event: the result of its
//! publish call and the `Published` notification it broadcasts the moment
//! it sees an accepting OK. Either one marks the relay successful, so a
//! transport error that trails an accepted OK does not count against it.

use crate::error::{ClientError, PublishError, RelayPublishError, Result};
use crate::pool::RelayPool;
use crate::relay::{Relay, RelayNotification};
use async_trait::async_trait;
use nostr::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Something a multi-relay publish can send to.
#[async_trait]
pub trait PublishTarget: Send + Sync {
    fn url(&self) -> &str;

    async fn publish_event(&self, event: &Event, timeout: Duration) -> std::result::Result<(), RelayPublishError>;

    fn notifications(&self) -> broadcast::Receiver<RelayNotification>;
}

#[async_trait]
impl PublishTarget for Relay {
    fn url(&self) -> &str {
        Relay::url(self)
    }

    async fn publish_event(&self, event: &Event, timeout: Duration) -> std::result::Result<(), RelayPublishError> {
        self.publish(event, timeout).await
    }

    fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        Relay::notifications(self)
    }
}

/// Wait until `target` announces it accepted `event_id`.
async fn published_notification(notifications: &mut broadcast::Receiver<RelayNotification>, event_id: &str) {
    loop {
        match notifications.recv().await {
            Ok(RelayNotification::Published { event_id: id }) if id == event_id => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Whether an accepting notification for `event_id` is already queued.
fn published_queued(notifications: &mut broadcast::Receiver<RelayNotification>, event_id: &str) -> bool {
    loop {
        match notifications.try_recv() {
            Ok(RelayNotification::Published { event_id: id }) if id == event_id => return true,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return false,
        }
    }
}

/// Publish to every target and aggregate the outcome.
///
/// Every leg runs to completion. Fewer than `required` successes fails with
/// a [`PublishError`] carrying each relay's cause, unless the event is
/// ephemeral.
pub async fn publish_to_targets<T>(
    targets: &[T],
    event: &Event,
    timeout: Duration,
    required: usize,
) -> std::result::Result<HashSet<String>, PublishError>
where
    T: PublishTarget,
{
    let published: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let legs = targets.iter().map(|target| {
        let published = published.clone();
        async move {
            let url = target.url().to_string();
            let mut notifications = target.notifications();
            let attempt = target.publish_event(event, timeout);
            tokio::pin!(attempt);
            let mut notified = false;

            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = published_notification(&mut notifications, &event.id), if !notified => {
                        notified = true;
                        published.lock().insert(url.clone());
                    }
                    result = &mut attempt => break result,
                }
            };
            if outcome.is_err() && !notified && published_queued(&mut notifications, &event.id) {
                published.lock().insert(url.clone());
            }
            (url, outcome)
        }
    });
    let outcomes = futures::future::join_all(legs).await;

    let mut published = std::mem::take(&mut *published.lock());
    let mut errors = HashMap::new();
    for (url, outcome) in outcomes {
        match outcome {
            Ok(()) => {
                published.insert(url);
            }
            Err(e) if !published.contains(&url) => {
                errors.insert(url, e);
            }
            Err(e) => debug!("Ignoring late error from {} after it accepted: {}", url, e),
        }
    }

    if event.is_ephemeral() {
        return Ok(published);
    }
    if published.len() < required {
        warn!(
            "Event {} reached {} relays, {} required",
            event.id,
            published.len(),
            required
        );
        return Err(PublishError {
            errors,
            published,
            required,
        });
    }

    info!("Event {} published to {} relays", event.id, published.len());
    Ok(published)
}

/// A named group of relays a single event is published to.
#[derive(Debug, Clone)]
pub struct RelaySet {
    relays: Vec<Relay>,
}

impl RelaySet {
    pub fn new(relays: Vec<Relay>) -> Self {
        let mut seen = HashSet::new();
        let relays = relays
            .into_iter()
            .filter(|r| seen.insert(r.url().to_string()))
            .collect();
        Self { relays }
    }

    /// Resolve URLs through the pool. Unknown relays join as temporary;
    /// refused URLs are skipped.
    pub fn from_urls(urls: &[String], pool: &RelayPool) -> Result<Self> {
        let relays: Vec<Relay> = urls
            .iter()
            .filter_map(|url| match pool.get_relay(url, false, true) {
                Ok(relay) => Some(relay),
                Err(e) => {
                    debug!("Leaving {} out of relay set: {}", url, e);
                    None
                }
            })
            .collect();

        if relays.is_empty() && !urls.is_empty() {
            return Err(ClientError::RelayRefused(format!(
                "none of {} relays could be used",
                urls.len()
            )));
        }
        Ok(Self::new(relays))
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url().to_string()).collect()
    }

    pub fn size(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.relays.iter().any(|r| r.url() == url)
    }

    /// Publish to every relay in the set. See [`publish_to_targets`].
    pub async fn publish(
        &self,
        event: &Event,
        timeout: Duration,
        required: usize,
    ) -> std::result::Result<HashSet<String>, PublishError> {
        publish_to_targets(&self.relays, event, timeout, required).await
    }
}

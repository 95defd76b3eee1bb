//! Request/response correlation
//!
//! Relays answer EVENT, AUTH and COUNT with a message carrying the request id.
//! `PendingRequests` maps that id to the one-shot senders waiting for it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
    #[error("timed out waiting for response")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,
}

/// Waiters keyed by request id. Several waiters may share an id; they are
/// resolved first-in first-out, one per response.
pub struct PendingRequests<K, V> {
    waiters: Mutex<HashMap<K, Vec<oneshot::Sender<V>>>>,
}

impl<K, V> PendingRequests<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in the response for `key`.
    pub fn register(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        let entry = waiters.entry(key.clone()).or_default();
        entry.retain(|tx| !tx.is_closed());
        if !entry.is_empty() {
            warn!("Duplicate pending request for {:?} ({} already waiting)", key, entry.len());
        }
        entry.push(tx);
        rx
    }

    /// Deliver a response to the oldest live waiter for `key`.
    ///
    /// Returns `false` if nobody was waiting.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let mut waiters = self.waiters.lock();
        let Some(entry) = waiters.get_mut(key) else {
            return false;
        };

        let mut value = Some(value);
        while !entry.is_empty() {
            let tx = entry.remove(0);
            if tx.is_closed() {
                continue;
            }
            if let Some(v) = value.take() {
                match tx.send(v) {
                    Ok(()) => break,
                    Err(v) => value = Some(v),
                }
            }
        }

        if entry.is_empty() {
            waiters.remove(key);
        }
        value.is_none()
    }

    /// Drop every waiter for `key`. Their receivers see `Cancelled`.
    pub fn cancel(&self, key: &K) {
        self.waiters.lock().remove(key);
    }

    /// Forget waiters for `key` whose receivers were dropped. Live waiters
    /// sharing the id stay registered.
    pub fn prune(&self, key: &K) {
        let mut waiters = self.waiters.lock();
        if let Some(entry) = waiters.get_mut(key) {
            entry.retain(|tx| !tx.is_closed());
            if entry.is_empty() {
                waiters.remove(key);
            }
        }
    }

    pub fn clear(&self) {
        self.waiters.lock().clear();
    }

    pub fn contains(&self, key: &K) -> bool {
        self.waiters.lock().contains_key(key)
    }

    /// Number of ids with at least one waiter.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for PendingRequests<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Await a registered response with a timeout.
pub async fn wait_for<V>(rx: oneshot::Receiver<V>, timeout: Duration) -> Result<V, PendingError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(PendingError::Cancelled),
        Err(_) => Err(PendingError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_single() {
        let pending: PendingRequests<String, bool> = PendingRequests::new();
        let rx = pending.register("id1".to_string());

        assert!(pending.resolve(&"id1".to_string(), true));
        assert!(wait_for(rx, Duration::from_secs(1)).await.unwrap());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_fifo() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let first = pending.register("id".to_string());
        let second = pending.register("id".to_string());

        assert!(pending.resolve(&"id".to_string(), 1));
        assert!(pending.contains(&"id".to_string()));
        assert!(pending.resolve(&"id".to_string(), 2));

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
        assert!(!pending.resolve(&"id".to_string(), 3));
    }

    #[tokio::test]
    async fn test_resolve_skips_dropped_receivers() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let dropped = pending.register("id".to_string());
        let live = pending.register("id".to_string());
        drop(dropped);

        assert!(pending.resolve(&"id".to_string(), 7));
        assert_eq!(live.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancel() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let rx = pending.register("id".to_string());
        pending.cancel(&"id".to_string());

        assert_eq!(
            wait_for(rx, Duration::from_secs(1)).await,
            Err(PendingError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_live_waiters() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let gave_up = pending.register("id".to_string());
        let live = pending.register("id".to_string());
        drop(gave_up);
        pending.prune(&"id".to_string());

        assert!(pending.contains(&"id".to_string()));
        assert!(pending.resolve(&"id".to_string(), 5));
        assert_eq!(live.await.unwrap(), 5);

        let alone = pending.register("other".to_string());
        drop(alone);
        pending.prune(&"other".to_string());
        assert!(!pending.contains(&"other".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let rx = pending.register("id".to_string());

        assert_eq!(
            wait_for(rx, Duration::from_millis(100)).await,
            Err(PendingError::Timeout)
        );
    }
}

//! Publishing a signed event to one relay.
//!
//! The relay answers with `OK <id> <accepted> <reason>`. A rejection whose
//! reason starts with `auth-required:` parks the publish until the relay's
//! auth flow finishes, then sends the event once more.

use crate::error::RelayPublishError;
use crate::message::ClientMessage;
use crate::pending::{PendingError, wait_for};
use crate::relay::{Relay, RelayNotification};
use crate::status::RelayStatus;
use nostr::{Event, is_auth_required};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Relay {
    /// Publish a signed event and wait for the relay's acknowledgment.
    ///
    /// Connects first if needed. `timeout` bounds the connection wait plus
    /// the first acknowledgment; a resend after authentication gets a fresh
    /// `timeout`.
    pub async fn publish(&self, event: &Event, timeout: Duration) -> Result<(), RelayPublishError> {
        let deadline = Instant::now() + timeout;
        if !self.wait_until_connected(deadline).await {
            return self.publish_failed(event, RelayPublishError::NotConnected);
        }

        let mut deadline = deadline;
        let mut auth_retried = false;
        loop {
            // Other publishes of the same event may share this id, so only
            // our own waiter is dropped on failure.
            let rx = self.inner.publishes.register(event.id.clone());
            if let Err(e) = self.send(ClientMessage::Event(event.clone())) {
                debug!("Could not send {} to {}: {}", event.id, self.url(), e);
                drop(rx);
                self.inner.publishes.prune(&event.id);
                return self.publish_failed(event, RelayPublishError::NotConnected);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let ack = match wait_for(rx, remaining).await {
                Ok(ack) => ack,
                Err(PendingError::Timeout) => {
                    self.inner.publishes.prune(&event.id);
                    return self.publish_failed(event, RelayPublishError::Timeout);
                }
                Err(PendingError::Cancelled) => {
                    return self.publish_failed(event, RelayPublishError::NotConnected);
                }
            };

            if ack.success {
                info!("Published {} to {}", event.id, self.url());
                self.emit(RelayNotification::Published {
                    event_id: event.id.clone(),
                });
                return Ok(());
            }

            if !auth_retried && is_auth_required(&ack.message) {
                auth_retried = true;
                debug!("Relay {} wants auth before accepting {}", self.url(), event.id);
                if let Err(reason) = self.wait_for_auth().await {
                    return self.publish_failed(event, RelayPublishError::AuthFailed(reason));
                }
                deadline = Instant::now() + timeout;
                continue;
            }

            return self.publish_failed(event, RelayPublishError::Rejected(ack.message));
        }
    }

    fn publish_failed(&self, event: &Event, error: RelayPublishError) -> Result<(), RelayPublishError> {
        warn!("Publishing {} to {} failed: {}", event.id, self.url(), error);
        self.emit(RelayNotification::PublishFailed {
            event_id: event.id.clone(),
            error: error.to_string(),
        });
        Err(error)
    }

    /// Wait for the socket to come up, starting a connect if nothing is in
    /// progress.
    async fn wait_until_connected(&self, deadline: Instant) -> bool {
        if self.is_connected() {
            return true;
        }

        let mut notifications = self.notifications();
        if self.status().can_connect() {
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.connect(None, true).await {
                    debug!("Connect to {} for publish failed: {}", relay.url(), e);
                }
            });
        }

        let wait = async {
            loop {
                if self.is_connected() {
                    return true;
                }
                match notifications.recv().await {
                    Ok(RelayNotification::Connect | RelayNotification::Ready) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout_at(deadline, wait).await.unwrap_or(false)
    }

    /// Wait for the relay's auth flow to finish.
    async fn wait_for_auth(&self) -> Result<(), String> {
        let mut notifications = self.notifications();
        let wait = async {
            loop {
                match self.status() {
                    RelayStatus::Authenticated => return Ok(()),
                    status if !status.is_connected() => {
                        return Err("relay disconnected during authentication".to_string());
                    }
                    _ => {}
                }
                match notifications.recv().await {
                    Ok(RelayNotification::Authed) => return Ok(()),
                    Ok(RelayNotification::AuthFailed(reason)) => return Err(reason),
                    Ok(RelayNotification::Disconnect) => {
                        return Err("relay disconnected during authentication".to_string());
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err("relay dropped".to_string());
                    }
                }
            }
        };

        tokio::time::timeout(self.config().auth_timeout, wait)
            .await
            .unwrap_or_else(|_| Err("timed out waiting for authentication".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SignInPolicy;
    use crate::signer::{Keys, Signer};
    use nostr::EventTemplate;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::Message;

    async fn note(keys: &Keys) -> Event {
        keys.sign(EventTemplate {
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
        })
        .await
        .unwrap()
    }

    fn sent_text(message: Message) -> String {
        match message {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_accepted() {
        let keys = Keys::generate().unwrap();
        let event = note(&keys).await;
        let relay = Relay::new("wss://relay.example").unwrap();
        let mut outbound = relay.attach_test_channel();
        let mut notifications = relay.notifications();

        let publish = {
            let relay = relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.publish(&event, Duration::from_secs(1)).await })
        };

        let sent = sent_text(outbound.recv().await.unwrap());
        assert!(sent.starts_with("[\"EVENT\""));
        relay.inject(&format!(r#"["OK","{}",true,""]"#, event.id));

        assert_eq!(publish.await.unwrap(), Ok(()));
        assert!(matches!(
            notifications.recv().await.unwrap(),
            RelayNotification::Published { event_id } if event_id == event.id
        ));
    }

    #[tokio::test]
    async fn test_publish_rejected_without_retry() {
        let keys = Keys::generate().unwrap();
        let event = note(&keys).await;
        let relay = Relay::new("wss://relay.example").unwrap();
        let mut outbound = relay.attach_test_channel();

        let publish = {
            let relay = relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.publish(&event, Duration::from_secs(1)).await })
        };

        outbound.recv().await.unwrap();
        relay.inject(&format!(r#"["OK","{}",false,"blocked: spam"]"#, event.id));

        assert_eq!(
            publish.await.unwrap(),
            Err(RelayPublishError::Rejected("blocked: spam".to_string()))
        );
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout() {
        let keys = Keys::generate().unwrap();
        let event = note(&keys).await;
        let relay = Relay::new("wss://relay.example").unwrap();
        let _outbound = relay.attach_test_channel();

        let result = relay.publish(&event, Duration::from_millis(500)).await;
        assert_eq!(result, Err(RelayPublishError::Timeout));
    }

    #[tokio::test]
    async fn test_auth_required_retried_once() {
        let keys = Keys::generate().unwrap();
        let event = note(&keys).await;
        let relay = Relay::new("wss://relay.example").unwrap();
        relay.set_signer(Some(Arc::new(keys.clone())));
        relay.set_auth_policy(Some(Arc::new(SignInPolicy)));
        let mut outbound = relay.attach_test_channel();

        let publish = {
            let relay = relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.publish(&event, Duration::from_secs(2)).await })
        };

        outbound.recv().await.unwrap();
        relay.inject(&format!(
            r#"["OK","{}",false,"auth-required: sign in first"]"#,
            event.id
        ));
        relay.inject(r#"["AUTH","challenge-1"]"#);

        let auth = sent_text(outbound.recv().await.unwrap());
        assert!(auth.starts_with("[\"AUTH\""));
        let auth_id = serde_json::from_str::<serde_json::Value>(&auth).unwrap()[1]["id"]
            .as_str()
            .unwrap()
            .to_string();
        relay.inject(&format!(r#"["OK","{}",true,""]"#, auth_id));

        let resent = sent_text(outbound.recv().await.unwrap());
        assert!(resent.contains(&event.id));
        relay.inject(&format!(
            r#"["OK","{}",false,"auth-required: still no"]"#,
            event.id
        ));

        assert_eq!(
            publish.await.unwrap(),
            Err(RelayPublishError::Rejected("auth-required: still no".to_string()))
        );
    }

    #[tokio::test]
    async fn test_timeout_leaves_other_publish_waiting() {
        let keys = Keys::generate().unwrap();
        let event = note(&keys).await;
        let relay = Relay::new("wss://relay.example").unwrap();
        let mut outbound = relay.attach_test_channel();

        let patient = {
            let relay = relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.publish(&event, Duration::from_secs(5)).await })
        };
        outbound.recv().await.unwrap();

        let hasty = {
            let relay = relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.publish(&event, Duration::from_millis(100)).await })
        };
        outbound.recv().await.unwrap();

        assert_eq!(hasty.await.unwrap(), Err(RelayPublishError::Timeout));
        assert!(relay.is_connected());
        assert!(!patient.is_finished());

        relay.inject(&format!(r#"["OK","{}",true,""]"#, event.id));
        assert_eq!(patient.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_auth_resends_every_parked_publish() {
        let keys = Keys::generate().unwrap();
        let first = note(&keys).await;
        let second = keys
            .sign(EventTemplate {
                created_at: 1_700_000_001,
                kind: 1,
                tags: vec![],
                content: "second".to_string(),
            })
            .await
            .unwrap();
        let relay = Relay::new("wss://relay.example").unwrap();
        relay.set_signer(Some(Arc::new(keys.clone())));
        relay.set_auth_policy(Some(Arc::new(SignInPolicy)));
        let mut outbound = relay.attach_test_channel();

        let publishes: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|event| {
                let relay = relay.clone();
                tokio::spawn(async move { relay.publish(&event, Duration::from_secs(2)).await })
            })
            .collect();

        let mut sent = vec![sent_text(outbound.recv().await.unwrap())];
        sent.push(sent_text(outbound.recv().await.unwrap()));
        for event in [&first, &second] {
            assert_eq!(sent.iter().filter(|text| text.contains(&event.id)).count(), 1);
            relay.inject(&format!(
                r#"["OK","{}",false,"auth-required: sign in first"]"#,
                event.id
            ));
        }
        relay.inject(r#"["AUTH","challenge-1"]"#);

        let auth = sent_text(outbound.recv().await.unwrap());
        assert!(auth.starts_with("[\"AUTH\""));
        let auth_id = serde_json::from_str::<serde_json::Value>(&auth).unwrap()[1]["id"]
            .as_str()
            .unwrap()
            .to_string();
        relay.inject(&format!(r#"["OK","{}",true,""]"#, auth_id));

        let resent = vec![
            sent_text(outbound.recv().await.unwrap()),
            sent_text(outbound.recv().await.unwrap()),
        ];
        for event in [&first, &second] {
            assert_eq!(resent.iter().filter(|text| text.contains(&event.id)).count(), 1);
        }

        relay.inject(&format!(r#"["OK","{}",true,""]"#, second.id));
        relay.inject(&format!(r#"["OK","{}",false,"blocked: first one"]"#, first.id));

        let mut results = Vec::new();
        for publish in publishes {
            results.push(publish.await.unwrap());
        }
        assert_eq!(
            results,
            vec![
                Err(RelayPublishError::Rejected("blocked: first one".to_string())),
                Ok(()),
            ]
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auth_failure_fails_publish() {
        let keys = Keys::generate().unwrap();
        let event = note(&keys).await;
        let relay = Relay::new("wss://relay.example").unwrap();
        let mut outbound = relay.attach_test_channel();

        let publish = {
            let relay = relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.publish(&event, Duration::from_secs(2)).await })
        };

        outbound.recv().await.unwrap();
        relay.inject(&format!(r#"["OK","{}",false,"auth-required: who are you"]"#, event.id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.emit(RelayNotification::AuthFailed("denied".to_string()));

        assert_eq!(
            publish.await.unwrap(),
            Err(RelayPublishError::AuthFailed("denied".to_string()))
        );
    }
}

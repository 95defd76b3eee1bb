//! NIP-42 authentication policies
//!
//! When a relay sends `["AUTH", <challenge>]` the relay's policy decides how
//! to answer. Without a policy the challenge is only surfaced as a
//! notification.

use crate::error::Result;
use async_trait::async_trait;
use nostr::Event;

/// Answer to an auth challenge.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    /// Send this signed kind 22242 event
    Event(Event),
    /// Sign the standard auth template with the relay's signer and send it
    Accept,
    /// Do not authenticate
    Reject,
}

#[async_trait]
pub trait AuthPolicy: Send + Sync {
    async fn on_challenge(&self, relay_url: &str, challenge: &str) -> Result<AuthDecision>;
}

/// Authenticate to every relay that asks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignInPolicy;

#[async_trait]
impl AuthPolicy for SignInPolicy {
    async fn on_challenge(&self, _relay_url: &str, _challenge: &str) -> Result<AuthDecision> {
        Ok(AuthDecision::Accept)
    }
}

/// Refuse every challenge. Operations waiting on auth fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyPolicy;

#[async_trait]
impl AuthPolicy for DenyPolicy {
    async fn on_challenge(&self, relay_url: &str, _challenge: &str) -> Result<AuthDecision> {
        tracing::debug!("Refusing auth challenge from {}", relay_url);
        Ok(AuthDecision::Reject)
    }
}

/// Authenticate only to the listed relays.
#[derive(Debug, Default, Clone)]
pub struct AllowListPolicy {
    relays: Vec<String>,
}

impl AllowListPolicy {
    pub fn new(relays: &[String]) -> Self {
        Self {
            relays: crate::normalize::normalize(relays),
        }
    }
}

#[async_trait]
impl AuthPolicy for AllowListPolicy {
    async fn on_challenge(&self, relay_url: &str, _challenge: &str) -> Result<AuthDecision> {
        if self.relays.iter().any(|r| r == relay_url) {
            Ok(AuthDecision::Accept)
        } else {
            Ok(AuthDecision::Reject)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_list() {
        let policy = AllowListPolicy::new(&["wss://trusted.example".to_string()]);
        assert!(matches!(
            policy.on_challenge("wss://trusted.example/", "c").await.unwrap(),
            AuthDecision::Accept
        ));
        assert!(matches!(
            policy.on_challenge("wss://other.example/", "c").await.unwrap(),
            AuthDecision::Reject
        ));
    }

    #[tokio::test]
    async fn test_builtin_policies() {
        assert!(matches!(
            SignInPolicy.on_challenge("wss://a/", "c").await.unwrap(),
            AuthDecision::Accept
        ));
        assert!(matches!(
            DenyPolicy.on_challenge("wss://a/", "c").await.unwrap(),
            AuthDecision::Reject
        ));
    }
}

//! Event signing
//!
//! The engine never touches key material directly; it asks a [`Signer`].

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use nostr::{Event, EventTemplate, finalize_event, generate_secret_key, get_public_key_hex};

#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the signing identity
    async fn public_key(&self) -> Result<String>;

    async fn sign(&self, template: EventTemplate) -> Result<Event>;
}

/// In-process secret key signer.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    pub fn generate() -> Result<Self> {
        Self::from_secret_key(generate_secret_key())
    }

    pub fn from_secret_key(secret_key: [u8; 32]) -> Result<Self> {
        let public_key =
            get_public_key_hex(&secret_key).map_err(|e| ClientError::Signing(e.to_string()))?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn from_hex(secret_key: &str) -> Result<Self> {
        let bytes = hex::decode(secret_key)
            .map_err(|e| ClientError::Signing(format!("invalid secret key hex: {}", e)))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClientError::Signing("secret key must be 32 bytes".to_string()))?;
        Self::from_secret_key(secret_key)
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("public_key", &self.public_key).finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Keys {
    async fn public_key(&self) -> Result<String> {
        Ok(self.public_key.clone())
    }

    async fn sign(&self, template: EventTemplate) -> Result<Event> {
        finalize_event(&template, &self.secret_key).map_err(|e| ClientError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::verify_event;

    #[tokio::test]
    async fn test_keys_sign_and_verify() {
        let keys = Keys::generate().unwrap();
        let event = keys
            .sign(EventTemplate {
                created_at: 1_700_000_000,
                kind: 1,
                tags: vec![],
                content: "hello".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(event.pubkey, keys.public_key_hex());
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_from_hex() {
        let keys = Keys::from_hex(&"01".repeat(32)).unwrap();
        assert_eq!(keys.public_key_hex().len(), 64);
        assert!(Keys::from_hex("abcd").is_err());
        assert!(Keys::from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let keys = Keys::from_hex(&"01".repeat(32)).unwrap();
        let debug = format!("{:?}", keys);
        assert!(!debug.contains(&"01".repeat(32)));
    }
}

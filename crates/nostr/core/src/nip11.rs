//! NIP-11: Relay Information Document
//!
//! The document a relay serves over HTTP when asked with
//! `Accept: application/nostr+json`. Relays omit most fields, so everything
//! except `supported_nips` is optional and unknown fields are ignored.

use serde::{Deserialize, Serialize};

/// MIME type clients send in the `Accept` header.
pub const RELAY_INFORMATION_MIME: &str = "application/nostr+json";

/// NIP-11 Relay Information Document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Administrative contact pubkey (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    /// Administrative contact (URI: mailto:, https:, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    /// List of supported NIP numbers
    pub supported_nips: Vec<u16>,

    /// Relay software URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Server limitations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payments_url: Option<String>,
}

/// Server limitations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limitation {
    /// Maximum message length in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,

    /// Maximum active subscriptions per connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<usize>,

    /// Maximum limit value in filters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<usize>,

    /// Authentication required (NIP-42)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub restricted_writes: Option<bool>,

    /// created_at upper limit (seconds in future)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_upper_limit: Option<u64>,
}

impl RelayInformation {
    /// Parse a document body as returned by the relay.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn supports_nip(&self, nip: u16) -> bool {
        self.supported_nips.contains(&nip)
    }

    /// Whether the relay advertises that clients must authenticate.
    pub fn requires_auth(&self) -> bool {
        self.limitation
            .as_ref()
            .and_then(|l| l.auth_required)
            .unwrap_or(false)
    }
}

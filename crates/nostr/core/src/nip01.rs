//! NIP-01: Basic protocol flow description.
//!
//! Event structure, id hashing, Schnorr signing and verification, kind
//! classification and the identity key used when reconciling replaceable
//! events received from several relays.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signing key.
///
/// ```
/// use nostr::EventTemplate;
///
/// let template = EventTemplate {
///     created_at: 1_700_000_000,
///     kind: 1,
///     tags: vec![vec!["t".to_string(), "nostr".to_string()]],
///     content: "hello relays".to_string(),
/// };
/// assert_eq!(template.kind, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
    Unknown,
}

/// Logical identity of an event for deduplication.
///
/// Regular events are identified by their id. Replaceable and addressable
/// events are identified by author and kind (and `d` tag), and only the
/// newest one is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventIdentity {
    Id(String),
    Replaceable { kind: u16, pubkey: String },
    Addressable { kind: u16, pubkey: String, identifier: String },
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_RECOMMEND_RELAY: u16 = 2;
pub const KIND_CONTACTS: u16 = 3;

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the x-only public key from a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Compute the event id (sha256 of the serialized form).
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Structural validation of a signed event. Does not check the signature.
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_hex(&event.sig, 128)
}

/// Sign an event template with a secret key.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly_pk.serialize()),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let message = digest_message(&id).map_err(Nip01Error::Signing)?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
///
/// Returns `Ok(false)` for a well-formed event whose id or signature does not
/// match, and an error when the hex fields cannot be decoded at all.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    if get_event_hash(&unsigned)? != event.id {
        return Ok(false);
    }

    let message = digest_message(&event.id).map_err(Nip01Error::Verification)?;
    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey: {}", e)))?;

    let secp = Secp256k1::verification_only();
    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

fn digest_message(id: &str) -> Result<Message, String> {
    let bytes = hex::decode(id).map_err(|e| format!("invalid id hex: {}", e))?;
    let digest: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "event id must be 32 bytes".to_string())?;
    Ok(Message::from_digest(digest))
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    is_hex(value, len) && !value.chars().any(|c| c.is_ascii_uppercase())
}

/// Classify an event kind according to NIP-01 rules.
pub fn classify_kind(kind: u16) -> KindClassification {
    match kind {
        1 | 2 | 4..=44 | 1000..=9999 => KindClassification::Regular,
        0 | 3 | 10000..=19999 => KindClassification::Replaceable,
        20000..=29999 => KindClassification::Ephemeral,
        30000..=39999 => KindClassification::Addressable,
        _ => KindClassification::Unknown,
    }
}

pub fn is_regular_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Regular
}

pub fn is_replaceable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Replaceable
}

pub fn is_ephemeral_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Ephemeral
}

pub fn is_addressable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Addressable
}

impl Event {
    /// Values of every tag with the given name (second element of each tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Tags with the given name.
    pub fn matching_tags<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
    }

    /// The `d` tag value, empty when absent.
    pub fn d_tag(&self) -> &str {
        self.tag_values("d").next().unwrap_or("")
    }

    pub fn is_ephemeral(&self) -> bool {
        is_ephemeral_kind(self.kind)
    }

    pub fn is_replaceable(&self) -> bool {
        is_replaceable_kind(self.kind) || is_addressable_kind(self.kind)
    }

    /// Identity used when reconciling copies of this event.
    pub fn identity(&self) -> EventIdentity {
        match classify_kind(self.kind) {
            KindClassification::Replaceable => EventIdentity::Replaceable {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
            },
            KindClassification::Addressable => EventIdentity::Addressable {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                identifier: self.d_tag().to_string(),
            },
            _ => EventIdentity::Id(self.id.clone()),
        }
    }
}

/// Sort events newest first, ties broken by id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_private_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&hex::decode(TEST_PRIVATE_KEY).unwrap());
        key
    }

    fn note(content: &str) -> EventTemplate {
        EventTemplate {
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: content.to_string(),
            created_at: 1617932115,
        }
    }

    #[test]
    fn test_finalize_and_verify() {
        let sk = test_private_key();
        let event = finalize_event(&note("Hello, world!"), &sk).unwrap();

        assert_eq!(event.pubkey, get_public_key_hex(&sk).unwrap());
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_serialize_event_format() {
        let pubkey = get_public_key_hex(&test_private_key()).unwrap();
        let unsigned = UnsignedEvent {
            pubkey: pubkey.clone(),
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", pubkey);
        assert_eq!(serialize_event(&unsigned).unwrap(), expected);
    }

    #[test]
    fn test_serialize_rejects_bad_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "invalid".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_event(&unsigned).is_err());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let sk = test_private_key();
        let event = finalize_event(&note("original"), &sk).unwrap();

        let mut tampered_content = event.clone();
        tampered_content.content = "changed".to_string();
        assert!(!verify_event(&tampered_content).unwrap());

        let mut tampered_sig = event.clone();
        tampered_sig.sig.replace_range(0..3, "666");
        assert!(!verify_event(&tampered_sig).unwrap());

        let mut other_key = event;
        other_key.pubkey = get_public_key_hex(&generate_secret_key()).unwrap();
        assert!(!verify_event(&other_key).unwrap());
    }

    #[test]
    fn test_validate_event_structure() {
        let event = finalize_event(&note("x"), &test_private_key()).unwrap();
        assert!(validate_event(&event));

        let mut upper = event.clone();
        upper.pubkey = upper.pubkey.to_uppercase();
        assert!(!validate_event(&upper));

        let mut short_sig = event;
        short_sig.sig.truncate(10);
        assert!(!validate_event(&short_sig));
    }

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind(1), KindClassification::Regular);
        assert_eq!(classify_kind(7), KindClassification::Regular);
        assert_eq!(classify_kind(0), KindClassification::Replaceable);
        assert_eq!(classify_kind(10002), KindClassification::Replaceable);
        assert_eq!(classify_kind(20000), KindClassification::Ephemeral);
        assert_eq!(classify_kind(29999), KindClassification::Ephemeral);
        assert_eq!(classify_kind(30023), KindClassification::Addressable);
        assert_eq!(classify_kind(50000), KindClassification::Unknown);
    }

    #[test]
    fn test_identity() {
        let sk = test_private_key();
        let text = finalize_event(&note("x"), &sk).unwrap();
        assert_eq!(text.identity(), EventIdentity::Id(text.id.clone()));

        let mut metadata = note("{}");
        metadata.kind = KIND_METADATA;
        let metadata = finalize_event(&metadata, &sk).unwrap();
        assert_eq!(
            metadata.identity(),
            EventIdentity::Replaceable {
                kind: 0,
                pubkey: metadata.pubkey.clone()
            }
        );

        let mut article = note("body");
        article.kind = 30023;
        article.tags = vec![vec!["d".to_string(), "slug".to_string()]];
        let article = finalize_event(&article, &sk).unwrap();
        assert_eq!(
            article.identity(),
            EventIdentity::Addressable {
                kind: 30023,
                pubkey: article.pubkey.clone(),
                identifier: "slug".to_string()
            }
        );
    }

    #[test]
    fn test_tag_values() {
        let mut template = note("x");
        template.tags = vec![
            vec!["e".to_string(), "abc".to_string(), "wss://relay.one".to_string()],
            vec!["p".to_string(), "def".to_string()],
            vec!["e".to_string(), "ghi".to_string()],
        ];
        let event = finalize_event(&template, &test_private_key()).unwrap();

        assert_eq!(event.tag_values("e").collect::<Vec<_>>(), vec!["abc", "ghi"]);
        assert_eq!(event.matching_tags("p").count(), 1);
        assert_eq!(event.d_tag(), "");
    }

    #[test]
    fn test_sort_events() {
        let make = |id: &str, created_at| Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "a".repeat(128),
        };
        let mut events = vec![make("abc123", 1610000000), make("abc125", 1620000000), make("abc124", 1620000000)];

        sort_events(&mut events);

        assert_eq!(events[0].id, "abc124");
        assert_eq!(events[1].id, "abc125");
        assert_eq!(events[2].id, "abc123");
    }
}

//! Nostr protocol types used by the relay client.
//!
//! This crate provides:
//! - NIP-01: Event structure, id hashing, signing, verification, kind classes
//! - NIP-11: Relay Information Document
//! - NIP-42: Authentication of clients to relays
//! - NIP-65: Relay List Metadata
//! - Tag targets for referencing users and events

mod nip01;
mod nip11;
mod nip42;
mod nip65;
mod tag;

pub use nip01::{
    Event, EventIdentity, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_RECOMMEND_RELAY,
    KIND_SHORT_TEXT_NOTE, KindClassification, Nip01Error, UnsignedEvent, classify_kind,
    finalize_event, generate_secret_key, get_event_hash, get_public_key, get_public_key_hex,
    is_addressable_kind, is_ephemeral_kind, is_regular_kind, is_replaceable_kind,
    serialize_event, sort_events, validate_event, verify_event,
};

pub use nip11::{Limitation, RELAY_INFORMATION_MIME, RelayInformation};

pub use nip42::{AUTH_KIND, AUTH_REQUIRED_PREFIX, auth_challenge, create_auth_template, is_auth_required};

pub use nip65::{RELAY_LIST_METADATA_KIND, RELAY_TAG, Nip65Error, RelayEntry, RelayListMetadata, RelayMarker};

pub use tag::TagTarget;

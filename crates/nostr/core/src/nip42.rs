//! NIP-42: Authentication of clients to relays.
//!
//! A relay sends `["AUTH", <challenge>]`; the client answers with a signed
//! ephemeral event of kind 22242 carrying the relay URL and the challenge.

use crate::nip01::{Event, EventTemplate};

/// Kind of the client authentication event.
pub const AUTH_KIND: u16 = 22242;

/// Prefix of `OK`/`CLOSED` reasons that ask the client to authenticate first.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

/// Build the unsigned authentication event for a relay challenge.
pub fn create_auth_template(relay_url: &str, challenge: &str, created_at: u64) -> EventTemplate {
    EventTemplate {
        created_at,
        kind: AUTH_KIND,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

/// Whether a relay rejection reason is an authentication demand.
pub fn is_auth_required(reason: &str) -> bool {
    reason.starts_with(AUTH_REQUIRED_PREFIX)
}

/// The challenge carried by an authentication event, if it is one.
pub fn auth_challenge(event: &Event) -> Option<&str> {
    if event.kind != AUTH_KIND {
        return None;
    }
    event.tag_values("challenge").next()
}

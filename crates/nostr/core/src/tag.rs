//! Tagging other entities from an event.
//!
//! The thing being referenced is decided once, at the call site, as a
//! [`TagTarget`]. Each variant knows which tags it produces.

use crate::nip01::{Event, EventTemplate, is_addressable_kind, is_replaceable_kind};

/// What a new event refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTarget {
    /// A user, referenced with a `p` tag.
    UserRef {
        pubkey: String,
        relay_hint: Option<String>,
    },
    /// Another event. Replaceable events are referenced by address (`a`),
    /// everything else by id (`e`). The author is tagged too.
    MessageRef {
        event: Event,
        relay_hint: Option<String>,
    },
    /// A tag passed through unchanged.
    RawTag(Vec<String>),
}

impl TagTarget {
    pub fn user(pubkey: impl Into<String>) -> Self {
        TagTarget::UserRef {
            pubkey: pubkey.into(),
            relay_hint: None,
        }
    }

    pub fn message(event: Event) -> Self {
        TagTarget::MessageRef {
            event,
            relay_hint: None,
        }
    }

    /// Tags this target produces. `marker` is appended to `e`/`a` tags
    /// (e.g. "reply", "root").
    pub fn to_tags(&self, marker: Option<&str>) -> Vec<Vec<String>> {
        match self {
            TagTarget::UserRef { pubkey, relay_hint } => {
                vec![with_hint(vec!["p".to_string(), pubkey.clone()], relay_hint, None)]
            }
            TagTarget::MessageRef { event, relay_hint } => {
                let reference = if is_replaceable_kind(event.kind) || is_addressable_kind(event.kind) {
                    let address = format!("{}:{}:{}", event.kind, event.pubkey, event.d_tag());
                    vec!["a".to_string(), address]
                } else {
                    vec!["e".to_string(), event.id.clone()]
                };
                vec![
                    with_hint(reference, relay_hint, marker),
                    vec!["p".to_string(), event.pubkey.clone()],
                ]
            }
            TagTarget::RawTag(tag) => vec![tag.clone()],
        }
    }
}

fn with_hint(mut tag: Vec<String>, relay_hint: &Option<String>, marker: Option<&str>) -> Vec<String> {
    if relay_hint.is_some() || marker.is_some() {
        tag.push(relay_hint.clone().unwrap_or_default());
    }
    if let Some(marker) = marker {
        tag.push(marker.to_string());
    }
    tag
}

impl EventTemplate {
    /// Add the tags for `target`, skipping exact duplicates and `p` tags
    /// pointing at `author` (the signer of the new event).
    pub fn tag(&mut self, target: &TagTarget, marker: Option<&str>, author: Option<&str>) {
        for tag in target.to_tags(marker) {
            let self_reference = tag.first().map(String::as_str) == Some("p")
                && author.is_some_and(|author| tag.get(1).map(String::as_str) == Some(author));
            if self_reference || self.tags.contains(&tag) {
                continue;
            }
            self.tags.push(tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "e".repeat(64),
            pubkey: "a".repeat(64),
            created_at: 1,
            kind,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    fn empty_template() -> EventTemplate {
        EventTemplate {
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
        }
    }

    #[test]
    fn test_user_ref() {
        let tags = TagTarget::user("b".repeat(64)).to_tags(None);
        assert_eq!(tags, vec![vec!["p".to_string(), "b".repeat(64)]]);
    }

    #[test]
    fn test_regular_event_ref_with_marker() {
        let target = TagTarget::MessageRef {
            event: event(1, vec![]),
            relay_hint: Some("wss://relay.example/".to_string()),
        };
        let tags = target.to_tags(Some("reply"));
        assert_eq!(
            tags[0],
            vec!["e".to_string(), "e".repeat(64), "wss://relay.example/".to_string(), "reply".to_string()]
        );
        assert_eq!(tags[1], vec!["p".to_string(), "a".repeat(64)]);
    }

    #[test]
    fn test_addressable_event_ref() {
        let article = event(30023, vec![vec!["d".to_string(), "slug".to_string()]]);
        let tags = TagTarget::message(article).to_tags(None);
        assert_eq!(tags[0], vec!["a".to_string(), format!("30023:{}:slug", "a".repeat(64))]);
    }

    #[test]
    fn test_template_tag_skips_self_and_duplicates() {
        let mut template = empty_template();
        let target = TagTarget::message(event(1, vec![]));

        template.tag(&target, None, Some(&"a".repeat(64)));
        template.tag(&target, None, Some(&"a".repeat(64)));
        template.tag(&TagTarget::RawTag(vec!["t".to_string(), "nostr".to_string()]), None, None);

        assert_eq!(template.tags.len(), 2);
        assert_eq!(template.tags[0][0], "e");
        assert_eq!(template.tags[1][0], "t");
    }
}

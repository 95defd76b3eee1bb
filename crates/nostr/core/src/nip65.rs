//! NIP-65: Relay List Metadata
//!
//! Kind 10002 advertises the relays a user writes to and the relays where the
//! user reads mentions. Relay selection uses the write relays of authors when
//! querying and the read relays of tagged users when publishing.

use crate::nip01::Event;
use thiserror::Error;

/// Event kind for relay list metadata
pub const RELAY_LIST_METADATA_KIND: u16 = 10002;

/// Tag name for relay entries
pub const RELAY_TAG: &str = "r";

#[derive(Debug, Error)]
pub enum Nip65Error {
    #[error("event is not a relay list metadata event (kind {0})")]
    InvalidKind(u16),

    #[error("invalid relay tag format: {0}")]
    InvalidTag(String),
}

/// How a listed relay is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMarker {
    Read,
    Write,
    /// No marker in the tag
    ReadWrite,
}

impl RelayMarker {
    fn parse(marker: Option<&str>) -> Self {
        match marker {
            Some("read") => RelayMarker::Read,
            Some("write") => RelayMarker::Write,
            _ => RelayMarker::ReadWrite,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, RelayMarker::Read | RelayMarker::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, RelayMarker::Write | RelayMarker::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub url: String,
    pub marker: RelayMarker,
}

/// Parsed kind 10002 content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayListMetadata {
    pub relays: Vec<RelayEntry>,
}

impl RelayListMetadata {
    pub fn from_event(event: &Event) -> Result<Self, Nip65Error> {
        if event.kind != RELAY_LIST_METADATA_KIND {
            return Err(Nip65Error::InvalidKind(event.kind));
        }

        let mut relays = Vec::new();
        for tag in event.matching_tags(RELAY_TAG) {
            let url = tag
                .get(1)
                .ok_or_else(|| Nip65Error::InvalidTag("relay tag must have a URL".to_string()))?;
            relays.push(RelayEntry {
                url: url.clone(),
                marker: RelayMarker::parse(tag.get(2).map(String::as_str)),
            });
        }

        Ok(Self { relays })
    }

    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_list(tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "id".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1707409439,
            kind: RELAY_LIST_METADATA_KIND,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(str::to_string).collect())
                .collect(),
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_read_write_split() {
        let event = relay_list(vec![
            vec!["r", "wss://both.example"],
            vec!["r", "wss://read.example", "read"],
            vec!["r", "wss://write.example", "write"],
            vec!["p", "ignored"],
        ]);

        let list = RelayListMetadata::from_event(&event).unwrap();
        assert_eq!(list.relays.len(), 3);
        assert_eq!(list.read_relays(), vec!["wss://both.example", "wss://read.example"]);
        assert_eq!(list.write_relays(), vec!["wss://both.example", "wss://write.example"]);
    }

    #[test]
    fn test_wrong_kind() {
        let mut event = relay_list(vec![]);
        event.kind = 3;
        assert!(matches!(
            RelayListMetadata::from_event(&event),
            Err(Nip65Error::InvalidKind(3))
        ));
    }

    #[test]
    fn test_tag_without_url() {
        let event = relay_list(vec![vec!["r"]]);
        assert!(RelayListMetadata::from_event(&event).is_err());
    }
}

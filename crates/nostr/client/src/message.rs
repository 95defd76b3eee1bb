//! Relay protocol frames and subscription filters.
//!
//! Every frame is a JSON array whose first element names the verb.
//! Clients send EVENT, REQ, CLOSE, AUTH (NIP-42) and COUNT (NIP-45);
//! relays answer with EVENT, OK, EOSE, CLOSED, NOTICE, AUTH and COUNT.

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// A frame sent to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),
    /// `["REQ", <sub id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <sub id>]`
    Close { subscription_id: String },
    /// `["AUTH", <signed kind 22242 event>]`
    Auth(Event),
    /// `["COUNT", <sub id>, <filter>...]`
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let frame = match self {
            ClientMessage::Event(event) | ClientMessage::Auth(event) => {
                json!([self.verb(), event])
            }
            ClientMessage::Close { subscription_id } => json!([self.verb(), subscription_id]),
            ClientMessage::Req {
                subscription_id,
                filters,
            }
            | ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!(self.verb()), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
        };
        Ok(frame.to_string())
    }

    /// The frame's verb, e.g. `"REQ"`.
    pub fn verb(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
            ClientMessage::Auth(_) => "AUTH",
            ClientMessage::Count { .. } => "COUNT",
        }
    }
}

/// A frame received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    /// Verdict on a published event or an AUTH event
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },
    Eose { subscription_id: String },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice { message: String },
    Auth { challenge: String },
    Count { subscription_id: String, count: u64 },
}

/// Positional access into a received frame.
struct Frame<'a> {
    verb: &'a str,
    items: &'a [Value],
}

impl<'a> Frame<'a> {
    fn item(&self, index: usize, name: &str) -> Result<&'a Value, MessageError> {
        self.items
            .get(index)
            .ok_or_else(|| MessageError::MissingField(format!("{} {}", self.verb, name)))
    }

    fn string(&self, index: usize, name: &str) -> Result<String, MessageError> {
        self.item(index, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MessageError::InvalidFormat(format!("{} {} is not a string", self.verb, name)))
    }

    /// Trailing human-readable text; relays are allowed to omit it.
    fn reason(&self, index: usize) -> String {
        self.items
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let items: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
        let verb = items
            .first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;
        let frame = Frame {
            verb,
            items: &items,
        };

        let message = match verb {
            "EVENT" => RelayMessage::Event {
                subscription_id: frame.string(1, "subscription id")?,
                event: serde_json::from_value(frame.item(2, "event")?.clone())?,
            },
            "OK" => RelayMessage::Ok {
                event_id: frame.string(1, "event id")?,
                success: frame.item(2, "status")?.as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("OK status is not a boolean".to_string())
                })?,
                message: frame.reason(3),
            },
            "EOSE" => RelayMessage::Eose {
                subscription_id: frame.string(1, "subscription id")?,
            },
            "CLOSED" => RelayMessage::Closed {
                subscription_id: frame.string(1, "subscription id")?,
                message: frame.reason(2),
            },
            "NOTICE" => RelayMessage::Notice {
                message: frame.string(1, "message")?,
            },
            "AUTH" => RelayMessage::Auth {
                challenge: frame.string(1, "challenge")?,
            },
            "COUNT" => RelayMessage::Count {
                subscription_id: frame.string(1, "subscription id")?,
                count: frame
                    .item(2, "count")?
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MessageError::MissingField("COUNT count value".to_string()))?,
            },
            other => return Err(MessageError::UnknownType(other.to_string())),
        };
        Ok(message)
    }

    /// The subscription a frame belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            }
            | RelayMessage::Count {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// A NIP-01 subscription filter.
///
/// Tag queries live in `tags` keyed with their `#` prefix (`"#e"`, `"#p"`),
/// matching the wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// NIP-50 full-text search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag query; `name` is the bare tag name (`"e"`, `"t"`).
    pub fn tag(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", name.into()), values);
        self
    }

    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Whether an event satisfies this filter. `limit` and `search` are
    /// evaluated by relays only.
    pub fn matches(&self, event: &Event) -> bool {
        let listed = |list: &Option<Vec<String>>, value: &String| {
            list.as_ref().is_none_or(|list| list.contains(value))
        };

        listed(&self.ids, &event.id)
            && listed(&self.authors, &event.pubkey)
            && self
                .kinds
                .as_ref()
                .is_none_or(|kinds| kinds.contains(&event.kind))
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
            && self.tags.iter().all(|(key, values)| match key.strip_prefix('#') {
                Some(name) => event
                    .tag_values(name)
                    .any(|value| values.iter().any(|v| v == value)),
                None => true,
            })
    }
}

/// Whether an event matches any of the filters.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_event() -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 1500,
            kind: 1,
            tags: vec![
                vec!["e".to_string(), "c".repeat(64)],
                vec!["t".to_string(), "nostr".to_string()],
            ],
            content: "Hello".to_string(),
            sig: "d".repeat(128),
        }
    }

    #[test]
    fn test_client_frames() {
        let event = sample_event();
        let json = ClientMessage::Event(event.clone()).to_json().unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0], "EVENT");
        assert_eq!(parsed[1]["id"], event.id);

        let auth = ClientMessage::Auth(event).to_json().unwrap();
        assert!(auth.starts_with(r#"["AUTH",{"#));

        let close = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };
        assert_eq!(close.to_json().unwrap(), r#"["CLOSE","sub1"]"#);

        let req = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![Filter::new().kinds(vec![1]), Filter::new().limit(5)],
        };
        assert_eq!(
            req.to_json().unwrap(),
            r#"["REQ","sub1",{"kinds":[1]},{"limit":5}]"#
        );

        let count = ClientMessage::Count {
            subscription_id: "count:1".to_string(),
            filters: vec![Filter::new().kinds(vec![7])],
        };
        assert_eq!(count.to_json().unwrap(), r#"["COUNT","count:1",{"kinds":[7]}]"#);
    }

    #[test]
    fn test_relay_frames() {
        let event_json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}]"#;
        match RelayMessage::from_json(event_json).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.content, "Hello");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            RelayMessage::from_json(r#"["OK","e1",false,"duplicate: already have it"]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "e1".to_string(),
                success: false,
                message: "duplicate: already have it".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose {
                subscription_id: "sub1".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap(),
            RelayMessage::Notice {
                message: "rate limited".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["AUTH","challenge123"]"#).unwrap(),
            RelayMessage::Auth {
                challenge: "challenge123".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["COUNT","sub1",{"count":42}]"#).unwrap(),
            RelayMessage::Count {
                subscription_id: "sub1".to_string(),
                count: 42
            }
        );
    }

    #[test]
    fn test_reason_is_optional() {
        // Some relays omit the trailing message on OK and CLOSED.
        assert_eq!(
            RelayMessage::from_json(r#"["OK","e1",true]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "e1".to_string(),
                success: true,
                message: String::new(),
            }
        );
        let closed = RelayMessage::from_json(r#"["CLOSED","sub1"]"#).unwrap();
        assert_eq!(closed.subscription_id(), Some("sub1"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            RelayMessage::from_json("not valid json"),
            Err(MessageError::InvalidFormat(_))
        ));
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(matches!(
            RelayMessage::from_json(r#"["UNKNOWN"]"#),
            Err(MessageError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE"]"#),
            Err(MessageError::MissingField(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["OK","e1","yes",""]"#),
            Err(MessageError::InvalidFormat(_))
        ));
        assert!(RelayMessage::from_json(r#"["COUNT","sub1",{}]"#).is_err());
    }

    #[test]
    fn test_filter_wire_form() {
        let filter = Filter::new()
            .kinds(vec![1])
            .limit(10)
            .pubkey_refs(vec!["abc".to_string()]);
        assert_eq!(
            serde_json::to_string(&filter).unwrap(),
            r##"{"kinds":[1],"limit":10,"#p":["abc"]}"##
        );

        let parsed: Filter =
            serde_json::from_str(r##"{"kinds":[1],"#p":["abc"],"search":"rust"}"##).unwrap();
        assert_eq!(parsed.search.as_deref(), Some("rust"));
        assert_eq!(parsed.tags.get("#p"), Some(&vec!["abc".to_string()]));
    }

    #[test]
    fn test_filter_matches() {
        let event = sample_event();

        assert!(Filter::new().matches(&event));
        assert!(Filter::new().kinds(vec![1, 2]).authors(vec!["b".repeat(64)]).matches(&event));
        assert!(Filter::new().since(1500).until(1500).matches(&event));
        assert!(Filter::new().tag("t", vec!["nostr".to_string()]).matches(&event));
        assert!(Filter::new().event_refs(vec!["c".repeat(64)]).matches(&event));
        assert!(Filter::new().search("anything").matches(&event));

        assert!(!Filter::new().kinds(vec![7]).matches(&event));
        assert!(!Filter::new().since(1501).matches(&event));
        assert!(!Filter::new().until(1499).matches(&event));
        assert!(!Filter::new().pubkey_refs(vec!["b".repeat(64)]).matches(&event));
        assert!(!Filter::new().ids(vec!["f".repeat(64)]).matches(&event));
    }

    #[test]
    fn test_matches_any() {
        let event = sample_event();
        let filters = vec![Filter::new().kinds(vec![7]), Filter::new().kinds(vec![1])];
        assert!(matches_any(&filters, &event));
        assert!(!matches_any(&filters[..1], &event));
        assert!(!matches_any(&[], &event));
    }
}

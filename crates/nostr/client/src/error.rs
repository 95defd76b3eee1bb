//! Client error types

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed protocol message
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::message::MessageError),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// HTTP error (NIP-11 fetch)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Relay refused to be added to the pool
    #[error("Relay refused: {0}")]
    RelayRefused(String),

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// One or more filters failed validation
    #[error("Invalid filter(s) detected:\n{}", .0.join("\n"))]
    InvalidFilter(Vec<String>),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Signing failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// No signer configured
    #[error("No signer configured")]
    NoSigner,

    /// Invalid event
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Multi-relay publish did not reach enough relays
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Why a single relay did not accept a published event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayPublishError {
    #[error("timed out waiting for relay acknowledgment")]
    Timeout,

    #[error("relay rejected event: {0}")]
    Rejected(String),

    #[error("relay is not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

/// Aggregated failure of a multi-relay publish.
///
/// Carries every per-relay cause and the relays that did accept the event.
#[derive(Error, Debug, Clone)]
#[error("Not enough relays received the event ({} published, {} required)", .published.len(), .required)]
pub struct PublishError {
    pub errors: HashMap<String, RelayPublishError>,
    pub published: HashSet<String>,
    pub required: usize,
}

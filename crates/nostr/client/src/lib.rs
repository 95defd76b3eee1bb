//! Nostr relay coordination engine.
//!
//! This crate provides:
//! - WebSocket connections to relays with reconnection and flapping detection
//! - A relay pool with temporary relays, blacklists and system-disconnect detection
//! - Subscriptions that group on the wire, deduplicate and stop on EOSE
//! - Multi-relay publishing with per-relay errors and NIP-42 auth retries
//! - Outbox-model relay selection from NIP-65 relay lists
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{ClientConfig, Filter, NostrClient, SubscriptionEvent, SubscriptionOptions};
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let client = NostrClient::new(ClientConfig {
//!         explicit_relay_urls: vec!["wss://relay.damus.io".to_string()],
//!         ..Default::default()
//!     });
//!     client.connect(None).await;
//!
//!     let subscription = client
//!         .subscribe(
//!             vec![Filter::new().kinds(vec![1]).limit(10)],
//!             SubscriptionOptions::close_on_eose(),
//!         )
//!         .await?;
//!     let mut stream = subscription.take_stream().expect("fresh subscription");
//!
//!     while let Some(item) = stream.next_event().await {
//!         match item {
//!             SubscriptionEvent::Event { event, relay, .. } => {
//!                 println!("{} from {:?}", event.id, relay);
//!             }
//!             SubscriptionEvent::Eose => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod auth;
mod cache;
mod client;
mod config;
mod error;
mod filter;
mod grouping;
mod info;
mod manager;
mod message;
mod normalize;
mod outbox;
mod pending;
mod pool;
mod publisher;
mod relay;
mod relay_set;
mod signer;
mod status;
mod subscription;
mod validation;

pub use auth::{AllowListPolicy, AuthDecision, AuthPolicy, DenyPolicy, SignInPolicy};
pub use cache::{
    CacheAdapter, CacheConfig, CacheResponse, CachedEvent, EventCache, MemoryCache,
    RelayStatusRecord,
};
pub use client::{
    ClientBuilder, ClientNotification, NostrClient, PublishStatus, RelayValidationStats,
};
pub use config::{
    ClientConfig, EoseConfig, FilterValidationMode, FlappingConfig, SystemDisconnectConfig,
};
pub use error::{ClientError, PublishError, RelayPublishError, Result};
pub use filter::{filter_fingerprint, filter_issues, merge_filter_lists, process_filters};
pub use grouping::{GroupStatus, GroupableDelayType, RelaySubscriber, SubscriptionItem};
pub use info::info_url;
pub use manager::SubscriptionManager;
pub use message::{ClientMessage, Filter, MessageError, RelayMessage, matches_any};
pub use normalize::{normalize, normalize_relay_url, try_normalize_relay_url};
pub use outbox::{OutboxConfig, OutboxModel, RelaySelector};
pub use pending::{PendingError, PendingRequests, wait_for};
pub use pool::{ConnectionFilter, PoolNotification, PoolStats, RelayPool};
pub use relay::{PublishAck, Relay, RelayConfig, RelayNotification};
pub use relay_set::{PublishTarget, RelaySet, publish_to_targets};
pub use signer::{Keys, Signer};
pub use status::{ConnectionStats, RelayStatus};
pub use subscription::{
    CacheUsage, MuteFilter, Subscription, SubscriptionEvent, SubscriptionOptions,
    SubscriptionStream,
};
pub use validation::{ValidationRatioFn, ValidationSampler, default_ratio_fn};

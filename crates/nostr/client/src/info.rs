//! NIP-11 relay information
//!
//! Fetched over HTTP(S) from the relay's own URL and kept for a day, both on
//! the relay handle and in the cache adapter's relay status record.

use crate::error::{ClientError, Result};
use crate::relay::Relay;
use nostr::{RELAY_INFORMATION_MIME, RelayInformation};
use reqwest::header::ACCEPT;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

const INFO_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// `wss://host/path` -> `https://host/path`, `ws://` -> `http://`.
pub fn info_url(relay_url: &str) -> Result<String> {
    let mut url = Url::parse(relay_url)?;
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported relay scheme {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(relay_url.to_string()))?;
    Ok(url.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Relay {
    /// The relay's NIP-11 document. Served from cache for 24 hours unless
    /// `force` is set.
    pub async fn fetch_info(&self, force: bool) -> Result<RelayInformation> {
        if !force && let Some(info) = self.cached_info() {
            return Ok(info);
        }

        let url = info_url(self.url())?;
        debug!("Fetching relay information for {} from {}", self.url(), url);
        let client = reqwest::Client::builder()
            .timeout(self.config().connect_timeout)
            .build()?;
        let info: RelayInformation = client
            .get(&url)
            .header(ACCEPT, RELAY_INFORMATION_MIME)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(
            "Relay {} supports NIPs {:?}",
            self.url(),
            info.supported_nips
        );
        *self.inner.info.lock() = Some((info.clone(), Instant::now()));
        if let Some(cache) = &self.inner.cache {
            let mut record = cache.relay_status(self.url()).unwrap_or_default();
            record.info = Some(info.clone());
            record.info_fetched_at = Some(unix_now());
            cache.update_relay_status(self.url(), record);
        }
        Ok(info)
    }

    fn cached_info(&self) -> Option<RelayInformation> {
        if let Some((info, fetched)) = self.inner.info.lock().as_ref()
            && fetched.elapsed() < INFO_TTL
        {
            return Some(info.clone());
        }

        let record = self.inner.cache.as_ref()?.relay_status(self.url())?;
        let fetched_at = record.info_fetched_at?;
        if unix_now().saturating_sub(fetched_at) >= INFO_TTL.as_secs() {
            return None;
        }
        let info = record.info?;
        *self.inner.info.lock() = Some((info.clone(), Instant::now()));
        Some(info)
    }
}

//! Relay URL normalization
//!
//! Every relay is keyed by its normalized URL: lowercase scheme and host,
//! no fragment, and a trailing `/` on the path.

use crate::error::{ClientError, Result};
use url::Url;

/// Normalize a relay URL.
///
/// Accepts `ws://` and `wss://` URLs. A bare host is treated as `wss://`.
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{}", trimmed)
    };

    let mut parsed = Url::parse(&with_scheme)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ClientError::InvalidUrl(format!("missing host: {}", url)));
    }

    parsed.set_fragment(None);

    let mut normalized = parsed.to_string();
    if !normalized.ends_with('/') && parsed.query().is_none() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Like [`normalize_relay_url`] but swallows the error.
pub fn try_normalize_relay_url(url: &str) -> Option<String> {
    normalize_relay_url(url).ok()
}

/// Normalize a list of URLs, dropping invalid entries and duplicates while
/// keeping first-seen order.
pub fn normalize(urls: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(urls.len());
    for url in urls {
        if let Some(normalized) = try_normalize_relay_url(url)
            && !out.contains(&normalized)
        {
            out.push(normalized);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_trailing_slash() {
        assert_eq!(normalize_relay_url("wss://relay.damus.io").unwrap(), "wss://relay.damus.io/");
        assert_eq!(normalize_relay_url("wss://relay.damus.io/").unwrap(), "wss://relay.damus.io/");
        assert_eq!(
            normalize_relay_url("wss://relay.example/nostr").unwrap(),
            "wss://relay.example/nostr/"
        );
    }

    #[test]
    fn test_normalize_lowercases_and_strips_fragment() {
        assert_eq!(normalize_relay_url("WSS://Relay.Example.COM#x").unwrap(), "wss://relay.example.com/");
    }

    #[test]
    fn test_normalize_bare_host() {
        assert_eq!(normalize_relay_url("nos.lol").unwrap(), "wss://nos.lol/");
    }

    #[test]
    fn test_normalize_rejects_http() {
        assert!(matches!(
            normalize_relay_url("https://relay.example"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(try_normalize_relay_url("not a url at all").is_none());
    }

    #[test]
    fn test_normalize_list_dedupes() {
        let urls = vec![
            "wss://a.example".to_string(),
            "wss://A.example/".to_string(),
            "garbage://".to_string(),
            "wss://b.example".to_string(),
        ];
        assert_eq!(normalize(&urls), vec!["wss://a.example/", "wss://b.example/"]);
    }
}

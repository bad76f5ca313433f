//! Signing-key cache for token verification.
//!
//! Keys are cached for exactly as long as the issuer says they are fresh
//! (`Cache-Control: max-age` minus `Age`). A miss always means a live fetch:
//! stale keys are never served in place of a failed fetch.

use log::{debug, warn};
use reqwest::header::{HeaderMap, AGE, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::keyed_cache::SharedCache;
use crate::metrics;

/// Key id → raw key bytes (PEM text as published) for one issuer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeySet {
    keys: BTreeMap<String, Vec<u8>>,
}

impl SigningKeySet {
    pub fn new(keys: BTreeMap<String, Vec<u8>>) -> Self {
        Self { keys }
    }

    pub fn get(&self, key_id: &str) -> Option<&[u8]> {
        self.keys.get(key_id).map(Vec::as_slice)
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Failed to fetch signing keys from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Signing key endpoint {url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Malformed signing key document from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

pub struct CertCache {
    cache: SharedCache,
    client: reqwest::Client,
}

impl CertCache {
    pub fn new(cache: SharedCache, client: reqwest::Client) -> Self {
        Self { cache, client }
    }

    /// Builds a cache with its own HTTP client bounded by `request_timeout`.
    pub fn with_timeout(cache: SharedCache, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::new(cache, client))
    }

    fn cache_key(issuer_cert_url: &str) -> String {
        format!("certs:{}", issuer_cert_url)
    }

    /// Returns the issuer's current signing keys, from cache when fresh.
    pub async fn get_keys(&self, issuer_cert_url: &str) -> Result<SigningKeySet, CertError> {
        let cache_key = Self::cache_key(issuer_cert_url);

        match self.cache.get(&cache_key).await {
            Ok(Some(bytes)) => match bincode::deserialize::<SigningKeySet>(&bytes) {
                Ok(keys) => {
                    metrics::increment_cache_hit("certs");
                    debug!("Signing keys for {} served from cache", issuer_cert_url);
                    return Ok(keys);
                }
                Err(e) => warn!("Discarding undecodable cached keys for {}: {}", issuer_cert_url, e),
            },
            Ok(None) => {}
            Err(e) => {
                metrics::increment_cache_error("certs_get");
                warn!("Cert cache lookup failed for {}, fetching live: {}", issuer_cert_url, e);
            }
        }
        metrics::increment_cache_miss("certs");

        let (keys, ttl) = match self.fetch(issuer_cert_url).await {
            Ok(fetched) => {
                metrics::increment_cert_fetch("ok");
                fetched
            }
            Err(e) => {
                metrics::increment_cert_fetch("error");
                return Err(e);
            }
        };

        if ttl.is_zero() {
            debug!("Signing keys for {} are not cacheable (no remaining freshness)", issuer_cert_url);
            return Ok(keys);
        }

        match bincode::serialize(&keys) {
            Ok(bytes) => {
                if let Err(e) = self.cache.set(&cache_key, &bytes, ttl).await {
                    metrics::increment_cache_error("certs_set");
                    warn!("Failed to cache signing keys for {}: {}", issuer_cert_url, e);
                }
            }
            Err(e) => warn!("Failed to encode signing keys for {}: {}", issuer_cert_url, e),
        }

        Ok(keys)
    }

    async fn fetch(&self, url: &str) -> Result<(SigningKeySet, Duration), CertError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| CertError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CertError::Status {
                url: url.to_string(),
                status,
            });
        }

        let ttl = ttl_from_headers(response.headers());
        let body = response.bytes().await.map_err(|source| CertError::Fetch {
            url: url.to_string(),
            source,
        })?;

        let document: BTreeMap<String, String> =
            serde_json::from_slice(&body).map_err(|source| CertError::Decode {
                url: url.to_string(),
                source,
            })?;

        let keys = document
            .into_iter()
            .map(|(key_id, pem)| (key_id, pem.into_bytes()))
            .collect();

        debug!("Fetched signing keys from {} (ttl {:?})", url, ttl);
        Ok((SigningKeySet::new(keys), ttl))
    }
}

/// Remaining freshness of a response: `max(0, max-age - Age)` seconds.
/// Missing or unparseable headers count as zero.
pub fn ttl_from_headers(headers: &HeaderMap) -> Duration {
    let max_age = headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|directive| {
            let (name, value) = directive.trim().split_once('=')?;
            if name.trim().eq_ignore_ascii_case("max-age") {
                value.trim().trim_matches('"').parse::<i64>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let age = headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);

    Duration::from_secs(max_age.saturating_sub(age).max(0) as u64)
}

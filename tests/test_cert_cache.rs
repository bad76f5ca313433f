//! Integration tests for the signing-key cache using wiremock.
//!
//! These tests mock the issuer endpoint to verify freshness handling without
//! hitting a real token issuer.

use async_trait::async_trait;
use confsync::cert_cache::{CertCache, CertError};
use confsync::keyed_cache::{CacheError, KeyedCache, MemoryCache, SharedCache};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEYS: &str = r#"{
    "kid-1": "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
    "kid-2": "-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n"
}"#;

/// Memory cache that records the TTL of every `set`.
#[derive(Default)]
struct RecordingCache {
    inner: MemoryCache,
    sets: Mutex<Vec<(String, Duration)>>,
}

impl RecordingCache {
    fn sets(&self) -> Vec<(String, Duration)> {
        self.sets.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyedCache for RecordingCache {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.sets.lock().unwrap().push((key.to_string(), ttl));
        self.inner.set(key, value, ttl).await
    }
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get(key).await
    }
    async fn delete_multi(&self, keys: &[String]) -> Result<(), CacheError> {
        self.inner.delete_multi(keys).await
    }
    async fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush().await
    }
}

/// Cache whose reads and writes all fail.
struct DownCache;

#[async_trait]
impl KeyedCache for DownCache {
    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".to_string()))
    }
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(CacheError::Unavailable("down".to_string()))
    }
    async fn delete_multi(&self, _keys: &[String]) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".to_string()))
    }
    async fn flush(&self) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".to_string()))
    }
}

fn keys_response(cache_control: &str, age: Option<&str>) -> ResponseTemplate {
    let mut response = ResponseTemplate::new(200)
        .insert_header("Cache-Control", cache_control)
        .set_body_string(KEYS);
    if let Some(age) = age {
        response = response.insert_header("Age", age);
    }
    response
}

/// Keys are cached for max-age minus Age and served from cache afterwards.
#[tokio::test]
async fn test_keys_cached_for_remaining_freshness() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(keys_response("public, max-age=3600", Some("100")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let cache = Arc::new(RecordingCache::default());
    let certs = CertCache::new(cache.clone(), reqwest::Client::new());
    let url = format!("{}/certs", mock_server.uri());

    let keys = certs.get_keys(&url).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.get("kid-1").unwrap().starts_with(b"-----BEGIN CERTIFICATE-----"));

    assert_eq!(
        cache.sets(),
        vec![(format!("certs:{}", url), Duration::from_secs(3500))]
    );

    // Served from cache: the mock expects exactly one request.
    let again = certs.get_keys(&url).await.unwrap();
    assert_eq!(again, keys);
}

/// max-age=0 keys are returned but never cached.
#[tokio::test]
async fn test_zero_freshness_is_not_cached() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(keys_response("max-age=0", None))
        .expect(2)
        .mount(&mock_server)
        .await;

    let cache = Arc::new(RecordingCache::default());
    let certs = CertCache::new(cache.clone(), reqwest::Client::new());
    let url = format!("{}/certs", mock_server.uri());

    assert_eq!(certs.get_keys(&url).await.unwrap().len(), 2);
    assert_eq!(certs.get_keys(&url).await.unwrap().len(), 2);
    assert!(cache.sets().is_empty());
}

/// Missing Cache-Control behaves like max-age=0.
#[tokio::test]
async fn test_missing_cache_control_is_not_cached() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(KEYS))
        .mount(&mock_server)
        .await;

    let cache = Arc::new(RecordingCache::default());
    let certs = CertCache::new(cache.clone(), reqwest::Client::new());

    certs.get_keys(&format!("{}/certs", mock_server.uri())).await.unwrap();
    assert!(cache.sets().is_empty());
}

/// HTTP errors are surfaced, never replaced by stale keys.
#[tokio::test]
async fn test_http_error_is_surfaced() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let cache: SharedCache = Arc::new(MemoryCache::new());
    let certs = CertCache::new(cache, reqwest::Client::new());

    let result = certs.get_keys(&format!("{}/certs", mock_server.uri())).await;
    match result {
        Err(CertError::Status { status, .. }) => assert_eq!(status.as_u16(), 500),
        other => panic!("Expected a status error, got {:?}", other),
    }
}

/// Expired keys are refetched; a failing refetch is an error, not the old keys.
#[tokio::test]
async fn test_no_stale_fallback_after_expiry() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(keys_response("max-age=1", None))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let cache: SharedCache = Arc::new(MemoryCache::new());
    let certs = CertCache::new(cache, reqwest::Client::new());
    let url = format!("{}/certs", mock_server.uri());

    certs.get_keys(&url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(certs.get_keys(&url).await.is_err());
}

/// Malformed key documents are an error.
#[tokio::test]
async fn test_malformed_document_is_an_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not valid json"))
        .mount(&mock_server)
        .await;

    let certs = CertCache::new(Arc::new(MemoryCache::new()), reqwest::Client::new());
    let result = certs.get_keys(&format!("{}/certs", mock_server.uri())).await;
    assert!(matches!(result, Err(CertError::Decode { .. })));
}

/// A broken cache tier degrades to live fetches.
#[tokio::test]
async fn test_cache_failures_fall_back_to_live_fetch() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(keys_response("max-age=600", None))
        .expect(2)
        .mount(&mock_server)
        .await;

    let certs = CertCache::new(Arc::new(DownCache), reqwest::Client::new());
    let url = format!("{}/certs", mock_server.uri());

    assert_eq!(certs.get_keys(&url).await.unwrap().len(), 2);
    assert_eq!(certs.get_keys(&url).await.unwrap().len(), 2);
}

use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "confsync:".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_connect_attempts() -> u32 {
    10
}
fn default_query_timeout_seconds() -> u64 {
    60
}
fn default_snapshot_cache_ttl_seconds() -> u64 {
    3600 // 1 hour
}
fn default_snapshot_cache_shards() -> usize {
    4
}
fn default_max_fold_entries() -> usize {
    1000
}
fn default_page_buffer() -> usize {
    4
}
fn default_cert_request_timeout_seconds() -> u64 {
    10
}
fn default_dispatch_batch_size() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_listen_addr() -> String {
    "0.0.0.0:9000".to_string()
}

/// Which keyed-cache backend to run with. Chosen once at startup.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheBackendSettings {
    #[default]
    Memory,
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheSettings {
    #[serde(default)]
    pub backend: CacheBackendSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackendSettings {
    #[default]
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_connect_attempts")]
        connect_attempts: u32,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackendSettings,
    /// Upper bound for listing queries.
    #[serde(default = "default_query_timeout_seconds")]
    pub query_timeout_seconds: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackendSettings::default(),
            query_timeout_seconds: default_query_timeout_seconds(),
        }
    }
}

impl StoreSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotSettings {
    #[serde(default = "default_snapshot_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Number of cache keys the latest snapshot is spread over.
    #[serde(default = "default_snapshot_cache_shards")]
    pub cache_shards: usize,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_snapshot_cache_ttl_seconds(),
            cache_shards: default_snapshot_cache_shards(),
        }
    }
}

impl SnapshotSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChangeLogSettings {
    /// Maximum entries folded by a single `since` call.
    #[serde(default = "default_max_fold_entries")]
    pub max_fold_entries: usize,
    /// Pages buffered between the catch-up producer and consumer.
    #[serde(default = "default_page_buffer")]
    pub page_buffer: usize,
}

impl Default for ChangeLogSettings {
    fn default() -> Self {
        Self {
            max_fold_entries: default_max_fold_entries(),
            page_buffer: default_page_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertSettings {
    #[serde(default = "default_cert_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for CertSettings {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_cert_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NotificationSettings {
    #[default]
    Disabled,
    /// Hand candidates to the logging dispatcher in batches.
    Log {
        #[serde(default = "default_dispatch_batch_size")]
        batch_size: usize,
    },
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "pretty")]
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
    #[serde(default)]
    pub change_log: ChangeLogSettings,
    #[serde(default)]
    pub certs: CertSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Loads `Config.toml` from the working directory if present, then
    /// applies environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_overrides(|name| env::var(name).ok());
        Ok(settings)
    }

    /// Loads an explicit configuration file (format inferred from the
    /// extension), then applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_overrides(|name| env::var(name).ok());
        Ok(settings)
    }

    /// Environment overrides: `CONFSYNC_REDIS_URL`, `CONFSYNC_DATABASE_URL`,
    /// `CONFSYNC_LOG_LEVEL`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = lookup("CONFSYNC_REDIS_URL") {
            let key_prefix = match &self.cache.backend {
                CacheBackendSettings::Redis { key_prefix, .. } => key_prefix.clone(),
                CacheBackendSettings::Memory => default_key_prefix(),
            };
            self.cache.backend = CacheBackendSettings::Redis { url, key_prefix };
        }

        if let Some(url) = lookup("CONFSYNC_DATABASE_URL") {
            let (max_connections, connect_attempts) = match &self.store.backend {
                StoreBackendSettings::Postgres {
                    max_connections,
                    connect_attempts,
                    ..
                } => (*max_connections, *connect_attempts),
                StoreBackendSettings::Memory => (default_max_connections(), default_connect_attempts()),
            };
            self.store.backend = StoreBackendSettings::Postgres {
                url,
                max_connections,
                connect_attempts,
            };
        }

        if let Some(level) = lookup("CONFSYNC_LOG_LEVEL") {
            self.log.level = level;
        }
    }
}

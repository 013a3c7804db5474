use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub coalesce: CoalesceConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Requests under this prefix are proxied upstream.
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Operational endpoints (health, stats, metrics, stream).
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,

    /// Largest request body relayed upstream. Zero lifts the limit.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,

    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every key written to Redis.
    #[serde(default)]
    pub key_prefix: Option<String>,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStage {
    /// Evaluated before content-based rules.
    Priority,
    /// Evaluated after content-based rules.
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRuleConfig {
    /// Regex matched against the request path (query string excluded).
    pub pattern: String,
    pub ttl_secs: u64,
    #[serde(default = "default_rule_stage")]
    pub stage: RuleStage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Smart cache switch. When off, every request goes straight upstream.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Path rules. Empty means the built-in table.
    #[serde(default)]
    pub rules: Vec<PathRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Coalesce requests of this process in memory before touching the store.
    #[serde(default = "default_true")]
    pub local_waiters: bool,

    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Local waiters allowed per fingerprint. Requests beyond this
    /// coordinate through the store instead.
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_interval")]
    pub interval_ms: u64,

    /// Pending snapshots per observer before sends are dropped.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_route_prefix() -> String {
    "/api".to_string()
}

fn default_admin_prefix() -> String {
    "/_proxy".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_upstream_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_idle_per_host() -> usize {
    32
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_rule_stage() -> RuleStage {
    RuleStage::Fallback
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    15
}

fn default_lease() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    100
}

fn default_max_poll_attempts() -> u32 {
    100
}

fn default_max_waiters() -> usize {
    1024
}

fn default_broadcast_interval() -> u64 {
    1000
}

fn default_observer_buffer() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            route_prefix: default_route_prefix(),
            admin_prefix: default_admin_prefix(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: default_upstream_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            pool_max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            key_prefix: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_ttl(),
            rules: Vec::new(),
        }
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_waiters: true,
            lease_secs: default_lease(),
            poll_interval_ms: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
            max_waiters: default_max_waiters(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_broadcast_interval(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ProxyResult<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        url::Url::parse(&self.upstream.url).map_err(|e| {
            ProxyError::ConfigError(format!("Invalid upstream url {}: {}", self.upstream.url, e))
        })?;

        if !self.server.route_prefix.starts_with('/') {
            return Err(ProxyError::ConfigError(
                "server.route_prefix must start with '/'".to_string(),
            ));
        }
        if !self.server.admin_prefix.starts_with('/') || self.server.admin_prefix.len() < 2 {
            return Err(ProxyError::ConfigError(
                "server.admin_prefix must be a non-root path".to_string(),
            ));
        }

        if self.coalesce.lease_secs == 0 {
            return Err(ProxyError::ConfigError(
                "coalesce.lease_secs must be positive".to_string(),
            ));
        }
        if self.coalesce.local_waiters && self.coalesce.max_waiters == 0 {
            return Err(ProxyError::ConfigError(
                "coalesce.max_waiters must be positive when local waiters are enabled".to_string(),
            ));
        }
        if self.coalesce.poll_interval_ms == 0 || self.coalesce.max_poll_attempts == 0 {
            return Err(ProxyError::ConfigError(
                "coalesce poll interval and attempts must be positive".to_string(),
            ));
        }

        for rule in &self.cache.rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                ProxyError::ConfigError(format!("Invalid cache rule {}: {}", rule.pattern, e))
            })?;
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl CoalesceConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on how long a follower waits for its leader.
    pub fn follower_budget(&self) -> Duration {
        self.poll_interval() * self.max_poll_attempts
    }
}

impl BroadcastConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

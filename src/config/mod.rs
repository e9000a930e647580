use crate::utils::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Number of worker tasks draining the accept queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Accepted sockets waiting for a worker before submit is refused.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Requests allowed in flight at once, independent of worker count.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Total byte budget across all cached responses.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
    /// Largest single entry (payload + key + overhead) the cache accepts.
    #[serde(default = "default_cache_max_element_bytes")]
    pub max_element_bytes: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_buckets")]
    pub buckets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Slots in the flat connection table.
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
    /// How long an idle upstream socket may wait before it is closed.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-read timeout while receiving an origin response.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_in_flight() -> usize {
    200
}

fn default_max_request_bytes() -> usize {
    8192
}

fn default_max_response_bytes() -> usize {
    1024 * 1024
}

fn default_user_agent() -> String {
    concat!("memproxy/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cache_max_element_bytes() -> usize {
    1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_buckets() -> usize {
    1024
}

fn default_pool_capacity() -> usize {
    20
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_recv_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
            max_request_bytes: default_max_request_bytes(),
            max_response_bytes: default_max_response_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_max_bytes(),
            max_element_bytes: default_cache_max_element_bytes(),
            ttl_secs: default_cache_ttl_secs(),
            buckets: default_cache_buckets(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            recv_timeout_ms: default_recv_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl UpstreamSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            return Err(ProxyError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.server.queue_capacity == 0 {
            return Err(ProxyError::Config(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.server.max_in_flight == 0 {
            return Err(ProxyError::Config(
                "max_in_flight must be greater than 0".to_string(),
            ));
        }

        if self.cache.buckets == 0 {
            return Err(ProxyError::Config(
                "cache.buckets must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_element_bytes > self.cache.max_bytes {
            return Err(ProxyError::Config(
                "cache.max_element_bytes cannot exceed cache.max_bytes".to_string(),
            ));
        }

        if self.upstream.capacity == 0 {
            return Err(ProxyError::Config(
                "upstream.capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[server]
bind_address = "0.0.0.0"
bind_port = 8080
workers = 4
queue_capacity = 64
max_in_flight = 200
max_request_bytes = 8192
max_response_bytes = 1048576

[cache]
max_bytes = 67108864        # 64 MiB total budget
max_element_bytes = 1048576 # Largest cacheable response
ttl_secs = 3600
buckets = 1024

[upstream]
capacity = 20
keep_alive_secs = 30
connect_timeout_ms = 5000
recv_timeout_ms = 5000

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| ProxyError::Config(format!("Failed to write example config: {}", e)))?;

        Ok(())
    }
}

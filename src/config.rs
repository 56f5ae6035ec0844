use serde::Deserialize;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

// every section rejects unknown keys so a typo in the config file is a
// startup failure rather than a silently ignored option

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: default_store_path(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: default_max_entries(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests per minute for everything except the health endpoints.
    #[serde(default = "default_rate_limit")]
    pub default: u32,
    #[serde(default = "default_rate_limit_health")]
    pub health: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            default: default_rate_limit(),
            health: default_rate_limit_health(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            origins: default_cors_origins(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    #[serde(default = "default_health_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            check_timeout_ms: default_check_timeout_ms(),
            cache_ttl_ms: default_health_cache_ttl_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
    /// Directory scanned for schedule/station/connection files at startup.
    pub dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: default_log_dir(),
        }
    }
}

fn default_topic() -> String {
    "/topic/darwin.pushport-v16".to_string()
}

fn default_heartbeat_ms() -> u64 {
    15_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("darwin_store.json")
}

fn default_retention_days() -> u32 {
    7
}

fn default_max_entries() -> usize {
    500
}

fn default_max_age_hours() -> u32 {
    24
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_rate_limit() -> u32 {
    120
}

fn default_rate_limit_health() -> u32 {
    60
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_check_timeout_ms() -> u64 {
    1_000
}

fn default_health_cache_ttl_ms() -> u64 {
    2_000
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug)]
pub struct ConfigError {
    what: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid configuration: {}", self.what)
    }
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server.listen.parse().map_err(|_| ConfigError {
            what: format!("server.listen is not host:port: {}", self.server.listen),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.broker.host.is_empty() {
            return Err(ConfigError {
                what: "broker.host must not be empty".to_string(),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError {
                what: "cache.max_entries must be at least 1".to_string(),
            });
        }
        if self.rate_limit.default == 0 || self.rate_limit.health == 0 {
            return Err(ConfigError {
                what: "rate limits must be at least 1 request per minute".to_string(),
            });
        }
        Ok(())
    }
}

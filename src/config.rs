use crate::error::{RelayError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Request relay configuration
    pub relay: RelayConfig,
    /// Upstream proxy pool configuration
    pub proxy: ProxyPoolConfig,
    /// Per-client throttle configuration
    pub throttle: ThrottleConfig,
    /// Load shedding configuration
    pub load_shed: LoadShedConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in logs and on the health endpoint
    pub name: String,
    /// Host to bind the HTTP listener to (default: 0.0.0.0)
    pub host: String,
    /// Port for the HTTP listener (default: 8080)
    pub port: u16,
    /// Optional TLS listener
    pub https: Option<TlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub host: String,
    pub port: u16,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of response bytes relayed per request
    pub response_size_limit: u64,
    /// Substrings that make a target URL disallowed
    pub blocked_phrases: Vec<String>,
    /// At least one of these request headers must be present
    pub required_headers: Vec<String>,
    /// Timeout for establishing the upstream connection
    pub connect_timeout: Duration,
    /// Timeout for the whole upstream exchange, body included
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    Cooldown,
    RoundRobin,
}

impl FromStr for RotationStrategy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cooldown" => Ok(Self::Cooldown),
            "round_robin" | "roundrobin" | "round-robin" => Ok(Self::RoundRobin),
            other => Err(RelayError::InvalidConfig(format!(
                "Unknown PROXY_ROTATION_STRATEGY: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Route upstream requests through the proxy pool
    pub enabled: bool,
    /// Proxy list used for every target (or http targets when split)
    pub list_path: PathBuf,
    /// Optional separate proxy list for https targets
    pub https_list_path: Option<PathBuf>,
    /// Selection policy
    pub strategy: RotationStrategy,
    /// Uses (per proxy, or globally without proxies) before cooling down
    pub requests_till_rate_limit: u32,
    /// Length of the cooldown window
    pub rate_limit_sleep: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOn {
    /// Key clients by the socket peer address
    Ip,
    /// Key clients by the first X-Forwarded-For hop
    ForwardedFor,
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub key: ThrottleOn,
    /// Sustained requests per second per client
    pub rate_per_second: u32,
    /// Burst size per client
    pub burst: u32,
    /// Client keys that are never throttled
    pub exempt: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoadShedConfig {
    /// Requests are rejected while the smoothed lag is above this
    pub max_lag: Duration,
    /// How often the scheduler lag is sampled
    pub sample_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// A `.env` file in the working directory is honoured if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let https = if parse_env("ENABLE_HTTPS", false)? {
            Some(TlsConfig {
                host: get_env_or("HTTPS_HOST", "0.0.0.0"),
                port: parse_env("HTTPS_PORT", 8443)?,
                key_path: get_env_or("SSL_KEY_PATH", "/etc/ssl/self-signed/server.key").into(),
                cert_path: get_env_or("SSL_CERT_PATH", "/etc/ssl/self-signed/server.crt").into(),
            })
        } else {
            None
        };

        let throttle_key = match get_env_or("THROTTLE_ON", "XFF").to_uppercase().as_str() {
            "IP" => ThrottleOn::Ip,
            _ => ThrottleOn::ForwardedFor,
        };

        Ok(Config {
            server: ServerConfig {
                name: get_env_or("SERVER_NAME", "cors.devkat.org"),
                host: get_env_or("WEB_HOST", "0.0.0.0"),
                port: parse_env("WEB_PORT", 8080)?,
                https,
            },
            relay: RelayConfig {
                response_size_limit: parse_env("RESPONSE_SIZE_LIMIT", 2_097_152)?,
                blocked_phrases: split_list(&get_env_or("BLOCKED_PHRASES", "porn,sexy")),
                required_headers: vec!["origin".to_string(), "x-requested-with".to_string()],
                connect_timeout: Duration::from_millis(parse_env(
                    "UPSTREAM_CONNECT_TIMEOUT_MS",
                    10_000,
                )?),
                request_timeout: Duration::from_millis(parse_env(
                    "UPSTREAM_REQUEST_TIMEOUT_MS",
                    30_000,
                )?),
            },
            proxy: ProxyPoolConfig {
                enabled: parse_env("ENABLE_PROXIES", false)?,
                list_path: get_env_or("PROXY_LIST_PATH", "proxies.txt").into(),
                https_list_path: env::var("HTTPS_PROXY_LIST_PATH")
                    .ok()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
                strategy: get_env_or("PROXY_ROTATION_STRATEGY", "cooldown").parse()?,
                requests_till_rate_limit: parse_env("REQS_TILL_RATE_LIMIT", 5)?,
                rate_limit_sleep: Duration::from_millis(parse_env(
                    "RATE_LIMIT_SLEEP_IN_MS",
                    60_000,
                )?),
            },
            throttle: ThrottleConfig {
                key: throttle_key,
                rate_per_second: parse_env("THROTTLE_RATE", 3)?,
                burst: parse_env("THROTTLE_BURST", 10)?,
                exempt: split_list(&get_env_or("THROTTLE_EXEMPT", "")),
            },
            load_shed: LoadShedConfig {
                max_lag: Duration::from_millis(parse_env("MAX_LAG_MS", 70)?),
                sample_interval: Duration::from_millis(parse_env("LAG_INTERVAL_MS", 500)?),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the HTTP listener address
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get the HTTPS listener address, if enabled
    pub fn https_addr(&self) -> Option<String> {
        self.server
            .https
            .as_ref()
            .map(|tls| format!("{}:{}", tls.host, tls.port))
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| RelayError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

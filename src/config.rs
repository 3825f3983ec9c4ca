use std::net::SocketAddr;
use std::time::Duration;

// ── Constants ────────────────────────────────────────────────────────────────

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid BIND_ADDR {value:?}: {source}")]
    BindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

// ── Fetch settings ───────────────────────────────────────────────────────────

/// Settings for the outbound image download.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    /// Bodies larger than this are reported as a fetch failure.
    pub max_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
            max_bytes: 20 * 1024 * 1024,
            user_agent: "image-caption-api/1.0".to_string(),
        }
    }
}

// ── Process configuration ────────────────────────────────────────────────────

/// Startup configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Normalized lowercase level name.
    pub log_level: String,
    /// Set when `LOG_LEVEL` held something unrecognized.
    pub rejected_log_level: Option<String>,
    pub fetch: FetchConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_raw = lookup("BIND_ADDR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::BindAddr {
                value: bind_raw.clone(),
                source,
            })?;

        let (log_level, rejected_log_level) = match lookup("LOG_LEVEL") {
            None => (DEFAULT_LOG_LEVEL.to_string(), None),
            Some(raw) => match normalize_level(&raw) {
                Some(level) => (level, None),
                None => (DEFAULT_LOG_LEVEL.to_string(), Some(raw)),
            },
        };

        Ok(Self {
            bind_addr,
            log_level,
            rejected_log_level,
            fetch: FetchConfig::default(),
        })
    }
}

fn normalize_level(raw: &str) -> Option<String> {
    let level = raw.trim().to_lowercase();
    let level = if level == "warning" { "warn".to_string() } else { level };
    LOG_LEVELS.contains(&level.as_str()).then_some(level)
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Connection settings for one named service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProfile {
    /// Host the service listens on
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the service listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Max connect attempts before the service is given up on
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay between connect attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-service connect timeout override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Per-service health check interval override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,

    /// Per-service idle timeout override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    3000
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: None,
            health_check_interval_ms: None,
            idle_timeout_ms: None,
        }
    }
}

/// Connection manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Timeout for a single dial in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a caller waits on an in-flight connect
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Interval between health probes per connection
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Timeout for a single health probe
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,

    /// Idle time after which a connection is evicted
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Interval of the idle eviction sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Upper bound on the exponential reconnect backoff
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_wait_timeout_ms() -> u64 {
    15_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_probe_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_backoff_ceiling_ms() -> u64 {
    30_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_probe_timeout_ms: default_health_probe_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named service profiles; names absent here resolve from the environment
    #[serde(default)]
    pub services: HashMap<String, ServiceProfile>,

    /// Connection manager settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Service targeted when callers don't name one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_service: Option<String>,
}

/// Fully resolved settings for one service name.
///
/// Resolution is deterministic per name and never mutated afterwards:
/// explicit profile, then `{NAME}_HOST`-style environment variables, then
/// built-in defaults.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_connect_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub idle_timeout: Duration,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            manager: ManagerConfig::default(),
            default_service: None,
        }
    }

    /// Name used when a caller doesn't target a specific service
    pub fn default_service_name(&self) -> String {
        if let Some(name) = &self.default_service {
            return name.clone();
        }
        std::env::var("DEFAULT_SERVICE").unwrap_or_else(|_| "default-service".to_string())
    }

    /// Resolve the connection settings for a service name
    pub fn service(&self, name: &str) -> ServiceConfig {
        let profile = self
            .services
            .get(name)
            .cloned()
            .unwrap_or_else(|| profile_from_env(name));

        ServiceConfig {
            name: name.to_string(),
            host: profile.host,
            port: profile.port,
            max_connect_attempts: profile.retry_attempts,
            retry_delay: Duration::from_millis(profile.retry_delay_ms),
            connect_timeout: Duration::from_millis(
                profile
                    .connect_timeout_ms
                    .unwrap_or(self.manager.connect_timeout_ms),
            ),
            health_check_interval: Duration::from_millis(
                profile
                    .health_check_interval_ms
                    .unwrap_or(self.manager.health_check_interval_ms),
            ),
            idle_timeout: Duration::from_millis(
                profile.idle_timeout_ms.unwrap_or(self.manager.idle_timeout_ms),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a profile from `{NAME}_HOST` / `{NAME}_PORT` / `{NAME}_RETRY_ATTEMPTS`
/// / `{NAME}_RETRY_DELAY` environment variables, hyphens mapped to underscores.
fn profile_from_env(name: &str) -> ServiceProfile {
    let prefix = name.to_uppercase().replace('-', "_");
    let mut profile = ServiceProfile::default();

    if let Ok(host) = std::env::var(format!("{}_HOST", prefix)) {
        profile.host = host;
    }
    if let Ok(port) = std::env::var(format!("{}_PORT", prefix)) {
        if let Ok(value) = port.parse() {
            profile.port = value;
        }
    }
    if let Ok(attempts) = std::env::var(format!("{}_RETRY_ATTEMPTS", prefix)) {
        if let Ok(value) = attempts.parse() {
            profile.retry_attempts = value;
        }
    }
    if let Ok(delay) = std::env::var(format!("{}_RETRY_DELAY", prefix)) {
        if let Ok(value) = delay.parse() {
            profile.retry_delay_ms = value;
        }
    }

    profile
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Supported variables:
/// - SERVICES (comma-separated list of service names to pre-register)
/// - DEFAULT_SERVICE (name used when callers don't target a service)
/// - {NAME}_HOST / {NAME}_PORT / {NAME}_RETRY_ATTEMPTS / {NAME}_RETRY_DELAY
///   per service, hyphens in the name mapped to underscores
///
/// Names not listed in SERVICES still resolve lazily on first use.
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(names) = std::env::var("SERVICES") {
        for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            config.services.insert(name.to_string(), profile_from_env(name));
        }
    }

    if let Ok(default) = std::env::var("DEFAULT_SERVICE") {
        config.default_service = Some(default);
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables. An explicit default service overrides whatever the
/// source declared; it doesn't need a pre-registered profile since names
/// resolve from the environment on first use.
pub fn load_config(config_path: Option<&str>, default_service: Option<&str>) -> Result<Config> {
    let mut config = if let Some(path) = config_path {
        load_from_yaml(path)?
    } else {
        load_from_env()?
    };

    if let Some(name) = default_service {
        config.default_service = Some(name.to_string());
    }

    Ok(config)
}

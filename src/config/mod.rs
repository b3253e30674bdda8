use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::entrypoint::{LifecycleConfig, TransportConfig};
use crate::lb::{SameSite, StickyCookie};

pub mod overview;

pub use overview::{
    AccessLogConfig, Features, MetricsConfig, ProvidersConfig, TracingConfig,
};

/// A single upstream server inside a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable backend name; sticky cookies hash this.
    pub name: String,

    /// Origin URL (e.g. "http://10.0.0.7:8080")
    pub url: String,

    /// Relative weight; non-positive entries are dropped by the balancer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,

    /// Keep serving sticky sessions but take no new traffic.
    #[serde(default)]
    pub fenced: bool,
}

/// Sticky session settings for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickyConfig {
    pub cookie: StickyCookieConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickyCookieConfig {
    #[serde(default = "default_cookie_name")]
    pub name: String,

    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub http_only: bool,

    /// "none", "lax", "strict"; anything else leaves the attribute unset.
    #[serde(default)]
    pub same_site: String,

    /// Seconds; 0 omits Max-Age.
    #[serde(default)]
    pub max_age: i32,

    /// Defaults to "/" when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default)]
    pub domain: String,
}

fn default_cookie_name() -> String {
    "relaygate_sticky".to_string()
}

impl StickyCookieConfig {
    pub fn to_sticky_cookie(&self) -> StickyCookie {
        StickyCookie {
            name: self.name.clone(),
            secure: self.secure,
            http_only: self.http_only,
            same_site: SameSite::from_config(&self.same_site),
            max_age: self.max_age,
            path: self.path.clone().unwrap_or_else(|| "/".to_string()),
            domain: self.domain.clone(),
        }
    }
}

/// A named set of load-balanced backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub backends: Vec<BackendConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky: Option<StickyConfig>,

    /// Whether health checking drives this service's status updaters.
    #[serde(default)]
    pub health_check: bool,

    /// Forward the client's Host header instead of the target's.
    #[serde(default = "default_pass_host_header")]
    pub pass_host_header: bool,
}

fn default_pass_host_header() -> bool {
    true
}

/// Transport limits for one entrypoint, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// 0 = unlimited requests per keep-alive connection.
    #[serde(default)]
    pub keep_alive_max_requests: u32,

    /// 0 = no wall-clock budget per connection.
    #[serde(default)]
    pub keep_alive_max_time_ms: u64,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_write_timeout_ms() -> u64 {
    60_000
}

fn default_idle_timeout_ms() -> u64 {
    180_000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            keep_alive_max_requests: 0,
            keep_alive_max_time_ms: 0,
            lifecycle: LifecycleSettings::default(),
        }
    }
}

impl TransportSettings {
    pub fn to_transport(&self) -> TransportConfig {
        TransportConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            keep_alive_max_requests: self.keep_alive_max_requests,
            keep_alive_max_time: Duration::from_millis(self.keep_alive_max_time_ms),
            lifecycle: self.lifecycle.to_lifecycle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default)]
    pub request_accept_grace_timeout_ms: u64,

    #[serde(default = "default_grace_timeout_ms")]
    pub grace_timeout_ms: u64,
}

fn default_grace_timeout_ms() -> u64 {
    10_000
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            request_accept_grace_timeout_ms: 0,
            grace_timeout_ms: default_grace_timeout_ms(),
        }
    }
}

impl LifecycleSettings {
    pub fn to_lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            request_accept_grace_timeout: Duration::from_millis(self.request_accept_grace_timeout_ms),
            grace_timeout: Duration::from_millis(self.grace_timeout_ms),
        }
    }
}

/// One listening address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrypointConfig {
    /// host:port; ":0" picks an ephemeral port.
    #[serde(default = "default_entrypoint_address")]
    pub address: String,

    #[serde(default)]
    pub transport: TransportSettings,
}

fn default_entrypoint_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for EntrypointConfig {
    fn default() -> Self {
        Self {
            address: default_entrypoint_address(),
            transport: TransportSettings::default(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub entrypoints: HashMap<String, EntrypointConfig>,

    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,

    /// Which service the HTTP pipeline routes to; defaults to the only
    /// service when exactly one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_service: Option<String>,

    /// Configuration provider sub-configs (consumed by the overview API).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<ProvidersConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_log: Option<AccessLogConfig>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the service the HTTP pipeline should use.
    pub fn default_service(&self) -> Option<(&String, &ServiceConfig)> {
        if let Some(name) = &self.default_service {
            return self.services.get_key_value(name);
        }
        if self.services.len() == 1 {
            return self.services.iter().next();
        }
        None
    }
}

/// Load configuration from a YAML file.
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables.
///
/// - `RELAYGATE_LISTEN` (optional, defaults to 0.0.0.0:8080)
/// - `RELAYGATE_BACKENDS` (comma-separated origin URLs, required)
/// - `RELAYGATE_STICKY_COOKIE` (optional cookie name enabling stickiness)
pub fn load_from_env() -> Result<Config> {
    // A .env file is honored when present.
    let _ = dotenvy::dotenv();

    let backends_raw = std::env::var("RELAYGATE_BACKENDS")
        .context("RELAYGATE_BACKENDS environment variable not set")?;

    let backends: Vec<BackendConfig> = backends_raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, url)| BackendConfig {
            name: format!("backend{}", i + 1),
            url: url.to_string(),
            weight: None,
            fenced: false,
        })
        .collect();

    if backends.is_empty() {
        anyhow::bail!("RELAYGATE_BACKENDS contains no valid origins");
    }

    let sticky = std::env::var("RELAYGATE_STICKY_COOKIE")
        .ok()
        .map(|name| StickyConfig {
            cookie: StickyCookieConfig {
                name,
                secure: false,
                http_only: false,
                same_site: String::new(),
                max_age: 0,
                path: None,
                domain: String::new(),
            },
        });

    let mut config = Config::new();
    config.services.insert(
        "default".to_string(),
        ServiceConfig {
            backends,
            sticky,
            health_check: false,
            pass_host_header: true,
        },
    );
    config.default_service = Some("default".to_string());

    let mut entrypoint = EntrypointConfig::default();
    if let Ok(listen) = std::env::var("RELAYGATE_LISTEN") {
        entrypoint.address = listen;
    }
    config.entrypoints.insert("web".to_string(), entrypoint);

    Ok(config)
}

/// Load configuration from file or environment.
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}

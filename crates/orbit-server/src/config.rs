//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - A TOML file: `$ORBIT_CONFIG`, else the first of `orbit.toml`,
//!   `/etc/orbit/orbit.toml`, `~/.config/orbit/orbit.toml` that exists
//! - Environment variables (`ORBIT_PORT`, `ORBIT_BROKER__BROKERS=a,b`, ...)

use anyhow::{bail, Context, Result};
use orbit_core::{ServiceConfig, StartOffset, StoreProbe, StreamSettings};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Connection-string scheme served by the in-process transports.
pub const MEMORY_SCHEME: &str = "memory://";

const CONFIG_PATHS: [&str; 3] = [
    "orbit.toml",
    "/etc/orbit/orbit.toml",
    "~/.config/orbit/orbit.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub document_store: DocumentStoreConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Event broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Broker addresses. `memory://` selects the in-process broker.
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Consumer group shared by every stream route.
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

/// Document store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentStoreConfig {
    /// Required. `memory://` selects the in-process store.
    #[serde(default)]
    pub connection_string: Option<String>,

    #[serde(default = "default_database")]
    pub database: String,

    /// Collection whose first document is logged after connecting.
    #[serde(default)]
    pub probe_collection: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Idle-time monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Check interval, also the idle threshold.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
}

/// Stream route settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Outputs held per route while its producer is not ready.
    #[serde(default = "default_pending_output_capacity")]
    pub pending_output_capacity: usize,

    /// Time allowed for in-flight messages when a route is unbound.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_client_id() -> String {
    "openTele".to_string()
}

fn default_brokers() -> Vec<String> {
    vec!["memory://local".to_string()]
}

fn default_group_id() -> String {
    "grpOpenTele".to_string()
}

fn default_database() -> String {
    "orbit".to_string()
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_idle_interval() -> u64 {
    60_000 // 1 minute
}

fn default_pending_output_capacity() -> usize {
    1024
}

fn default_drain_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broker: BrokerConfig::default(),
            document_store: DocumentStoreConfig::default(),
            activity: ActivityConfig::default(),
            stream: StreamConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            brokers: default_brokers(),
            group_id: default_group_id(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_interval_ms: default_idle_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pending_output_capacity: default_pending_output_capacity(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// The config file to layer under the environment, if any.
fn config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ORBIT_CONFIG") {
        return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
    }
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

impl Config {
    /// Load configuration from the config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_file() {
            builder = builder.add_source(config::File::from(path.as_path()).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("ORBIT")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.brokers")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML.
    #[cfg(test)]
    fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Check required values.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self.document_store.connection_string.as_deref() {
            None => bail!("document_store.connection_string is required"),
            Some(s) if s.trim().is_empty() => bail!("document_store.connection_string is empty"),
            Some(_) => {}
        }
        if self.broker.brokers.is_empty() {
            bail!("broker.brokers must list at least one broker");
        }
        if self.broker.client_id.trim().is_empty() {
            bail!("broker.client_id is empty");
        }
        if self.broker.group_id.trim().is_empty() {
            bail!("broker.group_id is empty");
        }
        if self.activity.enabled && self.activity.idle_interval_ms == 0 {
            bail!("activity.idle_interval_ms must be positive");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid host: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Settings handed to the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn service_config(&self) -> Result<ServiceConfig> {
        Ok(ServiceConfig {
            listen_addr: self.bind_addr()?,
            stream: StreamSettings {
                group_id: self.broker.group_id.clone(),
                start: StartOffset::Earliest,
                pending_output_capacity: self.stream.pending_output_capacity,
                drain_timeout: Duration::from_millis(self.stream.drain_timeout_ms),
            },
            idle_interval: self
                .activity
                .enabled
                .then(|| Duration::from_millis(self.activity.idle_interval_ms)),
            store_connect_timeout: Duration::from_millis(self.document_store.connect_timeout_ms),
            probe: self
                .document_store
                .probe_collection
                .as_ref()
                .map(|collection| StoreProbe {
                    database: self.document_store.database.clone(),
                    collection: collection.clone(),
                }),
        })
    }
}

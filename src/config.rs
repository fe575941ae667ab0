//! WolfCollective Configuration
//!
//! Configuration structures for a collective member, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main collective member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// TLS material presented to other members
    pub tls: TlsConfig,

    /// Protocol timing and fan-out
    #[serde(default)]
    pub collective: ProtocolConfig,

    /// Admin API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Member name (falls back to the name file, then the short hostname)
    #[serde(default)]
    pub name: Option<String>,

    /// File caching this member's name
    #[serde(default = "default_name_file")]
    pub name_file: PathBuf,

    /// Data directory for the configuration store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address to bind the collective listener on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Collective port, shared by every member
    #[serde(default = "default_port")]
    pub port: u16,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate of this member
    pub certificate: PathBuf,

    /// PEM private key of this member
    pub private_key: PathBuf,
}

/// Protocol timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Outbound connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle timeout while waiting for request records
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Idle timeout once a follower stream is established
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,

    /// Keepalive interval on an idle leader relay
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Maximum concurrent outbound dials during startup and reassimilation
    #[serde(default = "default_max_concurrent_dials")]
    pub max_concurrent_dials: usize,

    /// Delay between scans for missing members while leading
    #[serde(default = "default_reassimilate_interval_secs")]
    pub reassimilate_interval_secs: u64,

    /// Debounce window for manager rebalancing
    #[serde(default = "default_rebalance_delay_secs")]
    pub rebalance_delay_secs: u64,

    /// Maximum leader redirects followed by one connection attempt
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Base delay before a startup retry in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Random jitter added to every retry in milliseconds
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// How long the cached member name is trusted
    #[serde(default = "default_name_cache_secs")]
    pub name_cache_secs: u64,
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the admin API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin API bind address (keep it on loopback)
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_name_file() -> PathBuf {
    PathBuf::from("/etc/wolfcollective/myname")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfcollective")
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    13001
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_stream_idle_timeout_secs() -> u64 {
    90
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_dials() -> usize {
    64
}

fn default_reassimilate_interval_secs() -> u64 {
    30
}

fn default_rebalance_delay_secs() -> u64 {
    10
}

fn default_max_redirects() -> usize {
    8
}

fn default_retry_base_delay_ms() -> u64 {
    5000
}

fn default_retry_jitter_ms() -> u64 {
    1000
}

fn default_name_cache_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:13002".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            name_file: default_name_file(),
            data_dir: default_data_dir(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            max_concurrent_dials: default_max_concurrent_dials(),
            reassimilate_interval_secs: default_reassimilate_interval_secs(),
            rebalance_delay_secs: default_rebalance_delay_secs(),
            max_redirects: default_max_redirects(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            name_cache_secs: default_name_cache_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl ProtocolConfig {
    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout for request records
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Idle timeout on an established follower stream
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// Keepalive interval on an idle relay
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Delay between missing-member scans
    pub fn reassimilate_interval(&self) -> Duration {
        Duration::from_secs(self.reassimilate_interval_secs)
    }

    /// Rebalance debounce window
    pub fn rebalance_delay(&self) -> Duration {
        Duration::from_secs(self.rebalance_delay_secs)
    }

    /// Base delay before a startup retry
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Name cache lifetime
    pub fn name_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.name_cache_secs)
    }
}

impl CollectiveConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CollectiveConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.port == 0 {
            return Err(crate::Error::Config("node.port cannot be 0".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.tls.certificate.as_os_str().is_empty() || self.tls.private_key.as_os_str().is_empty() {
            return Err(crate::Error::Config("tls.certificate and tls.private_key are required".into()));
        }

        if self.collective.max_concurrent_dials == 0 {
            return Err(crate::Error::Config("collective.max_concurrent_dials must be at least 1".into()));
        }

        if let Some(name) = &self.node.name {
            if name.trim().is_empty() {
                return Err(crate::Error::Config("node.name cannot be blank".into()));
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the persisted configuration store
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("collective.json")
    }

    /// Listener address for the collective port
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.node.bind_address, self.node.port)
    }

    /// Render a starter configuration file
    pub fn template(name: &str) -> String {
        format!(
            r#"# WolfCollective member configuration

[node]
name = "{name}"
name_file = "/etc/wolfcollective/myname"
data_dir = "/var/lib/wolfcollective"
bind_address = "0.0.0.0"
port = 13001

[tls]
certificate = "/etc/wolfcollective/srvcert.pem"
private_key = "/etc/wolfcollective/privkey.pem"

[collective]
# connect_timeout_ms = 2000
# request_timeout_secs = 5
# stream_idle_timeout_secs = 90
# max_concurrent_dials = 64
# reassimilate_interval_secs = 30
# rebalance_delay_secs = 10
# max_redirects = 8

[api]
enabled = true
bind_address = "127.0.0.1:13002"

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

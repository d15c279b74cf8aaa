//! Configuration file support for ripmond
//!
//! Loads and validates ripmond configuration from TOML files.
//! Default location: /etc/sonic/ripmond.toml
//!
//! ```toml
//! [receiver]
//! port = 520
//! interface = "0.0.0.0"
//!
//! [timers]
//! route_timeout_secs = 180
//!
//! [[display]]
//! prefix = "192.168.0.0/16"
//! label = "campus"
//! ```

use crate::error::{Result, RipmonError};
use crate::metrics_server::DEFAULT_METRICS_PORT;
use crate::query::DisplayQuery;
use crate::rip::{ENTRY_LEN, HEADER_LEN, RIP_GROUP, RIP_PORT};
use crate::trie::MAX_CLASSIFY_BITS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/ripmond.toml";

/// Multicast receiver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Multicast group to join
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,

    /// UDP port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local interface address used for the group membership
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Socket receive buffer size in bytes
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Largest datagram accepted; longer datagrams are truncated by the kernel
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

/// Timer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimersConfig {
    /// Seconds between purge passes
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Seconds after which an unrefreshed route expires
    #[serde(default = "default_route_timeout")]
    pub route_timeout_secs: u64,

    /// Seconds a metric change is reported as recent
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: u64,

    /// Milliseconds between population polls of the display watcher
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Complete ripmond configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RipmonConfig {
    #[serde(default)]
    pub receiver: ReceiverConfig,

    #[serde(default)]
    pub timers: TimersConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Regions to watch and summarize
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub display: Vec<DisplayQuery>,
}

// Default functions
fn default_group() -> Ipv4Addr {
    RIP_GROUP
}

fn default_port() -> u16 {
    RIP_PORT
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_recv_buffer_size() -> usize {
    256 * 1024
}

fn default_max_datagram_size() -> usize {
    1500
}

fn default_purge_interval() -> u64 {
    10
}

fn default_route_timeout() -> u64 {
    180
}

fn default_staleness_window() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    100
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

// Default implementations
impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            interface: default_interface(),
            recv_buffer_size: default_recv_buffer_size(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: default_purge_interval(),
            route_timeout_secs: default_route_timeout(),
            staleness_window_secs: default_staleness_window(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl RipmonConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    RipmonError::Config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RipmonError::Io(e)),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RipmonError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.timers.purge_interval_secs)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.timers.route_timeout_secs)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.timers.staleness_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timers.poll_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.receiver.port == 0 {
            return Err(RipmonError::Config("receiver port must be > 0".to_string()));
        }

        if !self.receiver.group.is_multicast() {
            return Err(RipmonError::Config(format!(
                "receiver group {} is not a multicast address",
                self.receiver.group
            )));
        }

        if self.receiver.max_datagram_size < HEADER_LEN + ENTRY_LEN {
            return Err(RipmonError::Config(format!(
                "max_datagram_size must be at least {}",
                HEADER_LEN + ENTRY_LEN
            )));
        }

        if self.timers.purge_interval_secs == 0 {
            return Err(RipmonError::Config(
                "purge_interval_secs must be > 0".to_string(),
            ));
        }

        if self.timers.route_timeout_secs == 0 {
            return Err(RipmonError::Config(
                "route_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.timers.poll_interval_ms == 0 {
            return Err(RipmonError::Config(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(RipmonError::Config("metrics port must be > 0".to_string()));
        }

        for query in &self.display {
            if query.prefix.host_bits() > MAX_CLASSIFY_BITS {
                return Err(RipmonError::Config(format!(
                    "display {} ({}) is wider than /{}",
                    query.prefix,
                    query.label,
                    32 - MAX_CLASSIFY_BITS
                )));
            }
        }

        Ok(())
    }
}

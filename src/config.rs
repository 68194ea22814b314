//! Node configuration, loaded from a TOML file.
//!
//! ```toml
//! [link]
//! mcast_interface = "eth0"
//! mcast_port = 5000
//! buffer_size = 1500
//!
//! [network]
//! locators = "0:0:0:a,0:0:0:b-0:0:0:c"
//! hop_limit = 32
//! move_interval = 10.0
//!
//! [discovery]
//! hostname = "node-a"
//! wait_time = 2.5
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::{
    identifier::{IdentifierParseError, Nid},
    mobility::LocatorCycle,
};

/// Default UDP port of the multicast link.
pub const DEFAULT_MCAST_PORT: u16 = 5000;
/// Default size of the link receive buffer, and thus the largest message which can be sent.
pub const DEFAULT_BUFFER_SIZE: usize = 1500;
/// Default hop limit of locally originated packets.
pub const DEFAULT_HOP_LIMIT: u8 = 32;

/// Errors while loading a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid identifier: {0}")]
    Identifier(#[from] IdentifierParseError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration of a node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Heartbeat application run by the daemon, if any.
    pub application: Option<ApplicationConfig>,
}

/// Configuration of the multicast link.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub mcast_interface: String,
    pub mcast_port: u16,
    pub buffer_size: usize,
}

/// How the transport layer frames its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHeaderMode {
    /// Source and destination port, so the receiver can reply.
    #[default]
    Bidirectional,
    /// Only the destination port.
    Connectionless,
}

/// Configuration of the network layer and the move task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// The locator sets this node cycles through. A single set means the node never moves.
    pub locators: LocatorCycle,
    /// Identifier of this node, random if not set.
    pub nid: Option<Nid>,
    pub hop_limit: u8,
    /// How long a learned forwarding entry stays valid.
    #[serde(deserialize_with = "seconds")]
    pub backwards_learning_ttl: Duration,
    /// How long a peer counts as active after the last packet to or from it.
    #[serde(deserialize_with = "seconds")]
    pub active_session_ttl: Duration,
    /// Time between two moves.
    #[serde(deserialize_with = "seconds")]
    pub move_interval: Duration,
    /// How long old and new locators are both joined during a move.
    #[serde(deserialize_with = "seconds")]
    pub handover_time: Duration,
    /// How long to wait for locator update acknowledgements before resending.
    #[serde(deserialize_with = "seconds")]
    pub locator_update_timeout: Duration,
    pub locator_update_retries: u32,
    pub transport_header: TransportHeaderMode,
}

/// Configuration of the discovery protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub hostname: String,
    /// Interval of periodic solicitations. Mappings expire after 3 times this value.
    #[serde(deserialize_with = "seconds")]
    pub wait_time: Duration,
}

/// Configuration of the heartbeat application.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    pub port: u16,
    pub remote_hostname: String,
    pub remote_port: u16,
    #[serde(deserialize_with = "seconds", default = "default_interval")]
    pub interval: Duration,
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    /// Check values which are valid TOML but make no sense for a node.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.mcast_interface.is_empty() {
            return Err(ConfigError::Invalid("link.mcast_interface is empty".into()));
        }
        if self.network.locators.is_empty() {
            return Err(ConfigError::Invalid("network.locators is empty".into()));
        }
        if self.network.hop_limit == 0 {
            return Err(ConfigError::Invalid("network.hop_limit must be positive".into()));
        }
        if self.network.locators.is_moving()
            && self.network.handover_time >= self.network.move_interval
        {
            return Err(ConfigError::Invalid(
                "network.handover_time must be shorter than network.move_interval".into(),
            ));
        }
        if self.discovery.wait_time.is_zero() {
            return Err(ConfigError::Invalid("discovery.wait_time must be positive".into()));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mcast_interface: "eth0".into(),
            mcast_port: DEFAULT_MCAST_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            locators: LocatorCycle::default(),
            nid: None,
            hop_limit: DEFAULT_HOP_LIMIT,
            backwards_learning_ttl: Duration::from_secs(30),
            active_session_ttl: Duration::from_secs(30),
            move_interval: Duration::from_secs(60),
            handover_time: Duration::from_secs(5),
            locator_update_timeout: Duration::from_millis(500),
            locator_update_retries: 3,
            transport_header: TransportHeaderMode::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            wait_time: Duration::from_secs(5),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

/// Deserialize a duration from a (possibly fractional) amount of seconds.
fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

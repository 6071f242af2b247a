use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Defaults to `<node_id>_publisher`
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    /// Connect over TLS, verifying the broker against the system roots
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle to verify the broker with instead of the system roots
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

/// Home Assistant discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Identifies this bridge; used for the proxy status entity
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Root of the per-device state and availability topics
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_node_id() -> String {
    "ble_proxy".to_string()
}

fn default_state_prefix() -> String {
    "sgs01".to_string()
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        HomeAssistantConfig {
            discovery_prefix: default_discovery_prefix(),
            node_id: default_node_id(),
            state_prefix: default_state_prefix(),
        }
    }
}

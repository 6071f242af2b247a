pub mod device_config;
pub mod mqtt_config;
pub mod polling_config;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

pub use device_config::DeviceConfig;
pub use mqtt_config::{HomeAssistantConfig, MqttConfig};
pub use polling_config::PollingConfig;

use crate::utils::is_mac_address;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Everything the bridge needs, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub homeassistant: HomeAssistantConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    pub sensors: Vec<DeviceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Loads and validates the config from a YAML file.
    pub async fn load_config(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let yaml = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_yaml(&yaml)?;

        info!("Loaded config from {:?}", path);
        info!("Found {} sensor(s)", config.sensors.len());
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        for sensor in &mut config.sensors {
            sensor.normalize();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.mqtt.host.trim().is_empty() {
            return invalid("mqtt.host must not be empty".into());
        }
        if self.mqtt.username.is_some() && self.mqtt.password.is_none() {
            return invalid("mqtt.username is set but mqtt.password is missing".into());
        }
        if self.mqtt.ca_cert.is_some() && !self.mqtt.tls {
            return invalid("mqtt.ca_cert is set but mqtt.tls is off".into());
        }
        if self.sensors.is_empty() {
            return invalid("no sensors configured".into());
        }

        let polling = &self.polling;
        if polling.interval_seconds == 0 || polling.poll_timeout_seconds == 0 {
            return invalid("polling intervals must be greater than zero".into());
        }
        if polling.response_timeout_seconds == 0 {
            return invalid("polling.response_timeout_seconds must be greater than zero".into());
        }
        if polling.max_concurrent == 0 {
            return invalid("polling.max_concurrent must be at least 1".into());
        }
        if polling.retry_attempts == 0 {
            return invalid("polling.retry_attempts must be at least 1".into());
        }
        if polling.mtu < 2 {
            return invalid("polling.mtu must be at least 2".into());
        }

        let mut seen = HashSet::new();
        for (i, sensor) in self.sensors.iter().enumerate() {
            let label: &str = if sensor.name.is_empty() { "unnamed" } else { &sensor.name };
            if !is_mac_address(&sensor.address) {
                return invalid(format!(
                    "sensor {} ('{}') has malformed mac_address '{}'",
                    i, label, sensor.address
                ));
            }
            if sensor.device_id.trim().is_empty() {
                return invalid(format!("sensor {} ('{}') is missing device_id", i, label));
            }
            if sensor.local_key.is_empty() {
                return invalid(format!("sensor {} ('{}') is missing local_key", i, label));
            }
            if !seen.insert(sensor.unique_id.as_str()) {
                return invalid(format!("duplicate unique_id '{}'", sensor.unique_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
mqtt:
  host: broker.local
sensors:
  - name: Fern
    mac_address: a4:c1:38:0a:0b:0c
    device_id: bf0123
    local_key: "0123456789abcdef"
    unique_id: sgs01_a
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = BridgeConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.tls);
        assert_eq!(config.mqtt.ca_cert, None);
        assert_eq!(config.homeassistant.discovery_prefix, "homeassistant");
        assert_eq!(config.homeassistant.state_prefix, "sgs01");
        assert_eq!(config.polling.interval_seconds, 900);
        assert_eq!(config.polling.max_concurrent, 1);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sensors[0].address, "A4:C1:38:0A:0B:0C");
        assert_eq!(config.sensors[0].unique_id, "sgs01_a");
    }

    #[test]
    fn missing_sensors_section_is_a_parse_error() {
        let result = BridgeConfig::from_yaml("mqtt:\n  host: broker.local\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_local_key_is_a_parse_error() {
        let yaml = r#"
mqtt:
  host: broker.local
sensors:
  - name: Fern
    mac_address: a4:c1:38:0a:0b:0c
    device_id: bf0123
"#;
        assert!(matches!(BridgeConfig::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn malformed_address_is_rejected() {
        let yaml = MINIMAL.replace("a4:c1:38:0a:0b:0c", "a4:c1:38");
        assert!(matches!(BridgeConfig::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn username_without_password_is_rejected() {
        let yaml = MINIMAL.replace("host: broker.local", "host: broker.local\n  username: ha");
        assert!(matches!(BridgeConfig::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn tls_settings_are_parsed() {
        let yaml = MINIMAL.replace(
            "host: broker.local",
            "host: broker.local\n  port: 8883\n  tls: true\n  ca_cert: /etc/ssl/broker.pem",
        );
        let config = BridgeConfig::from_yaml(&yaml).unwrap();
        assert!(config.mqtt.tls);
        assert_eq!(config.mqtt.ca_cert, Some(PathBuf::from("/etc/ssl/broker.pem")));
    }

    #[test]
    fn ca_cert_without_tls_is_rejected() {
        let yaml = MINIMAL.replace(
            "host: broker.local",
            "host: broker.local\n  ca_cert: /etc/ssl/broker.pem",
        );
        assert!(matches!(BridgeConfig::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_unique_ids_are_rejected() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"  - name: Basil
    mac_address: a4:c1:38:0a:0b:0d
    device_id: bf0124
    local_key: "fedcba9876543210"
    unique_id: sgs01_a
"#
        );
        assert!(matches!(BridgeConfig::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let yaml = format!("{}polling:\n  max_concurrent: 0\n", MINIMAL);
        assert!(matches!(BridgeConfig::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let result = BridgeConfig::load_config(Path::new("/nonexistent/config.yaml")).await;
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}

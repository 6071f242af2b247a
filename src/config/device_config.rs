use serde::{Deserialize, Serialize};

use crate::core::protocol::SessionKey;
use crate::utils::normalize_address;

/// Identity and credentials of one physical sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,
    /// BLE MAC address
    #[serde(rename = "mac_address")]
    pub address: String,
    /// Tuya device id
    pub device_id: String,
    /// Local key extracted from the Tuya cloud
    pub local_key: String,
    /// Used to build MQTT topics. Derived from the address when omitted.
    #[serde(default)]
    pub unique_id: String,
    /// Device uuid sent during pairing; falls back to `device_id`.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
}

impl DeviceConfig {
    pub fn new(
        name: &str,
        address: &str,
        device_id: &str,
        local_key: &str,
        unique_id: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            device_id: device_id.to_string(),
            local_key: local_key.to_string(),
            unique_id: unique_id.to_string(),
            uuid: None,
            product_id: None,
        }
    }

    pub fn local_key(&self) -> SessionKey {
        SessionKey::from_local_key(&self.local_key)
    }

    pub fn pairing_uuid(&self) -> &str {
        self.uuid.as_deref().unwrap_or(&self.device_id)
    }

    /// Fills derived fields; called once while loading.
    pub(crate) fn normalize(&mut self) {
        self.address = normalize_address(&self.address);
        if self.unique_id.trim().is_empty() {
            self.unique_id = format!("sgs01_{}", self.address.replace(':', "").to_lowercase());
        }
    }
}

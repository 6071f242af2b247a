//! Tuya BLE bridge library
//! Reads Tuya BLE sensors and publishes their values to Home Assistant over MQTT.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod publish;
pub mod utils;

//! Bluetooth functionality for the Tuya BLE bridge
//! This module defines the transport seam used by device sessions and its
//! bluest implementation: scanning, connecting and receiving notifications.

mod connection;
mod constants;
mod manager;
mod notification;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use connection::{BluestConnection, ConnectionManager};
pub use constants::*; // Re-export all constants
pub use manager::BluetoothManager;
pub use notification::NotificationHandler;
pub use scanner::BluetoothScanner;
pub use types::{
    BleConnection, BleTransport, ChunkStream, DiscoveredDevice, DiscoveryStream, ScanFilter,
};

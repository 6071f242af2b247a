//! Bluetooth manager for the Tuya BLE bridge
//! This module provides the bluest backed implementation of [`BleTransport`]

use std::time::Duration;

use async_trait::async_trait;
use bluest::Adapter;
use log::info;

use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::constants::DEVICE_LOOKUP_TIMEOUT_SECS;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{BleConnection, BleTransport, DiscoveryStream, ScanFilter};
use crate::core::error::TransportError;

/// Manages Bluetooth operations on the default adapter
pub struct BluetoothManager {
    /// Connection manager
    connection_manager: ConnectionManager,
    /// Bluetooth scanner
    scanner: BluetoothScanner,
    lookup_timeout: Duration,
}

impl BluetoothManager {
    /// Opens the default adapter and waits until it is powered.
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default().await.ok_or(TransportError::NoAdapter)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            connection_manager: ConnectionManager::new(adapter.clone()),
            scanner: BluetoothScanner::new(adapter),
            lookup_timeout: Duration::from_secs(DEVICE_LOOKUP_TIMEOUT_SECS),
        })
    }
}

#[async_trait]
impl BleTransport for BluetoothManager {
    async fn scan(&self, filter: &ScanFilter) -> Result<DiscoveryStream, TransportError> {
        Ok(self.scanner.start_scan(filter.clone()))
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn BleConnection>, TransportError> {
        info!("Connecting to {}...", address);
        let device = self.scanner.find_device(address, self.lookup_timeout).await?;
        let connection = self.connection_manager.connect(device).await?;
        Ok(Box::new(connection))
    }
}

//! Defines shared data structures and the transport seam for the Bluetooth module.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::core::bluetooth::constants::UUID_TUYA_SERVICE;
use crate::core::error::TransportError;

/// Inbound notification chunks of one connection.
pub type ChunkStream = BoxStream<'static, Vec<u8>>;

/// Advertisements seen while scanning.
pub type DiscoveryStream = BoxStream<'static, DiscoveredDevice>;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DiscoveredDevice {
    /// The address of the device (MAC address, upper case)
    pub address: String,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(address: String, name: Option<String>, rssi: Option<i16>) -> Self {
        Self { address, name, rssi }
    }
}

/// Which advertisements a scan reports
#[derive(Debug, Clone)]
pub struct ScanFilter {
    /// Only devices advertising this service
    pub service: Uuid,
    /// Drop advertisements weaker than this
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    /// Devices advertising the Tuya BLE service.
    pub fn tuya() -> Self {
        Self {
            service: UUID_TUYA_SERVICE,
            min_rssi: None,
        }
    }

    pub fn matches(&self, rssi: Option<i16>) -> bool {
        match (self.min_rssi, rssi) {
            (Some(min), Some(rssi)) => rssi >= min,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Platform Bluetooth capability handed to the poller.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Starts an advertisement scan. The stream ends when dropped.
    async fn scan(&self, filter: &ScanFilter) -> Result<DiscoveryStream, TransportError>;

    /// Opens a GATT connection to the device at `address`.
    async fn connect(&self, address: &str) -> Result<Box<dyn BleConnection>, TransportError>;
}

/// One open connection to a device.
#[async_trait]
pub trait BleConnection: Send {
    /// Writes one chunk to the device's write characteristic.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Subscribes to the notify characteristic.
    async fn notifications(&mut self) -> Result<ChunkStream, TransportError>;

    /// Releases the connection. Safe to call more than once.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

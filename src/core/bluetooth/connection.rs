//! Bluetooth connection handling for Tuya devices
//! This module handles connecting to and disconnecting from a device

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use log::{debug, info, warn};

use crate::core::bluetooth::constants::{
    UUID_TUYA_NOTIFY_CHAR, UUID_TUYA_SERVICE, UUID_TUYA_WRITE_CHAR,
};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::types::{BleConnection, ChunkStream};
use crate::core::error::TransportError;

/// Connection manager for Tuya devices
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Connects and resolves the Tuya write/notify characteristics
    pub async fn connect(&self, device: Device) -> Result<BluestConnection, TransportError> {
        let id = device.id().to_string();
        let address = id.clone();

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter
                .connect_device(&device)
                .await
                .map_err(|e| TransportError::ConnectionRefused {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
        }

        match Self::resolve_characteristics(&device).await {
            Ok((write_char, notify_char)) => Ok(BluestConnection {
                adapter: self.adapter.clone(),
                device,
                write_char,
                notify_char,
                notifications: NotificationHandler::new(),
                released: false,
            }),
            Err(e) => {
                // Do not leave a half set up link behind.
                if let Err(disconnect_err) = self.adapter.disconnect_device(&device).await {
                    warn!("Disconnect after failed setup of {} failed: {}", id, disconnect_err);
                }
                Err(e)
            }
        }
    }

    async fn resolve_characteristics(
        device: &Device,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        info!("Connection successful, discovering services...");
        let services = device.services().await?;
        let tuya_service = services
            .iter()
            .find(|s| s.uuid() == UUID_TUYA_SERVICE)
            .ok_or_else(|| {
                for service in &services {
                    debug!("Available service: {}", service.uuid());
                }
                TransportError::CharacteristicNotFound(format!("service {}", UUID_TUYA_SERVICE))
            })?
            .clone();

        let mut write_char_opt = None;
        let mut notify_char_opt = None;
        for characteristic in tuya_service.characteristics().await? {
            let uuid = characteristic.uuid();
            if uuid == UUID_TUYA_WRITE_CHAR {
                debug!("Found write characteristic: {}", uuid);
                write_char_opt = Some(characteristic);
            } else if uuid == UUID_TUYA_NOTIFY_CHAR {
                debug!("Found notification characteristic: {}", uuid);
                notify_char_opt = Some(characteristic);
            }
        }

        let missing = |uuid: uuid::Uuid| TransportError::CharacteristicNotFound(uuid.to_string());
        let write_char = write_char_opt.ok_or_else(|| missing(UUID_TUYA_WRITE_CHAR))?;
        let notify_char = notify_char_opt.ok_or_else(|| missing(UUID_TUYA_NOTIFY_CHAR))?;
        Ok((write_char, notify_char))
    }
}

/// An open bluest connection to one Tuya device
pub struct BluestConnection {
    adapter: Adapter,
    device: Device,
    write_char: Characteristic,
    notify_char: Characteristic,
    notifications: NotificationHandler,
    released: bool,
}

#[async_trait]
impl BleConnection for BluestConnection {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        debug!("Writing chunk: {:02x?}", chunk);
        self.write_char
            .write(chunk)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn notifications(&mut self) -> Result<ChunkStream, TransportError> {
        if self.released {
            return Err(TransportError::Disconnected);
        }
        self.notifications
            .setup_notifications(self.notify_char.clone())
            .await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.notifications.stop_notifications();

        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter.disconnect_device(&self.device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", self.device.id());
        }
        Ok(())
    }
}

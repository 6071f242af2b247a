use std::time::Duration;

use bluest::{Adapter, AdvertisingDevice, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{NOTIFICATION_BUFFER, UUID_TUYA_SERVICE};
use crate::core::bluetooth::types::{DiscoveredDevice, DiscoveryStream, ScanFilter};
use crate::core::error::TransportError;
use crate::utils::{extract_mac_address, normalize_address};

pub struct BluetoothScanner {
    adapter: Adapter,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Starts a scan task; dropping the returned stream stops it.
    pub fn start_scan(&self, filter: ScanFilter) -> DiscoveryStream {
        let cancel_token = CancellationToken::new();
        let cancel_token_for_task = cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);

        tokio::spawn(async move {
            if let Err(e) =
                Self::internal_scan_task(adapter_for_task, filter, tx, cancel_token_for_task).await
            {
                error!("Scan task finished with an error: {}", e);
            }
        });
        info!("Device scan task started.");

        let guard = cancel_token.drop_guard();
        Box::pin(futures_util::stream::unfold(
            (rx, guard),
            |(mut rx, guard)| async move { rx.recv().await.map(|device| (device, (rx, guard))) },
        ))
    }

    async fn internal_scan_task(
        adapter: Adapter,
        filter: ScanFilter,
        tx: mpsc::Sender<DiscoveredDevice>,
        cancel_token: CancellationToken,
    ) -> Result<(), TransportError> {
        info!("Starting bluetooth scan");
        let services = [filter.service];
        let mut scan_stream = adapter.scan(&services).await?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(found) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    debug!("Found device - Device: {:?}, RSSI: {:?}", found.device, found.rssi);
                    if !filter.matches(found.rssi) {
                        continue;
                    }
                    if tx.send(Self::describe(&found)).await.is_err() {
                        break;
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    /// Finds a device by MAC address: already connected devices first, then
    /// a bounded scan for the Tuya service.
    pub async fn find_device(
        &self,
        address: &str,
        lookup_timeout: Duration,
    ) -> Result<Device, TransportError> {
        let wanted = normalize_address(address);

        for device in self.adapter.connected_devices().await? {
            if Self::device_address(&device) == wanted {
                debug!("{} is already connected", wanted);
                return Ok(device);
            }
        }

        let lookup = async {
            let mut scan_stream = self.adapter.scan(&[UUID_TUYA_SERVICE]).await?;
            while let Some(found) = scan_stream.next().await {
                if Self::device_address(&found.device) == wanted {
                    return Ok(found.device);
                }
            }
            Err::<Device, TransportError>(TransportError::DeviceNotFound(wanted.clone()))
        };

        match tokio::time::timeout(lookup_timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::DeviceNotFound(wanted.clone())),
        }
    }

    fn describe(found: &AdvertisingDevice) -> DiscoveredDevice {
        let name = found
            .adv_data
            .local_name
            .clone()
            .or_else(|| found.device.name().ok());
        DiscoveredDevice::new(Self::device_address(&found.device), name, found.rssi)
    }

    fn device_address(device: &Device) -> String {
        let id = device.id().to_string();
        extract_mac_address(&id).unwrap_or(id)
    }
}

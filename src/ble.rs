use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{MowerError, Result},
    transport::{BleTransport, Endpoint, NotificationStream},
    types::{ConnectionParams, DeviceInfo},
    MOWER_NAME_PREFIXES, MOWER_SERVICE_UUID,
};

/// btleplug-backed wireless transport
pub struct BtleplugTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    params: ConnectionParams,
}

impl BtleplugTransport {
    /// Create a transport on the system Bluetooth stack
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new(params: ConnectionParams) -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            params,
        })
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(MowerError::DeviceNotFound)
    }

    /// Scan for mowers advertising the mower service
    ///
    /// Found peripherals are cached by address for [`BleTransport::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::DeviceNotFound`] if no Bluetooth adapter is available,
    /// or [`MowerError::Ble`] for other Bluetooth-related errors.
    pub async fn scan_for_devices(&self) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for mowers...");

        let central = self.adapter().await?;
        central
            .start_scan(ScanFilter {
                services: vec![MOWER_SERVICE_UUID],
            })
            .await?;

        tokio::time::sleep(Duration::from_millis(self.params.scan_timeout_ms)).await;

        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Some(device_info) = Self::mower_info(&peripheral).await else {
                continue;
            };

            info!("Found mower: {}", device_info);
            self.peripherals
                .lock()
                .await
                .insert(device_info.address.clone(), peripheral);
            devices.push(device_info);
        }

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        info!("Scan completed. Found {} mower(s)", devices.len());
        Ok(devices)
    }

    /// Device info for a peripheral, if it advertises as a mower
    async fn mower_info(peripheral: &Peripheral) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok()??;
        let name = properties.local_name?;

        if !MOWER_NAME_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            return None;
        }

        Some(DeviceInfo {
            name,
            address: properties.address.to_string(),
            rssi: properties.rssi.unwrap_or(0),
        })
    }

    async fn cached(&self, address: &str) -> Option<Peripheral> {
        self.peripherals.lock().await.get(address).cloned()
    }

    fn characteristic(peripheral: &Peripheral, endpoint: &Endpoint) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == endpoint.uuid && c.service_uuid == endpoint.service)
            .ok_or(MowerError::EndpointMissing(endpoint.uuid))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Handle = Peripheral;

    async fn connect(&self, device: &DeviceInfo) -> Result<Peripheral> {
        let peripheral = match self.cached(&device.address).await {
            Some(peripheral) => peripheral,
            None => {
                debug!("{} not cached, rescanning", device);
                self.scan_for_devices().await?;
                self.cached(&device.address)
                    .await
                    .ok_or(MowerError::DeviceNotFound)?
            }
        };

        peripheral
            .connect()
            .await
            .map_err(|e| MowerError::Transport(format!("Failed to connect: {e}")))?;

        Ok(peripheral)
    }

    async fn discover_endpoints(&self, peripheral: &Peripheral) -> Result<Vec<Endpoint>> {
        peripheral.discover_services().await?;

        Ok(peripheral
            .characteristics()
            .into_iter()
            .map(|c| Endpoint::new(c.uuid, c.service_uuid))
            .collect())
    }

    async fn write(&self, peripheral: &Peripheral, endpoint: &Endpoint, data: &[u8]) -> Result<()> {
        let characteristic = Self::characteristic(peripheral, endpoint)?;
        debug!("Writing frame: {:02X?}", data);

        peripheral
            .write(&characteristic, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| MowerError::Transport(format!("Failed to write frame: {e}")))
    }

    async fn subscribe(
        &self,
        peripheral: &Peripheral,
        endpoint: &Endpoint,
    ) -> Result<NotificationStream> {
        let characteristic = Self::characteristic(peripheral, endpoint)?;
        peripheral.subscribe(&characteristic).await?;

        let uuid = endpoint.uuid;
        let stream = peripheral
            .notifications()
            .await?
            .filter_map(move |notification| async move {
                (notification.uuid == uuid).then(|| Bytes::from(notification.value))
            });

        Ok(stream.boxed())
    }

    async fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn clear_cache(&self, peripheral: &Peripheral) -> Result<()> {
        let address = peripheral.address().to_string();
        if self.peripherals.lock().await.remove(&address).is_some() {
            debug!("Evicted {} from the peripheral cache", address);
        }
        Ok(())
    }
}

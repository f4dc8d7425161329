use bytes::Bytes;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    ble::BtleplugTransport,
    connection::Connection,
    correlator::{CommandCorrelator, SingleFlight},
    error::{MowerError, Result},
    message::{CommandCatalog, DeviceMessage, MessageCodec, BLE_SYNC_COMMAND},
    protocol::FrameSecurity,
    state::{DeviceSnapshot, DeviceStateStore},
    transport::BleTransport,
    types::{ConnectionParams, ConnectionState, DeviceInfo, TimeoutConfig},
};

/// Main interface for controlling a mower over Bluetooth Low Energy
///
/// `MowerDevice` ties the pieces of the local path together: commands are
/// built from a [`CommandCatalog`], encoded by a [`MessageCodec`], framed and
/// written over a lifecycle-managed [`Connection`], and answered through the
/// [`CommandCorrelator`]. Every message the device sends is also folded into
/// a [`DeviceSnapshot`].
///
/// The link is opened lazily and closed again after the idle window
/// (`TimeoutConfig::idle_disconnect_ms`). Commands run one at a time.
///
/// # Examples
///
/// ```no_run
/// use mowerlink::{JsonCodec, MowerDevice};
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mower = MowerDevice::connect_first(Arc::new(JsonCodec)).await?;
///
///     let response = mower.command("get_device_base_info", Value::Null).await?;
///     println!("Device answered: {response:?}");
///
///     let snapshot = mower.snapshot();
///     println!("State revision {}", snapshot.revision);
///
///     mower.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct MowerDevice<T: BleTransport = BtleplugTransport> {
    connection: Connection<T>,
    correlator: Arc<CommandCorrelator>,
    store: DeviceStateStore,
    catalog: CommandCatalog,
    codec: Arc<dyn MessageCodec>,
}

/// Builder for [`MowerDevice`]
pub struct MowerDeviceBuilder<T: BleTransport> {
    transport: Arc<T>,
    device: DeviceInfo,
    codec: Arc<dyn MessageCodec>,
    params: ConnectionParams,
    timeouts: TimeoutConfig,
    catalog: CommandCatalog,
    security: Option<Arc<dyn FrameSecurity>>,
}

impl<T: BleTransport> MowerDeviceBuilder<T> {
    /// Connection parameters
    #[must_use]
    pub fn params(mut self, params: ConnectionParams) -> Self {
        self.params = params;
        self
    }

    /// Timer configuration
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replace the standard command catalog
    #[must_use]
    pub fn catalog(mut self, catalog: CommandCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Frame checksum/encryption capability
    #[must_use]
    pub fn security(mut self, security: Arc<dyn FrameSecurity>) -> Self {
        self.security = Some(security);
        self
    }

    /// Assemble the device without connecting
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Codec`] if the sync message cannot be encoded.
    pub fn build(self) -> Result<MowerDevice<T>> {
        let store = DeviceStateStore::new();
        let gate = SingleFlight::new();
        let correlator = Arc::new(CommandCorrelator::new(
            self.codec.clone(),
            store.clone(),
            gate.clone(),
            Duration::from_millis(self.timeouts.command_timeout_ms),
        ));

        let mut builder = Connection::builder(self.transport, self.device, correlator.clone(), gate)
            .params(self.params)
            .timeouts(self.timeouts);

        match self.catalog.build(BLE_SYNC_COMMAND, &Value::Null) {
            Ok(sync) => builder = builder.sync_payload(self.codec.encode(&sync)?),
            Err(e) => warn!("No BLE sync message available: {}", e),
        }
        if let Some(security) = self.security {
            builder = builder.security(security);
        }

        Ok(MowerDevice {
            connection: builder.build(),
            correlator,
            store,
            catalog: self.catalog,
            codec: self.codec,
        })
    }
}

impl MowerDevice<BtleplugTransport> {
    /// Connect to the strongest mower in range with default settings
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::DeviceNotFound`] if no mower is found during the
    /// scan, or any connect error.
    pub async fn connect_first(codec: Arc<dyn MessageCodec>) -> Result<Self> {
        Self::connect_first_with_config(codec, ConnectionParams::default(), TimeoutConfig::default())
            .await
    }

    /// Connect to the strongest mower in range
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::DeviceNotFound`] if no mower is found during the
    /// scan, or any connect error.
    pub async fn connect_first_with_config(
        codec: Arc<dyn MessageCodec>,
        params: ConnectionParams,
        timeouts: TimeoutConfig,
    ) -> Result<Self> {
        let transport = Arc::new(BtleplugTransport::new(params.clone()).await?);
        let device_info = transport
            .scan_for_devices()
            .await?
            .into_iter()
            .next()
            .ok_or(MowerError::DeviceNotFound)?;

        let device = MowerDevice::builder(transport, device_info, codec)
            .params(params)
            .timeouts(timeouts)
            .build()?;
        device.connect().await?;
        Ok(device)
    }
}

impl<T: BleTransport> MowerDevice<T> {
    /// Start building a device on an arbitrary transport
    #[must_use]
    pub fn builder(
        transport: Arc<T>,
        device: DeviceInfo,
        codec: Arc<dyn MessageCodec>,
    ) -> MowerDeviceBuilder<T> {
        MowerDeviceBuilder {
            transport,
            device,
            codec,
            params: ConnectionParams::default(),
            timeouts: TimeoutConfig::default(),
            catalog: CommandCatalog::standard(),
            security: None,
        }
    }

    /// Get device information
    #[must_use]
    pub fn device_info(&self) -> &DeviceInfo {
        self.connection.device()
    }

    /// Get the command catalog
    #[must_use]
    pub const fn catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Open the link now instead of on the first command
    ///
    /// # Errors
    ///
    /// Returns any connect error.
    pub async fn connect(&self) -> Result<()> {
        self.connection.ensure_connected().await?;
        self.connection.touch();
        info!("{} ready", self.device_info());
        Ok(())
    }

    /// Run a catalog command and wait for the device's answer
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::UnknownCommand`] or
    /// [`MowerError::InvalidParameters`] before anything is sent,
    /// [`MowerError::Timeout`] if the device does not answer, or the transport
    /// error that tore the link down.
    pub async fn command(&self, key: &str, args: Value) -> Result<DeviceMessage> {
        let message = self.catalog.build(key, &args)?;
        let payload = self.codec.encode(&message)?;
        self.send_raw(key, payload).await
    }

    /// Send an already encoded payload and wait for the device's answer
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Timeout`] if the device does not answer, or the
    /// transport error that tore the link down.
    pub async fn send_raw(&self, key: &str, payload: Bytes) -> Result<DeviceMessage> {
        self.correlator.send(&self.connection, key, payload).await
    }

    /// Current merged device state
    #[must_use]
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.store.snapshot()
    }

    /// Receive every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<DeviceSnapshot>> {
        self.store.subscribe()
    }

    /// Close the link, announcing it to the device first
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}

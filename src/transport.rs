use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::{error::Result, types::DeviceInfo};

/// Stream of raw notification payloads from one endpoint
pub type NotificationStream = BoxStream<'static, Bytes>;

/// A characteristic exposed by the connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the service owning the characteristic
    pub service: Uuid,
}

impl Endpoint {
    /// Create an endpoint reference
    #[must_use]
    pub const fn new(uuid: Uuid, service: Uuid) -> Self {
        Self { uuid, service }
    }
}

/// Raw wireless link primitives
///
/// Implementations only move bytes. Framing, sequencing and lifecycle policy
/// live in [`crate::connection::Connection`].
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Per-connection handle
    type Handle: Clone + Send + Sync + 'static;

    /// Open a link to the device
    ///
    /// # Errors
    ///
    /// Returns [`crate::MowerError::DeviceNotFound`] if the device is not
    /// reachable, or a transport error if the link cannot be opened.
    async fn connect(&self, device: &DeviceInfo) -> Result<Self::Handle>;

    /// List the endpoints exposed by the connected device
    ///
    /// # Errors
    ///
    /// Returns a transport error if discovery fails.
    async fn discover_endpoints(&self, handle: &Self::Handle) -> Result<Vec<Endpoint>>;

    /// Write one packet to an endpoint
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails.
    async fn write(&self, handle: &Self::Handle, endpoint: &Endpoint, data: &[u8]) -> Result<()>;

    /// Start notifications on an endpoint
    ///
    /// The stream ends when the link drops.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the subscription fails.
    async fn subscribe(
        &self,
        handle: &Self::Handle,
        endpoint: &Endpoint,
    ) -> Result<NotificationStream>;

    /// Close the link
    ///
    /// # Errors
    ///
    /// Returns a transport error if the link cannot be closed cleanly.
    async fn disconnect(&self, handle: &Self::Handle) -> Result<()>;

    /// Forget anything cached about the device so the next connect rediscovers it
    ///
    /// # Errors
    ///
    /// Returns a transport error if the cache cannot be cleared.
    async fn clear_cache(&self, handle: &Self::Handle) -> Result<()>;
}

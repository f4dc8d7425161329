//! Request/response correlation over the local link.
//!
//! The device protocol carries no request ids. A command is answered by the
//! first completed message whose field group differs from the previously
//! observed one; identical repeats and sync acknowledgements never resolve a
//! call.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{oneshot, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::{MowerError, Result},
    message::{DeviceMessage, MessageCodec, SubMessage},
    protocol::LogicalMessage,
    state::DeviceStateStore,
};

/// At most one operation in flight; later callers wait their turn
#[derive(Debug, Clone)]
pub struct SingleFlight {
    semaphore: Arc<Semaphore>,
}

impl SingleFlight {
    /// Create an open gate
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the gate; it reopens when the permit is dropped
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Disconnected`] if the gate has been closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MowerError::Disconnected)
    }

    /// Whether an operation currently holds the gate
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives completed logical messages from the connection's reader task
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A new link was bound
    async fn on_link_up(&self) {}

    /// A logical message was reassembled
    async fn on_message(&self, message: LogicalMessage);

    /// The link reported a non-fatal diagnostic such as a read sequence gap
    async fn on_diagnostic(&self, _diagnostic: MowerError) {}
}

/// The link side of a command
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Make sure the link is up and note command activity
    ///
    /// # Errors
    ///
    /// Returns any connect-time error.
    async fn ensure_ready(&self) -> Result<()>;

    /// Frame and write one payload
    ///
    /// # Errors
    ///
    /// Returns a transport error after tearing the link down.
    async fn write_payload(&self, payload: &[u8]) -> Result<()>;

    /// The command finished, successfully or not
    async fn finish(&self) {}
}

struct PendingCall {
    key: String,
    sender: oneshot::Sender<DeviceMessage>,
}

/// Clears the pending slot however the command ends, cancellation included
struct PendingGuard<'a> {
    slot: &'a Mutex<Option<PendingCall>>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns writes plus asynchronous notifications into awaited results
pub struct CommandCorrelator {
    codec: Arc<dyn MessageCodec>,
    store: DeviceStateStore,
    gate: SingleFlight,
    pending: Mutex<Option<PendingCall>>,
    last_seen: Mutex<Option<SubMessage>>,
    command_timeout: Duration,
}

impl CommandCorrelator {
    /// Create a correlator that merges every message into `store`
    #[must_use]
    pub fn new(
        codec: Arc<dyn MessageCodec>,
        store: DeviceStateStore,
        gate: SingleFlight,
        command_timeout: Duration,
    ) -> Self {
        Self {
            codec,
            store,
            gate,
            pending: Mutex::new(None),
            last_seen: Mutex::new(None),
            command_timeout,
        }
    }

    /// The single-flight gate serializing commands
    #[must_use]
    pub const fn gate(&self) -> &SingleFlight {
        &self.gate
    }

    /// Whether a command is waiting for its response
    #[must_use]
    pub fn has_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Send a command and wait for the device's answer
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Timeout`] if no new field group arrives in time,
    /// [`MowerError::Disconnected`] if the link drops while waiting, or any
    /// error from connecting or writing.
    pub async fn send<C>(&self, channel: &C, key: &str, payload: Bytes) -> Result<DeviceMessage>
    where
        C: CommandChannel + ?Sized,
    {
        let _permit = self.gate.acquire().await?;
        let result = self.exchange(channel, key, &payload).await;
        channel.finish().await;
        result
    }

    async fn exchange<C>(&self, channel: &C, key: &str, payload: &[u8]) -> Result<DeviceMessage>
    where
        C: CommandChannel + ?Sized,
    {
        channel.ensure_ready().await?;

        let (sender, receiver) = oneshot::channel();
        *lock(&self.pending) = Some(PendingCall {
            key: key.to_string(),
            sender,
        });
        let _guard = PendingGuard {
            slot: &self.pending,
        };

        debug!("Sending {} ({} bytes)", key, payload.len());
        channel.write_payload(payload).await?;

        match timeout(self.command_timeout, receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(MowerError::Disconnected),
            Err(_) => {
                warn!("{} timed out", key);
                Err(MowerError::Timeout {
                    timeout_ms: u64::try_from(self.command_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Forget the previously observed field group
    pub fn reset(&self) {
        lock(&self.last_seen).take();
    }

    fn resolve(&self, message: DeviceMessage) {
        if message.is_sync_ack() {
            debug!("Sync acknowledgement, not a command response");
            return;
        }

        let Ok(Some(part)) = message.single() else {
            return;
        };

        {
            let mut last_seen = lock(&self.last_seen);
            if last_seen.as_ref() == Some(part) {
                debug!("Duplicate {}.{} suppressed", part.category(), part.group().name);
                return;
            }
            *last_seen = Some(part.clone());
        }

        if let Some(call) = lock(&self.pending).take() {
            debug!(
                "{} answered by {}.{}",
                call.key,
                part.category(),
                part.group().name
            );
            // Receiver gone means the caller stopped waiting.
            let _ = call.sender.send(message);
        }
    }
}

#[async_trait]
impl NotificationSink for CommandCorrelator {
    async fn on_link_up(&self) {
        self.reset();
        self.store.reset();
    }

    async fn on_message(&self, message: LogicalMessage) {
        if !message.is_custom_data() {
            debug!(
                "Ignoring {:?} sub type {} message",
                message.package_type, message.sub_type
            );
            return;
        }

        let decoded = match self.codec.decode(&message.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                return;
            }
        };

        if let Err(e) = self.store.merge(&decoded) {
            warn!("Not merged into state: {}", e);
        }

        self.resolve(decoded);
    }
}

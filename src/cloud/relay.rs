//! Cloud command correlation over the message relay.
//!
//! Commands are published through the relay, which answers with a
//! correlation id. The device's answer arrives later as a thing event
//! carrying the same id. Any number of calls may be outstanding.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, warn};

use crate::{
    cloud::{
        gateway::SignedGateway,
        session::CloudGateway,
    },
    error::{MowerError, Result},
    message::{CommandCatalog, DeviceMessage, MessageCodec},
    state::{DeviceSnapshot, DeviceStateStore},
};

/// Topic filter matching every thing-event topic
pub const THING_EVENTS_FILTER: &str = "/sys/+/+/app/down/thing/events";

/// Identifier of events carrying an encoded device message
pub const DEVICE_MESSAGE_EVENT: &str = "device_protobuf_msg_event";

const THING_EVENTS_SUFFIX: &str = "/app/down/thing/events";

/// One message delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    /// Topic the message was published on
    pub topic: String,
    /// Raw message body
    pub payload: Bytes,
}

impl RelayEvent {
    /// Create an event
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Stream of relay events matching a topic filter
pub type RelayEventStream = BoxStream<'static, RelayEvent>;

/// The cloud message relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Deliver `payload` to the device `target_id`
    ///
    /// Returns the correlation id the device's answer will carry.
    ///
    /// # Errors
    ///
    /// Returns any error from the relay.
    async fn publish(&self, target_id: &str, payload: &[u8]) -> Result<String>;

    /// Events on topics matching `topic_filter` (`+` one level, `#` the rest)
    ///
    /// # Errors
    ///
    /// Returns any error from the relay.
    async fn subscribe(&self, topic_filter: &str) -> Result<RelayEventStream>;
}

/// Whether `topic` matches an MQTT-style `filter`
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        if level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(actual) if level == "+" || level == actual => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Relay`] that publishes through the cloud gateway
///
/// The gateway has no message-queue side, so events are fed in by whatever
/// broker client the application runs, through [`GatewayRelay::deliver`].
pub struct GatewayRelay<G: SignedGateway> {
    gateway: Arc<CloudGateway<G>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<RelayEvent>)>>,
}

impl<G: SignedGateway> GatewayRelay<G> {
    /// Relay over an established gateway session
    #[must_use]
    pub fn new(gateway: Arc<CloudGateway<G>>) -> Self {
        Self {
            gateway,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Hand a received broker message to matching subscribers
    pub fn deliver(&self, event: &RelayEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|(filter, sender)| {
            if !topic_matches(filter, &event.topic) {
                return !sender.is_closed();
            }
            sender.unbounded_send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl<G: SignedGateway> Relay for GatewayRelay<G> {
    async fn publish(&self, target_id: &str, payload: &[u8]) -> Result<String> {
        self.gateway.invoke_service(target_id, payload).await
    }

    async fn subscribe(&self, topic_filter: &str) -> Result<RelayEventStream> {
        let (sender, receiver) = mpsc::unbounded();
        lock(&self.subscribers).push((topic_filter.to_string(), sender));
        Ok(receiver.boxed())
    }
}

/// A thing event parsed from a relay message
#[derive(Debug, Clone, PartialEq)]
pub struct ThingEvent {
    /// Correlation id
    pub id: String,
    /// Topic the event arrived on
    pub topic: String,
    /// Event identifier
    pub identifier: Option<String>,
    /// Embedded device message, for device-message events
    pub message: Option<DeviceMessage>,
    /// Full event body
    pub raw: Value,
}

impl ThingEvent {
    /// Parse a relay event, decoding any embedded device message
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Json`] for a non-JSON body,
    /// [`MowerError::Codec`] if the body has no id, or any error decoding the
    /// embedded message.
    pub fn parse(event: &RelayEvent, codec: &dyn MessageCodec) -> Result<Self> {
        let raw: Value = serde_json::from_slice(&event.payload)?;

        let id = match raw.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(MowerError::Codec("event has no id".to_string())),
        };
        let identifier = raw
            .pointer("/params/identifier")
            .and_then(Value::as_str)
            .map(str::to_string);

        let carries_message = event.topic.ends_with(THING_EVENTS_SUFFIX)
            && identifier.as_deref() == Some(DEVICE_MESSAGE_EVENT);
        let message = if carries_message {
            let content = raw
                .pointer("/params/value/content")
                .and_then(Value::as_str)
                .ok_or_else(|| MowerError::Codec("device event has no content".to_string()))?;
            Some(codec.decode(&STANDARD.decode(content)?)?)
        } else {
            None
        };

        Ok(Self {
            id,
            topic: event.topic.clone(),
            identifier,
            message,
            raw,
        })
    }
}

type PendingCalls = Mutex<HashMap<String, oneshot::Sender<ThingEvent>>>;

/// Removes a call's entry however `submit` ends, cancellation included
struct PendingEntry<'a> {
    pending: &'a PendingCalls,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// Matches relay events to outstanding cloud calls by correlation id
pub struct CloudCommandCorrelator {
    relay: Arc<dyn Relay>,
    codec: Arc<dyn MessageCodec>,
    store: DeviceStateStore,
    pending: PendingCalls,
    response_timeout: Duration,
}

impl CloudCommandCorrelator {
    /// Create a correlator that merges device events into `store`
    #[must_use]
    pub fn new(
        relay: Arc<dyn Relay>,
        codec: Arc<dyn MessageCodec>,
        store: DeviceStateStore,
        response_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            codec,
            store,
            pending: Mutex::new(HashMap::new()),
            response_timeout,
        }
    }

    /// Number of calls waiting for their event
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Publish a payload and wait for the event carrying its correlation id
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Timeout`] if no matching event arrives in time,
    /// or any publish error.
    pub async fn submit(&self, target_id: &str, key: &str, payload: &[u8]) -> Result<ThingEvent> {
        let id = self.relay.publish(target_id, payload).await?;
        debug!("Published {} to {} as {}", key, target_id, id);

        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), sender);
        let entry = PendingEntry {
            pending: &self.pending,
            id,
        };
        let id = &entry.id;

        match timeout(self.response_timeout, receiver).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(MowerError::Disconnected),
            Err(_) => {
                error!("{} to {} timed out waiting for {}", key, target_id, id);
                Err(MowerError::Timeout {
                    timeout_ms: u64::try_from(self.response_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Merge and correlate one relay event
    pub async fn handle_event(&self, event: &RelayEvent) {
        let parsed = match ThingEvent::parse(event, self.codec.as_ref()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping relay event on {}: {}", event.topic, e);
                return;
            }
        };

        if let Some(message) = &parsed.message {
            if let Err(e) = self.store.merge(message) {
                warn!("Not merged into state: {}", e);
            }
        }

        let sender = lock(&self.pending).remove(&parsed.id);
        if let Some(sender) = sender {
            debug!("Event {} resolved a pending call", parsed.id);
            let _ = sender.send(parsed);
        }
    }

    /// Subscribe to thing events and handle them until the stream ends
    ///
    /// The task holds only a weak reference and stops once the correlator
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns any error from subscribing.
    pub async fn listen(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut events = self.relay.subscribe(THING_EVENTS_FILTER).await?;
        let correlator: Weak<Self> = Arc::downgrade(self);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(correlator) = correlator.upgrade() else {
                    break;
                };
                correlator.handle_event(&event).await;
            }
            debug!("Relay event stream ended");
        }))
    }
}

/// Upward surface for a device reached through the cloud
pub struct CloudDevice {
    iot_id: String,
    correlator: Arc<CloudCommandCorrelator>,
    store: DeviceStateStore,
    catalog: CommandCatalog,
    codec: Arc<dyn MessageCodec>,
    listener: JoinHandle<()>,
}

impl CloudDevice {
    /// Attach to `iot_id` through `relay` and start handling its events
    ///
    /// # Errors
    ///
    /// Returns any error from subscribing to the relay.
    pub async fn attach(
        iot_id: impl Into<String>,
        relay: Arc<dyn Relay>,
        codec: Arc<dyn MessageCodec>,
        catalog: CommandCatalog,
        response_timeout: Duration,
    ) -> Result<Self> {
        let store = DeviceStateStore::new();
        let correlator = Arc::new(CloudCommandCorrelator::new(
            relay,
            codec.clone(),
            store.clone(),
            response_timeout,
        ));
        let listener = correlator.listen().await?;

        Ok(Self {
            iot_id: iot_id.into(),
            correlator,
            store,
            catalog,
            codec,
            listener,
        })
    }

    /// Cloud id of the device
    #[must_use]
    pub fn iot_id(&self) -> &str {
        &self.iot_id
    }

    /// Build, publish and await a catalog command
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::UnknownCommand`] for keys not in the catalog,
    /// [`MowerError::Timeout`] if the device does not answer, or
    /// [`MowerError::Codec`] if the answering event carries no message.
    pub async fn command(&self, key: &str, args: Value) -> Result<DeviceMessage> {
        let message = self.catalog.build(key, &args)?;
        let payload = self.codec.encode(&message)?;
        let event = self.correlator.submit(&self.iot_id, key, &payload).await?;

        event.message.ok_or_else(|| {
            MowerError::Codec(format!("event {} carried no device message", event.id))
        })
    }

    /// Current merged device state
    #[must_use]
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.store.snapshot()
    }

    /// Receive every state change
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<DeviceSnapshot>> {
        self.store.subscribe()
    }
}

impl Drop for CloudDevice {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

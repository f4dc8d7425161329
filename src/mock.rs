//! In-memory transport for tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::{
    error::{MowerError, Result},
    protocol::{
        Assembly, Direction, EncodeOptions, FrameEncoder, NotificationAccumulator,
        SequenceCounter, MIN_PACKAGE_LENGTH,
    },
    transport::{BleTransport, Endpoint, NotificationStream},
    types::DeviceInfo,
    MOWER_NOTIFY_CHAR_UUID, MOWER_SERVICE_UUID, MOWER_WRITE_CHAR_UUID,
};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct MockState {
    endpoints: Vec<Endpoint>,
    connects: usize,
    failing_connects: usize,
    disconnects: usize,
    cache_clears: usize,
    fail_writes: bool,
    frames: Vec<Bytes>,
    payloads: Vec<Bytes>,
    written: NotificationAccumulator,
    notifier: Option<mpsc::UnboundedSender<Bytes>>,
    device_sequence: Arc<SequenceCounter>,
    responder: Option<Responder>,
}

/// Scriptable transport; the device side answers through `respond_with`
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_endpoints(vec![
            Endpoint::new(MOWER_WRITE_CHAR_UUID, MOWER_SERVICE_UUID),
            Endpoint::new(MOWER_NOTIFY_CHAR_UUID, MOWER_SERVICE_UUID),
        ])
    }

    pub(crate) fn without_endpoint(missing: Uuid) -> Arc<Self> {
        Self::with_endpoints(
            [MOWER_WRITE_CHAR_UUID, MOWER_NOTIFY_CHAR_UUID]
                .into_iter()
                .filter(|uuid| *uuid != missing)
                .map(|uuid| Endpoint::new(uuid, MOWER_SERVICE_UUID))
                .collect(),
        )
    }

    fn with_endpoints(endpoints: Vec<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                endpoints,
                connects: 0,
                failing_connects: 0,
                disconnects: 0,
                cache_clears: 0,
                fail_writes: false,
                frames: Vec::new(),
                payloads: Vec::new(),
                written: NotificationAccumulator::new(),
                notifier: None,
                device_sequence: Arc::new(SequenceCounter::new()),
                responder: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.state().failing_connects = count;
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Reply to each complete app payload with the returned device payload
    pub(crate) fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state().responder = Some(Box::new(responder));
    }

    pub(crate) fn connects(&self) -> usize {
        self.state().connects
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub(crate) fn cache_clears(&self) -> usize {
        self.state().cache_clears
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.state().frames.len()
    }

    /// App payloads reassembled from every written frame
    pub(crate) fn written_payloads(&self) -> Vec<Bytes> {
        self.state().payloads.clone()
    }

    pub(crate) fn notify_payload(&self, payload: &[u8]) {
        Self::push_device_payload(&mut self.state(), payload);
    }

    pub(crate) fn notify_raw(&self, frame: Bytes) {
        if let Some(notifier) = &self.state().notifier {
            let _ = notifier.unbounded_send(frame);
        }
    }

    /// Lose the device's next frame on air
    pub(crate) fn skip_device_sequence(&self) {
        self.state().device_sequence.next();
    }

    /// End the notification stream as if the device walked away
    pub(crate) fn drop_link(&self) {
        self.state().notifier.take();
    }

    fn push_device_payload(state: &mut MockState, payload: &[u8]) {
        let encoder = FrameEncoder::new(MIN_PACKAGE_LENGTH, state.device_sequence.clone());
        let options = EncodeOptions::custom_data().with_direction(Direction::DeviceToApp);
        let Ok(frames) = encoder.encode(payload, &options) else {
            return;
        };
        if let Some(notifier) = &state.notifier {
            for frame in frames {
                let _ = notifier.unbounded_send(frame);
            }
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    type Handle = usize;

    async fn connect(&self, _device: &DeviceInfo) -> Result<usize> {
        let mut state = self.state();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(MowerError::Transport("adapter busy".to_string()));
        }
        Ok(state.connects)
    }

    async fn discover_endpoints(&self, _handle: &usize) -> Result<Vec<Endpoint>> {
        Ok(self.state().endpoints.clone())
    }

    async fn write(&self, _handle: &usize, endpoint: &Endpoint, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.frames.push(Bytes::copy_from_slice(data));
        if state.fail_writes {
            return Err(MowerError::Transport("write rejected".to_string()));
        }
        if endpoint.uuid != MOWER_WRITE_CHAR_UUID {
            return Err(MowerError::EndpointMissing(endpoint.uuid));
        }

        let Ok(pushed) = state.written.push(data) else {
            return Ok(());
        };
        if let Assembly::Complete(message) = pushed.assembly {
            state.payloads.push(message.data.clone());
            let reply = state.responder.as_mut().and_then(|respond| respond(&message.data));
            if let Some(reply) = reply {
                Self::push_device_payload(&mut state, &reply);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, _handle: &usize, _endpoint: &Endpoint) -> Result<NotificationStream> {
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.state();
        state.notifier = Some(sender);
        state.device_sequence.reset();
        state.written.reset();
        Ok(receiver.boxed())
    }

    async fn disconnect(&self, _handle: &usize) -> Result<()> {
        let mut state = self.state();
        state.disconnects += 1;
        state.notifier.take();
        Ok(())
    }

    async fn clear_cache(&self, _handle: &usize) -> Result<()> {
        self.state().cache_clears += 1;
        Ok(())
    }
}

//! Connection lifecycle for one device.
//!
//! `Disconnected -> Connecting -> Bound -> IdleDisconnecting -> Disconnected`.
//!
//! Two locks are involved. The connect mutex guards the bound link and is
//! held for connect, teardown and every write. The single-flight gate is
//! owned by the command path; the idle timer only consults it so that an
//! expiry during a command is deferred instead of executed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    correlator::{CommandChannel, NotificationSink, SingleFlight},
    error::{MowerError, Result},
    protocol::{
        Assembly, EncodeOptions, FrameEncoder, FrameSecurity, NotificationAccumulator, Pushed,
        SequenceCounter,
    },
    transport::{BleTransport, Endpoint, NotificationStream},
    types::{ConnectionParams, ConnectionState, DeviceInfo, TimeoutConfig},
    MOWER_NOTIFY_CHAR_UUID, MOWER_WRITE_CHAR_UUID,
};

struct Link<H> {
    id: u64,
    handle: H,
    write: Endpoint,
    encoder: FrameEncoder,
    reader: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

#[derive(Default)]
struct IdleTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner<T: BleTransport> {
    transport: Arc<T>,
    device: DeviceInfo,
    params: ConnectionParams,
    timeouts: TimeoutConfig,
    link: Mutex<Option<Link<T::Handle>>>,
    state: RwLock<ConnectionState>,
    idle: StdMutex<IdleTimer>,
    gate: SingleFlight,
    sink: Arc<dyn NotificationSink>,
    sequence: Arc<SequenceCounter>,
    security: Option<Arc<dyn FrameSecurity>>,
    sync_payload: Option<Bytes>,
    link_ids: AtomicU64,
}

/// Builder for [`Connection`]
pub struct ConnectionBuilder<T: BleTransport> {
    transport: Arc<T>,
    device: DeviceInfo,
    sink: Arc<dyn NotificationSink>,
    gate: SingleFlight,
    params: ConnectionParams,
    timeouts: TimeoutConfig,
    security: Option<Arc<dyn FrameSecurity>>,
    sync_payload: Option<Bytes>,
}

impl<T: BleTransport> ConnectionBuilder<T> {
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

    /// Checksum/encryption capability for frames in both directions
    #[must_use]
    pub fn security(mut self, security: Arc<dyn FrameSecurity>) -> Self {
        self.security = Some(security);
        self
    }

    /// Encoded message written after binding and before orderly teardown
    #[must_use]
    pub fn sync_payload(mut self, payload: Bytes) -> Self {
        self.sync_payload = Some(payload);
        self
    }

    /// Build the connection; nothing is opened until first use
    #[must_use]
    pub fn build(self) -> Connection<T> {
        Connection {
            inner: Arc::new(Inner {
                transport: self.transport,
                device: self.device,
                params: self.params,
                timeouts: self.timeouts,
                link: Mutex::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                idle: StdMutex::new(IdleTimer::default()),
                gate: self.gate,
                sink: self.sink,
                sequence: Arc::new(SequenceCounter::new()),
                security: self.security,
                sync_payload: self.sync_payload,
                link_ids: AtomicU64::new(0),
            }),
        }
    }
}

/// Lifecycle-managed link to one device
pub struct Connection<T: BleTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: BleTransport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: BleTransport> Connection<T> {
    /// Start building a connection
    ///
    /// Completed messages go to `sink`; `gate` is the single-flight gate of
    /// the command path.
    #[must_use]
    pub fn builder(
        transport: Arc<T>,
        device: DeviceInfo,
        sink: Arc<dyn NotificationSink>,
        gate: SingleFlight,
    ) -> ConnectionBuilder<T> {
        ConnectionBuilder {
            transport,
            device,
            sink,
            gate,
            params: ConnectionParams::default(),
            timeouts: TimeoutConfig::default(),
            security: None,
            sync_payload: None,
        }
    }

    /// Device this connection talks to
    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Connect and bind unless already bound
    ///
    /// # Errors
    ///
    /// Returns the last connect error once the retry budget is spent, or
    /// [`MowerError::EndpointMissing`] if the device lacks the write or
    /// notify endpoint.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.state().await == ConnectionState::Bound {
            return Ok(());
        }

        let mut slot = self.inner.link.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        self.inner.connect_locked(&mut slot).await
    }

    /// Frame and write a payload, connecting first if needed
    ///
    /// A transport failure tears the link down after a short backoff and is
    /// returned to the caller; the write is not retried.
    ///
    /// # Errors
    ///
    /// Returns any connect error, [`MowerError::InvalidParameters`] if the
    /// payload cannot be framed, or the transport error that ended the link.
    pub async fn send_payload(&self, payload: &[u8]) -> Result<()> {
        let result = {
            let mut slot = self.inner.link.lock().await;
            if slot.is_none() {
                self.inner.connect_locked(&mut slot).await?;
            }
            match slot.as_ref() {
                Some(link) => self.inner.write_frames(link, payload).await,
                None => Err(MowerError::Disconnected),
            }
        };

        match result {
            Err(e) if e.is_transport_error() => {
                warn!("Write to {} failed: {}", self.inner.device, e);
                sleep(Duration::from_millis(self.inner.timeouts.error_backoff_ms)).await;
                self.force_disconnect().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Restart the idle timer
    pub fn touch(&self) {
        self.inner.arm_idle();
    }

    /// Orderly teardown, announcing it to the device first
    pub async fn disconnect(&self) {
        let mut slot = self.inner.link.lock().await;
        self.inner.teardown(&mut slot, true).await;
    }

    /// Immediate teardown without talking to the device
    pub async fn force_disconnect(&self) {
        let mut slot = self.inner.link.lock().await;
        self.inner.teardown(&mut slot, false).await;
    }
}

#[async_trait]
impl<T: BleTransport> CommandChannel for Connection<T> {
    async fn ensure_ready(&self) -> Result<()> {
        self.ensure_connected().await?;
        self.touch();
        Ok(())
    }

    async fn write_payload(&self, payload: &[u8]) -> Result<()> {
        self.send_payload(payload).await
    }

    async fn finish(&self) {
        if self.state().await == ConnectionState::Bound {
            self.touch();
        }
    }
}

impl<T: BleTransport> Inner<T> {
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!("{}: {} -> {}", self.device, *state, next);
            *state = next;
        }
    }

    async fn connect_locked(
        self: &Arc<Self>,
        slot: &mut Option<Link<T::Handle>>,
    ) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;
        info!("Connecting to {}", self.device);

        let link = match self.open_link().await {
            Ok(link) => link,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                return Err(e);
            }
        };

        let link = slot.insert(link);
        self.set_state(ConnectionState::Bound).await;
        self.arm_idle();
        info!("Connected to {}", self.device);

        if self.params.sync_on_connect {
            if let Some(payload) = &self.sync_payload {
                if let Err(e) = self.write_frames(link, payload).await {
                    warn!("Sync after connect to {} failed: {}", self.device, e);
                    self.teardown(slot, false).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn open_link(self: &Arc<Self>) -> Result<Link<T::Handle>> {
        let handle = self.connect_with_retry().await?;

        match self.bind(handle.clone()).await {
            Ok(link) => Ok(link),
            Err(e) => {
                if let MowerError::EndpointMissing(uuid) = &e {
                    warn!("{} has no endpoint {}, clearing cache", self.device, uuid);
                    if let Err(clear) = self.transport.clear_cache(&handle).await {
                        debug!("Cache clear for {} failed: {}", self.device, clear);
                    }
                }
                if let Err(close) = self.transport.disconnect(&handle).await {
                    debug!("Disconnect from {} failed: {}", self.device, close);
                }
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&self) -> Result<T::Handle> {
        let attempts = self.params.connect_attempts.max(1);
        let per_attempt = Duration::from_millis(self.params.connect_timeout_ms);
        let mut last_error = MowerError::DeviceNotFound;

        for attempt in 1..=attempts {
            match timeout(per_attempt, self.transport.connect(&self.device)).await {
                Ok(Ok(handle)) => return Ok(handle),
                Ok(Err(e)) => {
                    debug!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt, attempts, self.device, e
                    );
                    last_error = e;
                }
                Err(_) => {
                    debug!(
                        "Connect attempt {}/{} to {} timed out",
                        attempt, attempts, self.device
                    );
                    last_error = MowerError::Timeout {
                        timeout_ms: self.params.connect_timeout_ms,
                    };
                }
            }

            if attempt < attempts {
                sleep(Duration::from_millis(self.timeouts.retry_delay_ms)).await;
            }
        }

        warn!("Giving up on {} after {} attempts", self.device, attempts);
        Err(last_error)
    }

    async fn bind(self: &Arc<Self>, handle: T::Handle) -> Result<Link<T::Handle>> {
        let endpoints = self.transport.discover_endpoints(&handle).await?;
        let find = |uuid: Uuid| {
            endpoints
                .iter()
                .copied()
                .find(|endpoint| endpoint.uuid == uuid)
                .ok_or(MowerError::EndpointMissing(uuid))
        };
        let write = find(MOWER_WRITE_CHAR_UUID)?;
        let notify = find(MOWER_NOTIFY_CHAR_UUID)?;

        let stream = self.transport.subscribe(&handle, &notify).await?;

        self.sequence.reset();
        self.sink.on_link_up().await;

        let mut accumulator = NotificationAccumulator::new();
        let mut encoder = FrameEncoder::new(self.params.package_length, self.sequence.clone());
        if let Some(security) = &self.security {
            accumulator = accumulator.with_security(security.clone());
            encoder = encoder.with_security(security.clone());
        }

        let id = self.link_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let closing = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_notifications(
            Arc::downgrade(self),
            id,
            stream,
            accumulator,
            closing.clone(),
        ));

        Ok(Link {
            id,
            handle,
            write,
            encoder,
            reader,
            closing,
        })
    }

    async fn write_frames(&self, link: &Link<T::Handle>, payload: &[u8]) -> Result<()> {
        let frames = link.encoder.encode(payload, &EncodeOptions::custom_data())?;
        for frame in &frames {
            self.transport.write(&link.handle, &link.write, frame).await?;
        }
        Ok(())
    }

    async fn teardown(&self, slot: &mut Option<Link<T::Handle>>, orderly: bool) {
        let Some(link) = slot.take() else {
            return;
        };
        link.closing.store(true, Ordering::SeqCst);
        self.cancel_idle();

        if orderly && self.params.sync_on_connect {
            if let Some(payload) = &self.sync_payload {
                if let Err(e) = self.write_frames(&link, payload).await {
                    debug!("Sync before disconnecting {} failed: {}", self.device, e);
                }
            }
        }

        link.reader.abort();
        if let Err(e) = self.transport.disconnect(&link.handle).await {
            warn!("Disconnect from {} failed: {}", self.device, e);
        }

        self.set_state(ConnectionState::Disconnected).await;
        info!("Disconnected from {}", self.device);
    }

    fn arm_idle(self: &Arc<Self>) {
        let delay = Duration::from_millis(self.timeouts.idle_disconnect_ms);
        let weak = Arc::downgrade(self);

        let mut idle = lock(&self.idle);
        idle.generation += 1;
        let generation = idle.generation;
        if let Some(task) = idle.task.take() {
            task.abort();
        }
        idle.task = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_idle_expired(generation).await;
            }
        }));
    }

    fn cancel_idle(&self) {
        let mut idle = lock(&self.idle);
        idle.generation += 1;
        if let Some(task) = idle.task.take() {
            task.abort();
        }
    }

    /// Detach the firing timer's handle; false if it was superseded
    fn claim_idle(&self, generation: u64) -> bool {
        let mut idle = lock(&self.idle);
        if idle.generation != generation {
            return false;
        }
        idle.task.take();
        true
    }

    async fn on_idle_expired(self: Arc<Self>, generation: u64) {
        if !self.claim_idle(generation) {
            debug!("Stale idle timer for {} ignored", self.device);
            return;
        }
        if self.gate.is_busy() {
            debug!("{} busy, deferring idle disconnect", self.device);
            self.arm_idle();
            return;
        }

        let mut slot = self.link.lock().await;
        let superseded = lock(&self.idle).generation != generation;
        if superseded {
            debug!("Idle timer for {} reset while waiting", self.device);
            return;
        }
        if self.gate.is_busy() {
            debug!("{} busy, deferring idle disconnect", self.device);
            self.arm_idle();
            return;
        }
        if slot.is_none() {
            return;
        }

        info!(
            "{} idle for {} ms, disconnecting",
            self.device, self.timeouts.idle_disconnect_ms
        );
        self.set_state(ConnectionState::IdleDisconnecting).await;
        self.teardown(&mut slot, true).await;
    }

    async fn on_notification(&self, accumulator: &mut NotificationAccumulator, data: &[u8]) {
        match accumulator.push(data) {
            Ok(Pushed { assembly, gap }) => {
                if let Some(gap) = gap {
                    let diagnostic = MowerError::from(gap);
                    warn!("{}: {}", self.device, diagnostic);
                    self.sink.on_diagnostic(diagnostic).await;
                }
                if let Assembly::Complete(message) = assembly {
                    self.sink.on_message(message).await;
                }
            }
            Err(e) => warn!("{}: dropping frame: {}", self.device, e),
        }
    }

    async fn on_link_lost(&self, link_id: u64) {
        let mut slot = self.link.lock().await;
        if !slot.as_ref().is_some_and(|link| link.id == link_id) {
            return;
        }

        warn!("{} disconnected unexpectedly", self.device);
        self.cancel_idle();
        if let Some(link) = slot.take() {
            if let Err(e) = self.transport.disconnect(&link.handle).await {
                debug!("Cleanup disconnect from {} failed: {}", self.device, e);
            }
        }
        self.set_state(ConnectionState::Disconnected).await;
    }
}

async fn read_notifications<T: BleTransport>(
    inner: Weak<Inner<T>>,
    link_id: u64,
    mut stream: NotificationStream,
    mut accumulator: NotificationAccumulator,
    closing: Arc<AtomicBool>,
) {
    while let Some(data) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.on_notification(&mut accumulator, &data).await;
    }

    if closing.load(Ordering::SeqCst) {
        return;
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_link_lost(link_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockTransport, protocol::LogicalMessage};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        messages: AtomicUsize,
        links: AtomicUsize,
        diagnostics: StdMutex<Vec<MowerError>>,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn on_link_up(&self) {
            self.links.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_message(&self, _message: LogicalMessage) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_diagnostic(&self, diagnostic: MowerError) {
            lock(&self.diagnostics).push(diagnostic);
        }
    }

    fn connection(
        transport: &Arc<MockTransport>,
        sink: &Arc<CountingSink>,
        gate: &SingleFlight,
    ) -> Connection<MockTransport> {
        Connection::builder(
            transport.clone(),
            DeviceInfo::new("Luba-VS1234", "AA:BB:CC:DD:EE:FF"),
            sink.clone(),
            gate.clone(),
        )
        .sync_payload(Bytes::from_static(br#"{"net":{"todev_ble_sync":2}}"#))
        .build()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_binds_and_syncs() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());

        connection.ensure_connected().await.unwrap();

        assert_eq!(connection.state().await, ConnectionState::Bound);
        assert_eq!(transport.connects(), 1);
        assert_eq!(sink.links.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.written_payloads(),
            vec![Bytes::from_static(br#"{"net":{"todev_ble_sync":2}}"#)]
        );

        // Double-checked: a second call does not reconnect
        connection.ensure_connected().await.unwrap();
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_within_budget() {
        let transport = MockTransport::new();
        transport.fail_next_connects(2);
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());

        connection.ensure_connected().await.unwrap();
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        let transport = MockTransport::new();
        transport.fail_next_connects(100);
        let sink = Arc::new(CountingSink::default());
        let connection = Connection::builder(
            transport.clone(),
            DeviceInfo::new("Luba-VS1234", "AA:BB:CC:DD:EE:FF"),
            sink,
            SingleFlight::new(),
        )
        .params(ConnectionParams {
            connect_attempts: 3,
            ..ConnectionParams::default()
        })
        .build();

        let result = connection.ensure_connected().await;
        assert!(matches!(result, Err(MowerError::Transport(_))));
        assert_eq!(transport.connects(), 3);
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_endpoint_clears_cache_and_tears_down() {
        let transport = MockTransport::without_endpoint(MOWER_NOTIFY_CHAR_UUID);
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());

        let result = connection.ensure_connected().await;

        assert!(matches!(
            result,
            Err(MowerError::EndpointMissing(uuid)) if uuid == MOWER_NOTIFY_CHAR_UUID
        ));
        assert_eq!(transport.cache_clears(), 1);
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disconnects() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();

        sleep(Duration::from_millis(9_000)).await;
        assert_eq!(connection.state().await, ConnectionState::Bound);

        sleep(Duration::from_millis(1_500)).await;
        settle().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
        assert_eq!(transport.disconnects(), 1);
        // Sync on connect and sync before the orderly teardown
        assert_eq!(transport.written_payloads().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_idle_timeout() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();

        sleep(Duration::from_millis(6_000)).await;
        connection.touch();
        sleep(Duration::from_millis(6_000)).await;
        settle().await;
        assert_eq!(connection.state().await, ConnectionState::Bound);

        sleep(Duration::from_millis(5_000)).await;
        settle().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_deferred_while_command_in_flight() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let gate = SingleFlight::new();
        let connection = connection(&transport, &sink, &gate);
        connection.ensure_connected().await.unwrap();

        let permit = gate.acquire().await.unwrap();
        sleep(Duration::from_millis(25_000)).await;
        settle().await;
        assert_eq!(connection.state().await, ConnectionState::Bound);

        drop(permit);
        sleep(Duration::from_millis(10_500)).await;
        settle().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_forces_teardown_without_retry() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();
        let writes_before = transport.frame_count();

        transport.fail_writes(true);
        let result = connection.send_payload(b"{}").await;

        assert!(matches!(result, Err(MowerError::Transport(_))));
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.frame_count(), writes_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_reach_sink() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();

        transport.notify_payload(br#"{"sys":{"toapp_report_data":{"battery":70}}}"#);
        settle().await;
        assert_eq!(sink.messages.load(Ordering::SeqCst), 1);

        // Garbage is dropped; the link survives
        transport.notify_raw(Bytes::from_static(&[0x4D, 0x00]));
        settle().await;
        assert_eq!(sink.messages.load(Ordering::SeqCst), 1);
        assert_eq!(connection.state().await, ConnectionState::Bound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_returns_to_disconnected() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();

        transport.drop_link();
        settle().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);

        // Next use reconnects
        connection.ensure_connected().await.unwrap();
        assert_eq!(transport.connects(), 2);
        assert_eq!(sink.links.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orderly_disconnect() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();

        connection.disconnect().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.written_payloads().len(), 2);

        // Idempotent
        connection.disconnect().await;
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_disabled_skips_both_writes() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = Connection::builder(
            transport.clone(),
            DeviceInfo::new("Luba-VS1234", "AA:BB:CC:DD:EE:FF"),
            sink,
            SingleFlight::new(),
        )
        .params(ConnectionParams {
            sync_on_connect: false,
            ..ConnectionParams::default()
        })
        .sync_payload(Bytes::from_static(br#"{"net":{"todev_ble_sync":2}}"#))
        .build();

        connection.ensure_connected().await.unwrap();
        connection.disconnect().await;

        assert_eq!(transport.disconnects(), 1);
        assert!(transport.written_payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_gap_reaches_sink() {
        let transport = MockTransport::new();
        let sink = Arc::new(CountingSink::default());
        let connection = connection(&transport, &sink, &SingleFlight::new());
        connection.ensure_connected().await.unwrap();

        transport.notify_payload(br#"{"sys":{"toapp_report_data":{"battery":70}}}"#);
        transport.skip_device_sequence();
        transport.notify_payload(br#"{"sys":{"toapp_report_data":{"battery":71}}}"#);
        settle().await;

        // Both messages still delivered
        assert_eq!(sink.messages.load(Ordering::SeqCst), 2);
        let diagnostics = lock(&sink.diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].is_diagnostic());
        assert!(matches!(
            diagnostics[0],
            MowerError::SequenceGap { expected, observed } if observed == expected.wrapping_add(1)
        ));
        drop(diagnostics);
        assert_eq!(connection.state().await, ConnectionState::Bound);
    }
}

//! An in-memory transport for exercising the connection-management core
//! without a broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;

use warren::transport::{
    ConnectionEvent, Delivery, ExchangeKind, ExchangeOptions, MessageProperties, QueueInfo,
    QueueOptions, Transport, TransportChannel, TransportConnection, TransportError,
};

/// Everything the fake transport records, shared by every connection and
/// channel it produces.
#[derive(Debug, Default)]
pub struct FakeState {
    connect_attempts: AtomicUsize,
    /// Number of initial connect attempts that fail before one succeeds.
    failing_attempts: AtomicUsize,
    channels_created: AtomicUsize,
    channels_closed: AtomicUsize,
    last_uri: Mutex<Option<String>>,
    acks: Mutex<Vec<u64>>,
    rejects: Mutex<Vec<(u64, bool)>>,
    declared_queues: Mutex<Vec<(String, QueueOptions)>>,
    published: Mutex<Vec<PublishedMessage>>,
    /// Deliveries handed to the first consumer that subscribes.
    deliveries: Mutex<Vec<Delivery>>,
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl FakeState {
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn channels_created(&self) -> usize {
        self.channels_created.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> usize {
        self.channels_closed.load(Ordering::SeqCst)
    }

    pub fn last_uri(&self) -> Option<String> {
        self.last_uri.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().unwrap().clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.rejects.lock().unwrap().clone()
    }

    pub fn declared_queues(&self) -> Vec<(String, QueueOptions)> {
        self.declared_queues.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }
}

/// A [`Transport`] that connects instantly (or fails on demand) and records
/// every interaction in a shared [`FakeState`].
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
        }
    }

    /// A transport whose first `attempts` connection attempts fail.
    pub fn failing(attempts: usize) -> Self {
        let transport = Self::new();
        transport
            .state
            .failing_attempts
            .store(attempts, Ordering::SeqCst);
        transport
    }

    /// A transport that never connects.
    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    /// Queue up deliveries for the first consumer that subscribes.
    pub fn with_deliveries(self, deliveries: Vec<Delivery>) -> Self {
        *self.state.deliveries.lock().unwrap() = deliveries;
        self
    }

    pub fn state(&self) -> Arc<FakeState> {
        Arc::clone(&self.state)
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    type Connection = FakeConnection;

    async fn connect(&self, uri: &str) -> Result<FakeConnection, TransportError> {
        let attempt = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.last_uri.lock().unwrap() = Some(uri.to_owned());
        if attempt <= self.state.failing_attempts.load(Ordering::SeqCst) {
            return Err(TransportError::msg("broker unreachable"));
        }
        Ok(FakeConnection::new(Arc::clone(&self.state)))
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    open: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    state: Arc<FakeState>,
}

impl FakeConnection {
    fn new(state: Arc<FakeState>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            open: AtomicBool::new(true),
            events,
            state,
        }
    }

    /// Simulate a lifecycle event arriving from the broker.
    pub fn emit(&self, event: ConnectionEvent) {
        if matches!(event, ConnectionEvent::Error(_) | ConnectionEvent::Closed) {
            self.open.store(false, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }
}

#[async_trait::async_trait]
impl TransportConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn create_channel(&self) -> Result<FakeChannel, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::msg("connection is closed"));
        }
        let id = self.state.channels_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeChannel {
            id,
            open: AtomicBool::new(true),
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Closed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug)]
pub struct FakeChannel {
    id: usize,
    open: AtomicBool,
    state: Arc<FakeState>,
}

impl FakeChannel {
    /// Unique per channel; lets tests tell reuse from recreation.
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait::async_trait]
impl TransportChannel for FakeChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        self.state
            .declared_queues
            .lock()
            .unwrap()
            .push((name.to_owned(), *options));
        Ok(QueueInfo {
            name: name.to_owned(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn assert_exchange(
        &self,
        _name: &str,
        _kind: &ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo, TransportError> {
        Ok(QueueInfo {
            name: name.to_owned(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        self.state.published.lock().unwrap().push(PublishedMessage {
            queue: queue.to_owned(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.state.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.state
            .rejects
            .lock()
            .unwrap()
            .push((delivery_tag, requeue));
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
    ) -> Result<BoxStream<'static, Delivery>, TransportError> {
        let deliveries = std::mem::take(&mut *self.state.deliveries.lock().unwrap());
        Ok(futures_util::stream::iter(deliveries).boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.state.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Poll `predicate` until it holds, advancing the (paused) clock.
pub async fn wait_until<F, Fut>(predicate: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1_000 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

//! The connection lifecycle manager.
//!
//! [`ConnectionManager`] owns at most one live transport connection, hands
//! out channels over it (fresh, cached-default or pooled), and hides
//! reconnection behind [`ensure_connection`](ConnectionManager::ensure_connection)
//! and [`revive`](ConnectionManager::revive).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::amqp::configuration::{BrokerSettings, RetrySettings};
use crate::amqp::ConnectionFactory;
use crate::pool::{ChannelManager, ChannelPool, PoolConfig, PooledChannelGuard};
use crate::transport::{
    ChannelOf, ConnectionEvent, ExchangeSpec, MessageProperties, QueueInfo, QueueSpec, Transport,
    TransportChannel, TransportConnection, TransportError,
};

/// Failure of a connection-manager operation.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// The manager was explicitly closed; call
    /// [`connect`](ConnectionManager::connect) to re-open it.
    #[error("the connection manager is closed")]
    Closed,
    /// The transport refused the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Channel pool failure.
    #[error(transparent)]
    Pool(#[from] crate::pool::Error),
    /// The payload could not be serialized for publishing.
    #[error("failed to serialize message payload")]
    Payload(#[source] serde_json::Error),
}

/// Per-attempt callback invoked by [`ConnectionManager::ensure_connection`]
/// between failed attempts, receiving the error and the computed sleep
/// interval.
pub type RetryCallback = Arc<dyn Fn(&BrokerError, Duration) + Send + Sync>;

/// Backoff policy for [`ConnectionManager::ensure_connection`].
///
/// The sleep interval starts at `interval_start` and grows by
/// `interval_steps` after every failed attempt.
#[derive(Clone)]
pub struct RetryOptions {
    /// Maximum number of connection attempts; the last error is re-raised
    /// once exceeded. Retries indefinitely when `None`.
    pub max_retries: Option<u32>,
    pub interval_start: Duration,
    pub interval_steps: Duration,
    /// Observability hook; a `debug!` log is emitted when unset.
    pub on_retry: Option<RetryCallback>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryOptions {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            interval_start: Duration::from_secs(settings.interval_start_seconds),
            interval_steps: Duration::from_secs(settings.interval_steps_seconds),
            on_retry: None,
        }
    }
}

impl RetryOptions {
    #[must_use]
    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = Some(value);
        self
    }

    #[must_use]
    pub fn interval_start(mut self, value: Duration) -> Self {
        self.interval_start = value;
        self
    }

    #[must_use]
    pub fn interval_steps(mut self, value: Duration) -> Self {
        self.interval_steps = value;
        self
    }

    /// Invoke `callback` with the error and the computed interval before
    /// every sleep.
    #[must_use]
    pub fn on_retry(mut self, callback: impl Fn(&BrokerError, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }
}

struct Inner<T: Transport> {
    connection: Option<Arc<T::Connection>>,
    default_channel: Option<Arc<ChannelOf<T>>>,
    pool: Option<ChannelPool<T>>,
    /// Sticky: set by `close()`, cleared by `connect()`. A lost transport
    /// connection does not set it.
    closed: bool,
    /// The broker raised a resource alarm and stopped accepting publishes.
    blocked: bool,
    /// Bumped on every establishment so a stale event watcher cannot
    /// invalidate a newer connection.
    generation: u64,
    watcher: Option<JoinHandle<()>>,
}

struct Core<T: Transport> {
    transport: T,
    uri: String,
    settings: BrokerSettings,
    pool_config: PoolConfig,
    inner: Mutex<Inner<T>>,
}

/// Manages one logical connection to a broker.
///
/// Cheap to clone; clones share the same underlying connection, default
/// channel and pool. The transport is an explicit dependency: production
/// code uses the lapin-backed [`ConnectionFactory`], tests inject a fake.
///
/// The manager starts dormant: nothing touches the network until
/// [`connect`](ConnectionManager::connect) or any operation that needs a
/// channel is first invoked.
pub struct ConnectionManager<T: Transport = ConnectionFactory> {
    core: Arc<Core<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl ConnectionManager<ConnectionFactory> {
    /// Build a manager talking AMQP to the broker described by `settings`.
    pub fn new_from_config(settings: BrokerSettings) -> Result<Self, anyhow::Error> {
        let transport = ConnectionFactory::new_from_config(&settings)?;
        Ok(Self::with_transport(transport, settings))
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Build a manager over an injected transport.
    pub fn with_transport(transport: T, settings: BrokerSettings) -> Self {
        Self::with_pool_config(transport, settings, PoolConfig::default())
    }

    /// Build a manager with explicit channel-pool sizing.
    pub fn with_pool_config(transport: T, settings: BrokerSettings, pool_config: PoolConfig) -> Self {
        let uri = settings.broker_uri();
        Self {
            core: Arc::new(Core {
                transport,
                uri,
                settings,
                pool_config,
                inner: Mutex::new(Inner {
                    connection: None,
                    default_channel: None,
                    pool: None,
                    closed: false,
                    blocked: false,
                    generation: 0,
                    watcher: None,
                }),
            }),
        }
    }

    /// The settings this manager was built with.
    pub fn settings(&self) -> &BrokerSettings {
        &self.core.settings
    }

    /// Establish a connection to the broker immediately.
    ///
    /// Idempotent: an already-live connection is returned as-is, and
    /// concurrent callers coalesce on a single establishment. Clears the
    /// closed flag set by [`close`](ConnectionManager::close).
    pub async fn connect(&self) -> Result<Arc<T::Connection>, BrokerError> {
        let mut inner = self.core.inner.lock().await;
        inner.closed = false;
        self.connection_locked(&mut inner).await
    }

    /// Whether a live connection handle is held and the manager has not
    /// been explicitly closed. No side effects, no I/O.
    pub async fn is_connected(&self) -> bool {
        let inner = self.core.inner.lock().await;
        !inner.closed && inner.connection.is_some()
    }

    /// Whether the broker currently refuses publishes (resource alarm).
    pub async fn is_blocked(&self) -> bool {
        self.core.inner.lock().await.blocked
    }

    /// The current connection, establishing one first if needed.
    ///
    /// Returns `None` without any transport I/O if the manager was
    /// explicitly closed - closing is sticky until
    /// [`connect`](ConnectionManager::connect) is called again.
    pub async fn get_connection(&self) -> Result<Option<Arc<T::Connection>>, BrokerError> {
        let mut inner = self.core.inner.lock().await;
        if inner.closed {
            return Ok(None);
        }
        self.connection_locked(&mut inner).await.map(Some)
    }

    /// The default channel, created on first access and reused until the
    /// connection is closed or lost.
    ///
    /// The cached channel is invalidated the moment the connection is torn
    /// down; the next call transparently re-establishes and recreates it.
    /// Do not cache the returned handle across reconnects - always come
    /// back through this method.
    pub async fn get_default_channel(&self) -> Result<Arc<ChannelOf<T>>, BrokerError> {
        let mut inner = self.core.inner.lock().await;
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        let connection = self.connection_locked(&mut inner).await?;
        match &inner.default_channel {
            Some(channel) => Ok(Arc::clone(channel)),
            None => {
                let channel = Arc::new(connection.create_channel().await?);
                inner.default_channel = Some(Arc::clone(&channel));
                Ok(channel)
            }
        }
    }

    /// Create a fresh channel bound to this manager's connection.
    ///
    /// Never consults the pool; see
    /// [`use_channel`](ConnectionManager::use_channel) for pooled
    /// acquisition.
    pub async fn channel(&self) -> Result<ChannelOf<T>, BrokerError> {
        let connection = {
            let mut inner = self.core.inner.lock().await;
            if inner.closed {
                return Err(BrokerError::Closed);
            }
            self.connection_locked(&mut inner).await?
        };
        Ok(connection.create_channel().await?)
    }

    /// Acquire a pooled channel, run `operation` with it, and release the
    /// channel back to the pool on every exit path.
    ///
    /// The guard passed to `operation` derefs to the channel and returns it
    /// to the pool when dropped, whether `operation` succeeds or fails.
    pub async fn use_channel<R, F, Fut>(&self, operation: F) -> Result<R, BrokerError>
    where
        F: FnOnce(PooledChannelGuard<T>) -> Fut,
        Fut: Future<Output = Result<R, BrokerError>>,
    {
        let pool = self.channel_pool().await?;
        let channel = pool.acquire().await?;
        operation(channel).await
    }

    /// Declare an exchange on a pooled channel.
    pub async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        debug!("declare exchange {:?}", exchange.name);
        let ExchangeSpec {
            name,
            kind,
            options,
        } = exchange.clone();
        self.use_channel(move |channel| async move {
            channel
                .assert_exchange(&name, &kind, &options)
                .await
                .map_err(Into::into)
        })
        .await
    }

    /// Declare a queue on a pooled channel.
    ///
    /// Without explicit options the queue is exclusive, auto-deleted and
    /// non-durable.
    pub async fn declare_queue(&self, queue: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        let name = queue.name.clone();
        let options = queue.options.unwrap_or_default();
        self.use_channel(move |channel| async move {
            let declared = channel.assert_queue(&name, &options).await?;
            debug!("declared queue {:?}", declared.name);
            Ok(declared)
        })
        .await
    }

    /// Check that a queue exists, without modifying it.
    pub async fn check_queue(&self, queue_name: &str) -> Result<QueueInfo, BrokerError> {
        let name = queue_name.to_owned();
        self.use_channel(move |channel| async move {
            channel.check_queue(&name).await.map_err(Into::into)
        })
        .await
    }

    /// Serialize `payload` as JSON and publish it to `queue` on a pooled
    /// channel.
    ///
    /// Without explicit properties the message is published persistent with
    /// a generated v4 UUID as correlation id.
    pub async fn publish_to_queue<P: Serialize + ?Sized>(
        &self,
        queue: &QueueSpec,
        payload: &P,
        properties: Option<MessageProperties>,
    ) -> Result<(), BrokerError> {
        let properties = properties.unwrap_or_else(|| {
            MessageProperties::default()
                .with_delivery_mode(2)
                .with_correlation_id(Uuid::new_v4().to_string())
        });
        let bytes = serde_json::to_vec(payload).map_err(BrokerError::Payload)?;
        let name = queue.name.clone();
        self.use_channel(move |channel| async move {
            channel
                .send_to_queue(&name, &bytes, &properties)
                .await
                .map_err(Into::into)
        })
        .await
    }

    /// Close the connection and mark the manager closed.
    ///
    /// Sticky: subsequent operations fail (or return empty) until
    /// [`connect`](ConnectionManager::connect) is called again. Safe to
    /// call when already closed.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let connection = {
            let mut inner = self.core.inner.lock().await;
            inner.closed = true;
            inner.blocked = false;
            inner.default_channel = None;
            if let Some(watcher) = inner.watcher.take() {
                watcher.abort();
            }
            if let Some(pool) = inner.pool.take() {
                pool.close();
            }
            inner.connection.take()
        };
        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }

    /// Ensure a connection exists, retrying establishment under the given
    /// backoff policy.
    ///
    /// Attempts `connect()`; on failure sleeps for the current interval,
    /// invokes the `on_retry` callback (or logs), grows the interval by
    /// `interval_steps`, and tries again. Gives up after `max_retries`
    /// attempts, re-raising the last error.
    pub async fn ensure_connection(
        &self,
        options: &RetryOptions,
    ) -> Result<Arc<T::Connection>, BrokerError> {
        let mut interval = options.interval_start;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(connection) => return Ok(connection),
                Err(error) => {
                    if let Some(max_retries) = options.max_retries {
                        if attempt >= max_retries {
                            return Err(error);
                        }
                    }
                    match &options.on_retry {
                        Some(callback) => callback(&error, interval),
                        None => {
                            debug!("connection attempt failed: {error}. Retry in {interval:?}")
                        }
                    }
                    tokio::time::sleep(interval).await;
                    interval += options.interval_steps;
                }
            }
        }
    }

    /// Revive the manager after the connection was lost: drop every stale
    /// handle, re-establish under the retry policy, re-arm the event
    /// watcher and recreate the default channel.
    ///
    /// Returns the fresh default channel. Consumers re-subscribe on their
    /// own once their delivery stream ends.
    pub async fn revive(&self, options: &RetryOptions) -> Result<Arc<ChannelOf<T>>, BrokerError> {
        {
            let mut inner = self.core.inner.lock().await;
            inner.default_channel = None;
            inner.connection = None;
            inner.closed = false;
            inner.blocked = false;
            if let Some(watcher) = inner.watcher.take() {
                watcher.abort();
            }
        }
        self.ensure_connection(options).await?;
        self.get_default_channel().await
    }

    /// The retry policy from this manager's settings, or the built-in
    /// defaults.
    pub fn retry_options(&self) -> RetryOptions {
        self.core
            .settings
            .retry
            .clone()
            .unwrap_or_default()
            .into()
    }

    async fn channel_pool(&self) -> Result<ChannelPool<T>, BrokerError> {
        let (pool, warm_up) = {
            let mut inner = self.core.inner.lock().await;
            if inner.closed {
                return Err(BrokerError::Closed);
            }
            // The pool comes up lazily, on first channel demand after a
            // connection is established.
            self.connection_locked(&mut inner).await?;
            match &inner.pool {
                Some(pool) => (pool.clone(), false),
                None => {
                    let manager =
                        ChannelManager::new(self.clone(), self.core.pool_config.idle_timeout);
                    let pool = ChannelPool::new(manager, &self.core.pool_config)?;
                    inner.pool = Some(pool.clone());
                    (pool, true)
                }
            }
        };
        if warm_up {
            pool.warm_up(self.core.pool_config.min_size).await?;
        }
        Ok(pool)
    }

    /// Establish (or return) the live connection. Callers hold the inner
    /// lock, which is what makes concurrent establishment coalesce.
    async fn connection_locked(
        &self,
        inner: &mut Inner<T>,
    ) -> Result<Arc<T::Connection>, BrokerError> {
        if let Some(connection) = &inner.connection {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            // The watcher has not caught up yet; treat the handle as gone.
        }
        inner.connection = None;
        inner.default_channel = None;
        debug!("establishing connection");
        let connection = Arc::new(self.core.transport.connect(&self.core.uri).await?);
        inner.generation += 1;
        self.spawn_watcher(inner, &connection);
        inner.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Drain the connection's event broadcast in the background; on loss of
    /// connectivity invalidate the cached connection and default channel so
    /// `is_connected()` reports false and the next `get_connection()`
    /// re-establishes.
    fn spawn_watcher(&self, inner: &mut Inner<T>, connection: &Arc<T::Connection>) {
        if let Some(previous) = inner.watcher.take() {
            previous.abort();
        }
        let mut events = connection.subscribe_events();
        let generation = inner.generation;
        let core = Arc::downgrade(&self.core);
        inner.watcher = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(core) = core.upgrade() else { break };
                let mut inner = core.inner.lock().await;
                if inner.generation != generation {
                    // A newer connection took over; this watcher is stale.
                    break;
                }
                match event {
                    ConnectionEvent::Error(reason) => {
                        warn!("connection failed: {reason}");
                        inner.connection = None;
                        inner.default_channel = None;
                        inner.blocked = false;
                        break;
                    }
                    ConnectionEvent::Closed => {
                        debug!("connection closed");
                        inner.connection = None;
                        inner.default_channel = None;
                        inner.blocked = false;
                        break;
                    }
                    ConnectionEvent::Blocked(reason) => {
                        warn!("connection blocked by the broker: {reason}");
                        inner.blocked = true;
                    }
                    ConnectionEvent::Unblocked => {
                        debug!("connection unblocked");
                        inner.blocked = false;
                    }
                }
            }
        }));
    }
}

use crate::amqp::configuration::BrokerSettings;
use crate::amqp::AmqpChannel;
use crate::transport::{ConnectionEvent, Transport, TransportConnection, TransportError};
use anyhow::Context;
use lapin::{
    options::ConfirmSelectOptions,
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// The lapin-backed [`Transport`] implementation.
///
/// Holds everything required to open physical connections to a broker,
/// except the uri itself - that is supplied per [`connect`](Transport::connect)
/// call by the connection manager.
pub struct ConnectionFactory {
    /// The timeout observed when trying to connect to the broker.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to the broker.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
    /// Whether channels created over factory connections ask the broker for
    /// publisher confirmations.
    publisher_confirms: bool,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: Option<String>,
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self {
            connection_timeout: std::time::Duration::from_secs(10),
            tls: None,
            publisher_confirms: true,
        }
    }
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// It allows you to customize the TLS configuration.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted
    /// to 10 seconds.
    pub fn new_from_config(settings: &BrokerSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }

                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for the broker.")?;
                Ok(Tls {
                    domain_name: tls_settings.domain.clone(),
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            connection_timeout,
            tls: tls.map(Arc::new),
            publisher_confirms: true,
        })
    }

    /// Disable publisher confirmations on channels created over this
    /// factory's connections. They are enabled by default.
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.publisher_confirms = false;
        self
    }

    /// Replaces the TLS Connector for the connection factory
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name: None,
        }));
    }

    /// Replaces the TLS Connector for the connection factory, along with the
    /// expected domain name for the certificate
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name: Some(domain_name),
        }));
    }

    /// Establish a new unencrypted connection to the broker.
    async fn connect_without_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(uri, properties).await
    }

    /// Establish a new TLS connection to the broker.
    async fn connect_with_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        let domain_name = tls_configuration
            .domain_name
            .clone()
            .unwrap_or_else(|| uri.authority.host.clone());
        lapin::Connection::connector(
            uri,
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(&tls_configuration.connector, &domain_name)
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = AmqpConnection;

    /// Create a new connection to the broker.
    ///
    /// It establishes an encrypted connection if the factory carries a TLS
    /// configuration, an unencrypted one otherwise.
    #[tracing::instrument(name = "broker_connect", skip_all)]
    async fn connect(&self, uri: &str) -> Result<AmqpConnection, TransportError> {
        let uri: AMQPUri = uri
            .parse()
            .map_err(|e: String| TransportError::msg(format!("invalid broker uri: {e}")))?;
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(uri, properties).await,
                Some(tls) => self.connect_with_tls(uri, properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| TransportError::msg("timed out while connecting to the broker"))?
        .map_err(|e| TransportError::from(anyhow::Error::from(e)))?;
        Ok(AmqpConnection::new(connection, self.publisher_confirms))
    }
}

/// A live lapin connection, with its lifecycle surfaced as
/// [`ConnectionEvent`]s on a broadcast channel.
pub struct AmqpConnection {
    inner: lapin::Connection,
    events: broadcast::Sender<ConnectionEvent>,
    publisher_confirms: bool,
}

impl AmqpConnection {
    fn new(inner: lapin::Connection, publisher_confirms: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        let tx = events.clone();
        // Lapin reports any connection loss (including broker-initiated
        // closes) through the error callback.
        inner.on_error(move |error| {
            warn!("broker connection failure: {error:?}");
            let _ = tx.send(ConnectionEvent::Error(error.to_string()));
        });
        Self {
            inner,
            events,
            publisher_confirms,
        }
    }

    /// The underlying lapin connection, for operations outside the narrow
    /// transport interface.
    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl TransportConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn create_channel(&self) -> Result<AmqpChannel, TransportError> {
        let channel = self.inner.create_channel().await?;
        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(AmqpChannel::new(channel))
    }

    async fn close(&self) -> Result<(), TransportError> {
        // 200 = reply-success
        self.inner.close(200, "client shutdown").await?;
        let _ = self.events.send(ConnectionEvent::Closed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

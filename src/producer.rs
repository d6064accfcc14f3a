//! A convenience role for publishing messages.

use serde::Serialize;
use uuid::Uuid;

use crate::amqp::ConnectionFactory;
use crate::connection::{BrokerError, ConnectionManager};
use crate::transport::{MessageProperties, QueueSpec, Transport};

/// Publishes serialized payloads to queues through a
/// [`ConnectionManager`], filling in the default publish properties:
/// persistent delivery, a generated v4 UUID correlation id and this
/// producer's reply queue (when configured).
pub struct Producer<T: Transport = ConnectionFactory> {
    manager: ConnectionManager<T>,
    /// Queue the consumer should send results to, stamped as `reply_to` on
    /// every published message.
    reply_queue: Option<String>,
}

impl<T: Transport> Producer<T> {
    pub fn new(manager: ConnectionManager<T>) -> Self {
        Self {
            manager,
            reply_queue: None,
        }
    }

    /// Stamp `queue` as the `reply_to` address on published messages.
    #[must_use]
    pub fn with_reply_queue(mut self, queue: impl Into<String>) -> Self {
        self.reply_queue = Some(queue.into());
        self
    }

    /// Publish `payload` to `queue` with this producer's default
    /// properties.
    pub async fn publish<P: Serialize + ?Sized>(
        &self,
        queue: &QueueSpec,
        payload: &P,
    ) -> Result<(), BrokerError> {
        self.publish_with_properties(queue, payload, self.default_properties())
            .await
    }

    /// Publish `payload` to `queue` with explicit properties.
    pub async fn publish_with_properties<P: Serialize + ?Sized>(
        &self,
        queue: &QueueSpec,
        payload: &P,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.manager
            .publish_to_queue(queue, payload, Some(properties))
            .await
    }

    fn default_properties(&self) -> MessageProperties {
        let mut properties = MessageProperties::default()
            .with_delivery_mode(2)
            .with_correlation_id(Uuid::new_v4().to_string());
        if let Some(reply_queue) = &self.reply_queue {
            properties = properties.with_reply_to(reply_queue.clone());
        }
        properties
    }
}

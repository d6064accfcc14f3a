//! A convenience role for receiving messages.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::amqp::ConnectionFactory;
use crate::connection::{BrokerError, ConnectionManager};
use crate::message::Message;
use crate::transport::{ChannelOf, Delivery, QueueSpec, Transport, TransportChannel};

/// Consumes messages from one queue over a dedicated channel.
///
/// After a reconnection ([`revive`](ConnectionManager::revive)) the old
/// subscription's stream ends; call [`subscribe`](Consumer::subscribe)
/// again to resume on a fresh channel.
pub struct Consumer<T: Transport = ConnectionFactory> {
    manager: ConnectionManager<T>,
    queue: QueueSpec,
    consumer_tag: String,
}

impl<T: Transport> Consumer<T> {
    pub fn new(manager: ConnectionManager<T>, queue: QueueSpec) -> Self {
        let consumer_tag = format!("warren-{}", Uuid::new_v4());
        Self {
            manager,
            queue,
            consumer_tag,
        }
    }

    /// The tag this consumer registers with at the broker.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Declare the queue and start consuming from it on a fresh channel.
    pub async fn subscribe(&self) -> Result<Subscription<T>, BrokerError> {
        let channel = Arc::new(self.manager.channel().await?);
        let options = self.queue.options.unwrap_or_default();
        channel.assert_queue(&self.queue.name, &options).await?;
        let deliveries = channel.consume(&self.queue.name, &self.consumer_tag).await?;
        Ok(Subscription {
            channel,
            deliveries,
        })
    }
}

/// A live subscription: a stream of [`Message`]s plus the channel they
/// arrived on, needed to settle them.
pub struct Subscription<T: Transport> {
    channel: Arc<ChannelOf<T>>,
    deliveries: BoxStream<'static, Delivery>,
}

impl<T: Transport> Subscription<T> {
    /// The next message, or `None` once the channel (or its connection)
    /// has died and the subscription must be re-created.
    pub async fn next(&mut self) -> Option<Message> {
        self.deliveries.next().await.map(Message::from_delivery)
    }

    /// The channel deliveries arrive on; pass it to
    /// [`Message::ack`]/[`Message::reject`]/[`Message::requeue`].
    pub fn channel(&self) -> &ChannelOf<T> {
        &self.channel
    }
}

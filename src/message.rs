//! Inbound messages and their one-shot acknowledgment state machine.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::transport::{Delivery, MessageProperties, TransportChannel, TransportError};

/// The acknowledgment state of a received message.
///
/// A message starts in [`Received`](AckState::Received) and moves into
/// exactly one of the three terminal states. No transition is legal once a
/// terminal state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Received,
    Acked,
    Rejected,
    Requeued,
}

impl AckState {
    /// Whether the message has been settled with the broker.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckState::Received)
    }
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckState::Received => write!(f, "RECEIVED"),
            AckState::Acked => write!(f, "ACK"),
            AckState::Rejected => write!(f, "REJECTED"),
            AckState::Requeued => write!(f, "REQUEUED"),
        }
    }
}

/// A second terminal operation was attempted on an already-settled message.
#[derive(thiserror::Error, Debug)]
#[error("cannot {attempted} message: already acknowledged with state {state}")]
pub struct MessageStateError {
    /// The terminal state the message is already in.
    pub state: AckState,
    /// The operation that was refused.
    pub attempted: &'static str,
}

/// Failure of an ack/reject/requeue operation.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The message was already settled; the transport was not invoked.
    #[error(transparent)]
    State(#[from] MessageStateError),
    /// The transport refused the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The payload could not be decoded from its wire representation.
#[derive(thiserror::Error, Debug)]
#[error("failed to decode message payload")]
pub struct PayloadError(#[from] serde_json::Error);

/// Routing metadata of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// The exchange the message came through. Empty for the default exchange.
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// One received message.
///
/// Wraps a raw transport [`Delivery`] and tracks its own acknowledgment
/// state. The message does not own the channel it arrived on; ack/reject/
/// requeue delegate to whichever channel the caller passes in, keyed by the
/// delivery tag.
///
/// Exactly one of [`ack`](Message::ack), [`reject`](Message::reject) and
/// [`requeue`](Message::requeue) may ever complete for a given message;
/// any later terminal operation fails with a [`MessageStateError`] without
/// touching the transport.
#[derive(Debug)]
pub struct Message {
    /// The payload, in wire format.
    pub body: Vec<u8>,
    /// Headers attached to the message.
    pub headers: HashMap<String, Value>,
    /// The full property set the message was delivered with.
    pub properties: MessageProperties,
    /// Broker-assigned identifier used to ack/reject this delivery.
    pub delivery_tag: u64,
    /// Routing metadata.
    pub delivery_info: DeliveryInfo,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    state: AckState,
}

impl Message {
    /// Wrap a raw delivery handed over by the transport.
    pub fn from_delivery(delivery: Delivery) -> Self {
        let Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
        } = delivery;
        Self {
            body: data,
            headers: properties.headers.clone(),
            correlation_id: properties.correlation_id.clone(),
            reply_to: properties.reply_to.clone(),
            expiration: properties.expiration.clone(),
            properties,
            delivery_tag,
            delivery_info: DeliveryInfo {
                exchange,
                routing_key,
                redelivered,
            },
            state: AckState::Received,
        }
    }

    /// The current acknowledgment state.
    pub fn state(&self) -> AckState {
        self.state
    }

    /// Whether the message has been acked, rejected or requeued.
    pub fn is_acknowledged(&self) -> bool {
        self.state.is_terminal()
    }

    fn settle(&mut self, next: AckState, attempted: &'static str) -> Result<(), MessageStateError> {
        if self.state.is_terminal() {
            return Err(MessageStateError {
                state: self.state,
                attempted,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Acknowledge this message as processed, removing it from the queue.
    pub async fn ack<C: TransportChannel>(&mut self, channel: &C) -> Result<(), AckError> {
        self.settle(AckState::Acked, "ack")?;
        channel.ack(self.delivery_tag).await?;
        Ok(())
    }

    /// Reject this message. With `requeue` set the broker puts it back on
    /// the queue, otherwise it is discarded (or dead-lettered).
    pub async fn reject<C: TransportChannel>(
        &mut self,
        channel: &C,
        requeue: bool,
    ) -> Result<(), AckError> {
        self.settle(AckState::Rejected, "reject")?;
        channel.reject(self.delivery_tag, requeue).await?;
        Ok(())
    }

    /// Reject this message and put it back on the queue.
    ///
    /// Must not be used as a means of selecting which messages to process.
    pub async fn requeue<C: TransportChannel>(&mut self, channel: &C) -> Result<(), AckError> {
        self.settle(AckState::Requeued, "requeue")?;
        channel.reject(self.delivery_tag, true).await?;
        Ok(())
    }

    /// Decode the body from its wire representation.
    ///
    /// Pure and repeatable; does not depend on the acknowledgment state.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, PayloadError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The wire-ready byte representation of the body, for republishing.
    pub fn encode(&self) -> Vec<u8> {
        self.body.clone()
    }

    /// A property bag suitable for republishing this message elsewhere,
    /// e.g. in reply/forward patterns.
    pub fn publish_options(&self) -> MessageProperties {
        MessageProperties {
            headers: self.headers.clone(),
            correlation_id: self.correlation_id.clone(),
            delivery_mode: self.properties.delivery_mode,
            expiration: self.expiration.clone(),
            reply_to: self.reply_to.clone(),
            ..MessageProperties::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fake::{Fake, Faker};
    use futures_util::stream::BoxStream;
    use serde_json::json;

    use super::*;
    use crate::transport::{
        ExchangeKind, ExchangeOptions, QueueInfo, QueueOptions, TransportChannel, TransportError,
    };

    /// Counts ack/reject invocations; every other operation is unreachable
    /// in these tests.
    #[derive(Default)]
    struct CountingChannel {
        acks: AtomicUsize,
        rejects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TransportChannel for CountingChannel {
        async fn assert_queue(
            &self,
            _name: &str,
            _options: &QueueOptions,
        ) -> Result<QueueInfo, TransportError> {
            unreachable!()
        }

        async fn assert_exchange(
            &self,
            _name: &str,
            _kind: &ExchangeKind,
            _options: &ExchangeOptions,
        ) -> Result<(), TransportError> {
            unreachable!()
        }

        async fn check_queue(&self, _name: &str) -> Result<QueueInfo, TransportError> {
            unreachable!()
        }

        async fn send_to_queue(
            &self,
            _queue: &str,
            _payload: &[u8],
            _properties: &MessageProperties,
        ) -> Result<(), TransportError> {
            unreachable!()
        }

        async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn consume(
            &self,
            _queue: &str,
            _consumer_tag: &str,
        ) -> Result<BoxStream<'static, Delivery>, TransportError> {
            unreachable!()
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn delivery(body: &str, correlation_id: Option<&str>) -> Delivery {
        Delivery {
            delivery_tag: (1..10_000u64).fake(),
            exchange: String::new(),
            routing_key: Faker.fake(),
            redelivered: false,
            properties: MessageProperties {
                correlation_id: correlation_id.map(Into::into),
                ..MessageProperties::default()
            },
            data: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn ack_then_reject_fails_without_touching_the_transport() {
        let channel = CountingChannel::default();
        let mut message = Message::from_delivery(delivery(r#"{"x":1}"#, Some("abc")));

        let payload: serde_json::Value = message.payload().unwrap();
        assert_eq!(payload, json!({"x": 1}));
        assert_eq!(message.correlation_id.as_deref(), Some("abc"));

        message.ack(&channel).await.unwrap();
        assert_eq!(message.state(), AckState::Acked);

        let err = message.reject(&channel, false).await.unwrap_err();
        assert!(matches!(err, AckError::State(_)));
        assert_eq!(channel.acks.load(Ordering::SeqCst), 1);
        assert_eq!(channel.rejects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn requeue_after_ack_fails_before_any_transport_call() {
        let channel = CountingChannel::default();
        let mut message = Message::from_delivery(delivery("{}", None));

        message.ack(&channel).await.unwrap();
        assert!(message.is_acknowledged());

        let err = message.requeue(&channel).await.unwrap_err();
        assert!(matches!(
            err,
            AckError::State(MessageStateError {
                state: AckState::Acked,
                attempted: "requeue",
            })
        ));
        assert_eq!(channel.rejects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn requeue_is_a_reject_with_requeue() {
        let channel = CountingChannel::default();
        let mut message = Message::from_delivery(delivery("{}", None));

        message.requeue(&channel).await.unwrap();
        assert_eq!(message.state(), AckState::Requeued);
        assert_eq!(channel.rejects.load(Ordering::SeqCst), 1);

        // A follow-up ack is a state conflict, not a silent success.
        let err = message.ack(&channel).await.unwrap_err();
        assert!(matches!(err, AckError::State(_)));
        assert_eq!(channel.acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn payload_is_repeatable_after_settlement() {
        let channel = CountingChannel::default();
        let mut message = Message::from_delivery(delivery(r#"{"n":42}"#, None));

        message.ack(&channel).await.unwrap();

        #[derive(serde::Deserialize)]
        struct Body {
            n: u32,
        }
        let first: Body = message.payload().unwrap();
        let second: Body = message.payload().unwrap();
        assert_eq!(first.n, 42);
        assert_eq!(second.n, 42);
    }

    #[test]
    fn publish_options_carry_reply_metadata() {
        let raw = Delivery {
            properties: MessageProperties::default()
                .with_correlation_id("abc")
                .with_reply_to("result.queue")
                .with_delivery_mode(2)
                .with_header("origin", json!("warren")),
            ..delivery("{}", None)
        };
        let message = Message::from_delivery(raw);

        let options = message.publish_options();
        assert_eq!(options.correlation_id.as_deref(), Some("abc"));
        assert_eq!(options.reply_to.as_deref(), Some("result.queue"));
        assert_eq!(options.delivery_mode, Some(2));
        assert_eq!(options.header_str("origin"), Some("warren"));
    }
}

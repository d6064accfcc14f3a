//! [`TransportChannel`] backed by a [`lapin::Channel`], plus the bridging
//! between the plain property/header types and lapin's AMQP types.

use std::collections::HashMap;

use amq_protocol_types::{AMQPValue, FieldArray, FieldTable, ShortString};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, ChannelState};
use serde_json::Value;
use tracing::warn;

use crate::transport::{
    Delivery, ExchangeKind, ExchangeOptions, MessageProperties, QueueInfo, QueueOptions,
    TransportChannel, TransportError,
};

/// A logical broker session backed by one [`lapin::Channel`].
pub struct AmqpChannel {
    inner: lapin::Channel,
}

impl AmqpChannel {
    pub(crate) fn new(inner: lapin::Channel) -> Self {
        Self { inner }
    }

    /// The underlying lapin channel, for operations outside the narrow
    /// transport interface.
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }

    async fn declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueInfo, TransportError> {
        let queue = self
            .inner
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }
}

#[async_trait::async_trait]
impl TransportChannel for AmqpChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        self.declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                nowait: false,
            },
        )
        .await
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(
                name,
                exchange_kind_to_lapin(kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo, TransportError> {
        // Passive declare: fails if the queue does not exist, never creates.
        self.declare(
            name,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
        )
        .await
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        let confirm = self
            .inner
            .basic_publish(
                // Default exchange: routes directly to the queue named by the
                // routing key.
                "",
                queue,
                BasicPublishOptions {
                    mandatory: false,
                    // The immediate flag was dropped in RabbitMQ 3.0; setting
                    // it causes a not-supported error.
                    immediate: false,
                },
                payload,
                properties_to_amqp(properties),
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(ack) => {
                if let Some(return_message) = ack {
                    // Reply Code 312 - NO_ROUTE
                    // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                    if return_message.reply_code == 312 {
                        return Err(TransportError::msg(format!(
                            "message could not be routed: {return_message:?}"
                        )));
                    }
                }
                Ok(())
            }
            Confirmation::Nack(nack) => Err(TransportError::msg(format!(
                "broker nacked the publish: {nack:?}"
            ))),
            Confirmation::NotRequested => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Delivery>, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        // The lapin stream ends by itself when the channel or connection
        // dies; stray errors are logged and skipped.
        let stream = consumer
            .filter_map(|delivery| async move {
                match delivery {
                    Ok(delivery) => Some(Delivery::from(delivery)),
                    Err(error) => {
                        warn!("dropping errored delivery: {error:?}");
                        None
                    }
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // 200 = reply-success
        self.inner.close(200, "client shutdown").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        matches!(self.inner.status().state(), ChannelState::Connected)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange.as_str().to_owned(),
            routing_key: value.routing_key.as_str().to_owned(),
            redelivered: value.redelivered,
            properties: amqp_to_properties(&value.properties),
            data: value.data,
        }
    }
}

fn exchange_kind_to_lapin(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
    }
}

pub(crate) fn properties_to_amqp(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(value) = &properties.content_type {
        amqp = amqp.with_content_type(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.expiration {
        amqp = amqp.with_expiration(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.message_id {
        amqp = amqp.with_message_id(ShortString::from(value.clone()));
    }
    if let Some(value) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(value);
    }
    if let Some(value) = properties.timestamp {
        amqp = amqp.with_timestamp(value);
    }
    if !properties.headers.is_empty() {
        amqp = amqp.with_headers(headers_to_field_table(&properties.headers));
    }
    amqp
}

pub(crate) fn amqp_to_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_owned()),
        expiration: properties
            .expiration()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        delivery_mode: *properties.delivery_mode(),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        timestamp: *properties.timestamp(),
        headers: properties
            .headers()
            .as_ref()
            .map(field_table_to_headers)
            .unwrap_or_default(),
    }
}

fn headers_to_field_table(headers: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), json_to_amqp_value(value));
    }
    table
}

fn field_table_to_headers(table: &FieldTable) -> HashMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), amqp_value_to_json(value)))
        .collect()
}

fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else if let Some(u) = n.as_u64() {
                AMQPValue::Timestamp(u)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(s.as_bytes().into()),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp_value(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.as_str().into(), json_to_amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Float(n) => serde_json::Number::from_f64(f64::from(*n))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::Double(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::DecimalValue(decimal) => {
            let scaled = f64::from(decimal.value) / 10f64.powi(i32::from(decimal.scale));
            serde_json::Number::from_f64(scaled)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_owned(), amqp_value_to_json(value)))
                .collect(),
        ),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().map(|b| Value::from(*b)).collect())
        }
        AMQPValue::Void => Value::Null,
    }
}

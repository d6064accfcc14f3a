//! `warren` is a connection-management layer, built on top of [`lapin`],
//! to make it easy and ergonomic to work with AMQP brokers.
//!
//! [`ConnectionManager`](crate::connection::ConnectionManager) and
//! [`Message`](crate::message::Message) are the best starting points to
//! learn more about what `warren` provides and how to leverage it: the
//! former owns the transport connection, channel pool and reconnection
//! policy; the latter tracks the one-shot acknowledgment state of every
//! received message.

pub mod connection;
pub mod consumer;
pub mod message;
pub mod producer;

pub mod amqp;
pub mod pool;
pub mod transport;

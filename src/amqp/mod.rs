//! The lapin-backed production transport.
//!
//! [`ConnectionFactory`] implements [`Transport`](crate::transport::Transport)
//! over a real AMQP broker; everything else in the crate only ever sees the
//! narrow transport traits.

pub mod configuration;

mod channel;
mod factory;

pub use channel::AmqpChannel;
pub use factory::{AmqpConnection, ConnectionFactory};

pub use lapin::{options, types, BasicProperties};

use crate::transport::TransportError;

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self::from(anyhow::Error::from(err))
    }
}

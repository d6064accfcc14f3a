//! Provides pooling for transport channels using [`deadpool`].
//!
//! This module provides two key guarantees:
//! - Disposing of broken or idle-expired channels and recreating new ones
//!   on-demand.
//! - Multiplexing all pooled channels over the owning connection manager's
//!   single live connection.
//!
//! The pool is normally created and driven by
//! [`ConnectionManager`](crate::connection::ConnectionManager) - see
//! [`use_channel`](crate::connection::ConnectionManager::use_channel) for the
//! scoped acquire/release pattern built on top of it.

mod channel;
mod error;

pub use channel::{ChannelManager, ChannelPool, PoolConfig, PooledChannel, PooledChannelGuard};
pub use error::Error;

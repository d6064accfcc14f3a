//! Implements [`Manager`] for pooled transport channels.
use std::ops::Deref;
use std::time::Duration;

use deadpool::managed::{self, Manager, Object};
use tokio::time::Instant;

use crate::connection::ConnectionManager;
use crate::transport::{ChannelOf, Transport, TransportChannel};

/// Sizing and eviction parameters for a [`ChannelPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of channels pre-created when the pool comes up.
    pub min_size: usize,
    /// Hard cap on outstanding + idle channels; acquisition suspends once
    /// reached, resuming when a channel is released.
    pub max_size: usize,
    /// Channels idle for longer than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 10,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// A transport channel plus the pool's bookkeeping for it.
pub struct PooledChannel<T: Transport> {
    channel: ChannelOf<T>,
    /// When this channel last went back into the idle set.
    last_used: Instant,
}

/// `ChannelManager` implements [`Manager`] to manage a pool of transport
/// channels, all multiplexed over the owning connection manager's single
/// live connection.
pub struct ChannelManager<T: Transport> {
    connection_manager: ConnectionManager<T>,
    idle_timeout: Duration,
}

impl<T: Transport> ChannelManager<T> {
    pub fn new(connection_manager: ConnectionManager<T>, idle_timeout: Duration) -> Self {
        Self {
            connection_manager,
            idle_timeout,
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> Manager for ChannelManager<T> {
    type Type = PooledChannel<T>;
    type Error = super::Error;

    async fn create(&self) -> Result<PooledChannel<T>, super::Error> {
        let channel = self.connection_manager.channel().await?;
        Ok(PooledChannel {
            channel,
            last_used: Instant::now(),
        })
    }

    async fn recycle(&self, obj: &mut PooledChannel<T>) -> managed::RecycleResult<super::Error> {
        if obj.last_used.elapsed() > self.idle_timeout {
            // Expired channels are closed, never handed back out.
            let _ = obj.channel.close().await;
            return Err(managed::RecycleError::Message(
                "Channel exceeded the idle timeout".into(),
            ));
        }
        if !obj.channel.is_open() {
            return Err(managed::RecycleError::Message(
                "Channel is not in an healthy state".into(),
            ));
        }
        Ok(())
    }
}

/// `ChannelPool` pools transport channels over one connection.
///
/// Cheap to clone; clones share the same pool.
pub struct ChannelPool<T: Transport> {
    pool: managed::Pool<ChannelManager<T>>,
}

impl<T: Transport> Clone for ChannelPool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<T: Transport> ChannelPool<T> {
    /// Build a pool capped at `config.max_size` channels.
    pub fn new(manager: ChannelManager<T>, config: &PoolConfig) -> Result<Self, super::Error> {
        let pool = managed::Pool::builder(manager)
            .max_size(config.max_size)
            .build()?;
        Ok(Self { pool })
    }

    /// Check out a channel, creating one if the pool is below its cap.
    ///
    /// Suspends while all channels are checked out; resumes when one is
    /// released. The channel goes back to the pool when the returned guard
    /// is dropped, so a double release cannot happen.
    pub async fn acquire(&self) -> Result<PooledChannelGuard<T>, super::Error> {
        let object = self.pool.get().await?;
        Ok(PooledChannelGuard { object })
    }

    /// Pre-create `count` channels and park them in the idle set.
    pub async fn warm_up(&self, count: usize) -> Result<(), super::Error> {
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            held.push(self.acquire().await?);
        }
        // Guards drop here; the channels land in the idle set together.
        Ok(())
    }

    /// Close the pool. Outstanding guards stay usable until dropped; new
    /// acquisitions fail.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// RAII handle to a pooled channel. Dropping it releases the channel back
/// to the pool.
pub struct PooledChannelGuard<T: Transport> {
    object: Object<ChannelManager<T>>,
}

impl<T: Transport> PooledChannelGuard<T> {
    /// The checked-out channel.
    pub fn channel(&self) -> &ChannelOf<T> {
        &self.object.channel
    }
}

impl<T: Transport> Deref for PooledChannelGuard<T> {
    type Target = ChannelOf<T>;

    fn deref(&self) -> &Self::Target {
        self.channel()
    }
}

impl<T: Transport> Drop for PooledChannelGuard<T> {
    fn drop(&mut self) {
        // Stamp the release time so recycle can evict idle channels; the
        // inner object drop then returns the channel to the pool.
        self.object.last_used = Instant::now();
    }
}

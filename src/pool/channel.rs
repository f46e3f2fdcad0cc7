//! A bounded pool of publisher-side channels.
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::amqp::configuration::{ChannelPoolSettings, ConfigurationError};
use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, ChannelOf};

use super::{ConnectionManager, ConnectionRole, Error};

/// `ChannelPool` hands out at most `max_size` channels at any point in time.
///
/// Channels are created lazily on top of the [`ConnectionRole::Publisher`] connection and are
/// reused once returned. A channel found closed, either when it is taken from the idle set or
/// when it is handed back, is disposed of and replaced on demand: callers never see a stale
/// channel as an error.
///
/// Cloning a `ChannelPool` is cheap, all clones share the same channels.
///
/// ```rust
/// use std::sync::Arc;
/// use rabbit_lot::amqp::configuration::{ChannelPoolSettings, RabbitMqSettings};
/// use rabbit_lot::amqp::ConnectionFactory;
/// use rabbit_lot::pool::{ChannelPool, ConnectionManager};
///
/// async fn example() -> anyhow::Result<()> {
///     let settings = RabbitMqSettings::default();
///     let connections = Arc::new(ConnectionManager::new(
///         ConnectionFactory::new_from_config(&settings)?,
///         settings.retry_policy()?,
///     ));
///     let pool = ChannelPool::new(connections, ChannelPoolSettings::default().with_max_size(16))?;
///
///     let channel = pool.borrow().await?;
///     // [...]
///     channel.release().await;
///     Ok(())
/// }
/// ```
pub struct ChannelPool<F: BrokerConnector> {
    inner: Arc<PoolInner<F>>,
}

impl<F: BrokerConnector> Clone for ChannelPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: BrokerConnector> {
    connections: Arc<ConnectionManager<F>>,
    settings: ChannelPoolSettings,
    /// One permit per channel that may be handed out.
    slots: Arc<Semaphore>,
    /// Ordering among idle channels is irrelevant.
    idle: SegQueue<ChannelOf<F>>,
    /// Channels created by this pool and not disposed of yet, borrowed or idle.
    live: AtomicUsize,
}

impl<F: BrokerConnector> ChannelPool<F> {
    pub fn new(
        connections: Arc<ConnectionManager<F>>,
        settings: ChannelPoolSettings,
    ) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connections,
                slots: Arc::new(Semaphore::new(settings.max_size)),
                settings,
                idle: SegQueue::new(),
                live: AtomicUsize::new(0),
            }),
        })
    }

    /// Borrow a channel, waiting for a free slot if all of them are taken.
    ///
    /// Fails with [`Error::BorrowTimeout`] if no slot frees up within the configured timeout.
    /// Dropping the returned future gives the slot back and leaves the pool untouched.
    #[tracing::instrument(name = "channel_pool_borrow", skip_all, fields(pool_size = self.inner.settings.max_size))]
    pub async fn borrow(&self) -> Result<PooledChannel<F>, Error> {
        let permit = self.take_slot().await?;

        if let Some(channel) = self.inner.idle.pop() {
            if channel.is_open() {
                return Ok(PooledChannel::new(channel, permit, Arc::clone(&self.inner)));
            }
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            info!("Disposing of a closed channel found in the pool");
            dispose(&channel).await;
        }

        let channel = self.create_channel().await?;
        Ok(PooledChannel::new(channel, permit, Arc::clone(&self.inner)))
    }

    /// Hand a channel back to the pool. Same as [`PooledChannel::release`].
    pub async fn release(&self, channel: PooledChannel<F>) {
        channel.release().await;
    }

    /// Channels currently owned by the pool, either borrowed or idle.
    pub fn current_size(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.settings.max_size
    }

    /// Shut the pool down: pending and future borrows fail with [`Error::PoolClosed`] and idle
    /// channels are closed.
    ///
    /// Channels still borrowed are disposed of when they are handed back.
    pub async fn close(&self) {
        self.inner.slots.close();
        while let Some(channel) = self.inner.idle.pop() {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            dispose(&channel).await;
        }
        info!("Channel pool closed");
    }

    async fn take_slot(&self) -> Result<OwnedSemaphorePermit, Error> {
        let acquire = Arc::clone(&self.inner.slots).acquire_owned();
        let permit = match self.inner.settings.borrow_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| Error::BorrowTimeout(timeout))?,
            None => acquire.await,
        };
        permit.map_err(|_| Error::PoolClosed)
    }

    async fn create_channel(&self) -> Result<ChannelOf<F>, Error> {
        let reservation = LiveReservation::new(&self.inner.live);
        if reservation.count > self.inner.settings.max_size {
            return Err(Error::PoolExhausted {
                max_size: self.inner.settings.max_size,
            });
        }

        let connection = self
            .inner
            .connections
            .acquire(ConnectionRole::Publisher)
            .await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(Error::ChannelCreation)?;
        if self.inner.settings.publisher_confirms {
            if let Err(e) = channel.enable_publisher_confirms().await {
                dispose(&channel).await;
                return Err(Error::ChannelCreation(e));
            }
        }

        reservation.commit();
        debug!(live = self.current_size(), "Created a new channel");
        Ok(channel)
    }
}

/// Counts a channel as live for as long as it is being created.
///
/// Dropped without [`LiveReservation::commit`] (creation failed or was cancelled), the count is
/// rolled back.
struct LiveReservation<'a> {
    live: &'a AtomicUsize,
    count: usize,
    committed: bool,
}

impl<'a> LiveReservation<'a> {
    fn new(live: &'a AtomicUsize) -> Self {
        let count = live.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            live,
            count,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for LiveReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

async fn dispose<C: BrokerChannel>(channel: &C) {
    if let Err(e) = channel.close().await {
        debug!(error = ?e, "Failed to close a channel while disposing of it");
    }
}

/// A channel borrowed from a [`ChannelPool`]. It dereferences to the underlying channel.
///
/// Hand it back with [`PooledChannel::release`]. Simply dropping it also returns it to the pool:
/// a channel that has to be disposed of is then closed on a background task, or just dropped
/// outside of a tokio runtime.
pub struct PooledChannel<F: BrokerConnector> {
    channel: ChannelOf<F>,
    pool: Arc<PoolInner<F>>,
    released: bool,
    // Declared last: the slot frees up only after the channel is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl<F: BrokerConnector> PooledChannel<F> {
    fn new(channel: ChannelOf<F>, permit: OwnedSemaphorePermit, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            channel,
            pool,
            released: false,
            _permit: permit,
        }
    }

    /// Return the channel to its pool.
    ///
    /// An open channel goes back to the idle set, a closed one is disposed of.
    /// The slot is freed in both cases, even if closing the channel fails.
    pub async fn release(mut self) {
        self.released = true;
        if self.channel.is_open() && !self.pool.slots.is_closed() {
            self.pool.idle.push(self.channel.clone());
            return;
        }
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
        info!("Disposing of a closed channel handed back to the pool");
        dispose(&self.channel).await;
    }
}

impl<F: BrokerConnector> Deref for PooledChannel<F> {
    type Target = ChannelOf<F>;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl<F: BrokerConnector> Drop for PooledChannel<F> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.channel.is_open() && !self.pool.slots.is_closed() {
            self.pool.idle.push(self.channel.clone());
            return;
        }
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            runtime.spawn(async move { dispose(&channel).await });
        }
    }
}

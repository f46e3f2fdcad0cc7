use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, ChannelOf};

use super::{ConnectionManager, ConnectionRole, Error};

/// A single, long-lived channel for a consumer.
///
/// The channel is created on the first [`ChannelProvider::get`], on top of the
/// [`ConnectionRole::Consumer`] connection, and every later call hands out the same channel.
///
/// # Prefetch
///
/// The prefetch count is applied once, when the channel is created. Later calls to `get` ignore
/// their `prefetch_count` argument.
pub struct ChannelProvider<F: BrokerConnector> {
    connections: Arc<ConnectionManager<F>>,
    channel: Mutex<Option<ChannelOf<F>>>,
}

impl<F: BrokerConnector> ChannelProvider<F> {
    pub fn new(connections: Arc<ConnectionManager<F>>) -> Self {
        Self {
            connections,
            channel: Mutex::new(None),
        }
    }

    /// Get the channel, creating it on first use.
    ///
    /// Concurrent first calls wait for each other: at most one channel is ever created per
    /// provider until it is [closed](ChannelProvider::close).
    pub async fn get(&self, prefetch_count: u16) -> Result<ChannelOf<F>, Error> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }

        let connection = self.connections.acquire(ConnectionRole::Consumer).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(Error::ChannelCreation)?;
        if let Err(e) = channel.set_qos(prefetch_count).await {
            if let Err(close_error) = channel.close().await {
                debug!(error = ?close_error, "Failed to close a channel whose prefetch could not be set");
            }
            return Err(e.into());
        }
        debug!(prefetch_count, "Created a consumer channel");

        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Close the channel, if one was ever created.
    ///
    /// A later [`ChannelProvider::get`] opens a brand new channel. Failures to close are logged,
    /// never returned.
    pub async fn close(&self) {
        let channel = self.channel.lock().await.take();
        let Some(channel) = channel else {
            return;
        };
        if let Err(e) = channel.close().await {
            warn!(error = ?e, "Failed to close the consumer channel");
        }
    }
}

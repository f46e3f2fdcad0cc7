//! The capabilities `rabbit-lot` needs from a message broker.
//!
//! The pool, the single-channel provider and the redelivery handler are written against these
//! traits rather than against [`lapin`] directly. The [`lapin`] implementations live in
//! [`amqp`](crate::amqp) and the test-suite swaps in in-memory fakes.
use std::sync::Arc;

use crate::amqp::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use crate::amqp::types::FieldTable;
use crate::amqp::{BasicProperties, ExchangeKind};
use crate::consumers::Delivery;
use futures_util::stream::BoxStream;

/// Establishes new connections to the broker.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a brand new connection.
    ///
    /// Failures are classified by [`ConnectError`]: only [`ConnectError::is_retryable`] failures
    /// are retried by the [`ConnectionManager`](crate::pool::ConnectionManager).
    async fn connect(&self) -> Result<Self::Connection, ConnectError>;
}

/// A long-lived connection, channels are multiplexed on top of it.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// Register an observer that is notified when the broker (or the network) closes the
    /// connection unexpectedly.
    fn on_shutdown(&self, observer: Arc<dyn ShutdownObserver>);
}

/// Subscription interface for unexpected connection shutdowns.
///
/// Observers must not block: they are invoked from the connection's I/O machinery.
pub trait ShutdownObserver: Send + Sync + 'static {
    fn on_shutdown(&self, reason: &str);
}

/// A lightweight session multiplexed over a [`BrokerConnection`].
///
/// Handles are cheap to clone and all clones refer to the same underlying channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), anyhow::Error>;

    /// Put the channel in confirm mode: from now on `publish` waits for the broker's ack.
    async fn enable_publisher_confirms(&self) -> Result<(), anyhow::Error>;

    /// Set the maximum number of unacknowledged deliveries the broker pushes to this channel.
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), anyhow::Error>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), anyhow::Error>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), anyhow::Error>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    /// Start consuming from `queue`, with manual acknowledgements.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<Delivery, anyhow::Error>>, anyhow::Error>;
}

/// Shorthand for the channel type produced by a connector's connections.
pub type ChannelOf<F> = <<F as BrokerConnector>::Connection as BrokerConnection>::Channel;

/// Failure to establish a connection.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    /// The broker actively refused the connection (or the socket could not be opened).
    #[error("The connection to the broker was refused")]
    Refused(#[source] anyhow::Error),
    /// The broker could not be reached in time.
    #[error("The broker is unreachable")]
    Unreachable(#[source] anyhow::Error),
    /// Anything retrying will not fix - e.g. bad credentials or an unknown virtual host.
    #[error("Failed to connect to the broker")]
    Fatal(#[source] anyhow::Error),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refused(_) | Self::Unreachable(_) => true,
            Self::Fatal(_) => false,
        }
    }
}

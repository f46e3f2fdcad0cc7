use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;
use uuid::Uuid;

use crate::amqp::BasicProperties;
use crate::broker::{BrokerChannel, BrokerConnector};
use crate::pool::{self, ChannelPool};
use crate::publishers::message_envelope::default_properties;
use crate::publishers::MessageEnvelope;

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// A high-level interface to publish messages, on top of a [`ChannelPool`].
///
/// Every publish borrows a channel from the pool and hands it back afterwards, whatever the
/// outcome.
///
/// # Fault tolerance
///
/// Closed channels are replaced by the pool and broken connections are re-established by the
/// [`ConnectionManager`](crate::pool::ConnectionManager) on the next publish.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
pub struct Publisher<F: BrokerConnector> {
    channel_pool: ChannelPool<F>,
    /// Bounds borrowing a channel and publishing, together.
    timeout: Duration,
}

impl<F: BrokerConnector> Clone for Publisher<F> {
    fn clone(&self) -> Self {
        Self {
            channel_pool: self.channel_pool.clone(),
            timeout: self.timeout,
        }
    }
}

impl<F: BrokerConnector> Publisher<F> {
    /// Start building a [`Publisher`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use rabbit_lot::amqp::configuration::{ChannelPoolSettings, RabbitMqSettings};
    /// use rabbit_lot::amqp::ConnectionFactory;
    /// use rabbit_lot::pool::{ChannelPool, ConnectionManager};
    /// use rabbit_lot::publishers::Publisher;
    ///
    /// pub fn get_publisher() -> anyhow::Result<Publisher<ConnectionFactory>> {
    ///     let settings = RabbitMqSettings::default();
    ///     let connections = Arc::new(ConnectionManager::new(
    ///         ConnectionFactory::new_from_config(&settings)?,
    ///         settings.retry_policy()?,
    ///     ));
    ///     let channel_pool = ChannelPool::new(connections, ChannelPoolSettings::default().with_max_size(10))?;
    ///
    ///     Ok(Publisher::builder(channel_pool)
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build())
    /// }
    /// ```
    pub fn builder(channel_pool: ChannelPool<F>) -> PublisherBuilder<F> {
        PublisherBuilder::new(channel_pool)
    }

    /// The pool every publish borrows its channel from.
    pub fn channel_pool(&self) -> &ChannelPool<F> {
        &self.channel_pool
    }

    /// Publish a message to RabbitMq.
    ///
    /// A `message_id` and a timestamp are added to the message properties, unless already set.
    pub async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublisherError> {
        let MessageEnvelope {
            payload,
            exchange_name,
            routing_key,
            properties,
        } = envelope;
        let properties = inject_amqp_properties(properties.unwrap_or_else(default_properties));
        self.publish_raw(&payload, &exchange_name, &routing_key, properties)
            .await
    }

    /// Publish `body` with exactly the given `properties`.
    #[tracing::instrument(name = "publish", level = "debug", skip(self, body, properties))]
    pub async fn publish_raw(
        &self,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
    ) -> Result<(), PublisherError> {
        // Borrowing and publishing share the same timeout.
        // A channel still borrowed when the timeout fires goes back to the pool on drop.
        let publish_future = async {
            let channel = self.channel_pool.borrow().await?;
            let outcome = channel
                .publish(exchange, routing_key, properties, body)
                .await;
            channel.release().await;
            outcome.map_err(PublisherError::GenericError)
        };

        match tokio::time::timeout(self.timeout, publish_future).await {
            Ok(result) => result,
            Err(_) => Err(PublisherError::TimeoutError),
        }
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to acquire a healthy channel from the pool")]
    Pool(#[from] pool::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("Failed to serialize the message")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to declare the exchange or queue the message is published to")]
    Declaration(#[source] anyhow::Error),
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<F: BrokerConnector> {
    channel_pool: ChannelPool<F>,
    timeout: Duration,
}

impl<F: BrokerConnector> PublisherBuilder<F> {
    fn new(channel_pool: ChannelPool<F>) -> Self {
        Self {
            channel_pool,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher<F> {
        Publisher {
            channel_pool: self.channel_pool,
            timeout: self.timeout,
        }
    }
}

fn inject_amqp_properties(props: BasicProperties) -> BasicProperties {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}

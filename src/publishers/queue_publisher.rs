use std::collections::HashMap;
use std::marker::PhantomData;

use serde::Serialize;
use tracing::debug;

use crate::amqp::configuration::ConfigurationError;
use crate::broker::BrokerConnector;
use crate::publishers::destination::AutoDeclare;
use crate::publishers::{MessageEnvelope, Publisher, PublisherError, PublisherSettings, QueueDeclaration};

/// The broker's default exchange routes each message to the queue named by its routing key.
const DEFAULT_EXCHANGE: &str = "";

/// Publishes messages of type `M`, as JSON, straight to one queue through the default exchange.
///
/// The queue is declared before the first message is published, unless
/// [`PublisherSettings::auto_create`] is off.
pub struct QueuePublisher<F: BrokerConnector, M> {
    publisher: Publisher<F>,
    queue: AutoDeclare<QueueDeclaration>,
    _message: PhantomData<fn(&M)>,
}

impl<F: BrokerConnector, M: Serialize> QueuePublisher<F, M> {
    pub fn new(
        publisher: Publisher<F>,
        settings: PublisherSettings<QueueDeclaration>,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            publisher,
            queue: AutoDeclare::new(settings)?,
            _message: PhantomData,
        })
    }

    pub fn queue(&self) -> &QueueDeclaration {
        self.queue.destination()
    }

    pub async fn publish(&self, message: &M) -> Result<(), PublisherError> {
        self.publish_with_headers(message, &HashMap::new()).await
    }

    /// Publish `message` with `headers` as string headers.
    pub async fn publish_with_headers(
        &self,
        message: &M,
        headers: &HashMap<String, String>,
    ) -> Result<(), PublisherError> {
        self.queue
            .ensure_declared(self.publisher.channel_pool())
            .await?;

        let queue = &self.queue.destination().name;
        debug!(queue = %queue, "Publishing message");
        let envelope = MessageEnvelope::json(DEFAULT_EXCHANGE, queue, message)?
            .with_string_headers(headers);
        self.publisher.publish(envelope).await
    }
}

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::amqp::configuration::ConfigurationError;
use crate::broker::BrokerConnector;
use crate::publishers::destination::AutoDeclare;
use crate::publishers::{
    ExchangeDeclaration, MessageEnvelope, Publisher, PublisherError, PublisherSettings,
};

type RoutingKeyFn<M> = Box<dyn Fn(&M, &HashMap<String, String>) -> String + Send + Sync>;

/// Publishes messages of type `M`, as JSON, to one exchange.
///
/// The exchange is declared before the first message is published, unless
/// [`PublisherSettings::auto_create`] is off. The routing key of each message is computed by the
/// `routing_key` function from the message and its headers.
///
/// ```rust
/// use rabbit_lot::amqp::ConnectionFactory;
/// use rabbit_lot::publishers::{ExchangeDeclaration, ExchangePublisher, Publisher, PublisherSettings};
///
/// #[derive(serde::Serialize)]
/// struct OrderCreated {
///     id: u64,
///     region: String,
/// }
///
/// fn order_publisher(
///     publisher: Publisher<ConnectionFactory>,
/// ) -> anyhow::Result<ExchangePublisher<ConnectionFactory, OrderCreated>> {
///     let settings = PublisherSettings::new(ExchangeDeclaration::new("orders-exchange"));
///     Ok(ExchangePublisher::new(publisher, settings, |order: &OrderCreated, _headers| {
///         format!("order.created.{}", order.region)
///     })?)
/// }
/// ```
pub struct ExchangePublisher<F: BrokerConnector, M> {
    publisher: Publisher<F>,
    exchange: AutoDeclare<ExchangeDeclaration>,
    routing_key: RoutingKeyFn<M>,
}

impl<F: BrokerConnector, M: Serialize> ExchangePublisher<F, M> {
    pub fn new(
        publisher: Publisher<F>,
        settings: PublisherSettings<ExchangeDeclaration>,
        routing_key: impl Fn(&M, &HashMap<String, String>) -> String + Send + Sync + 'static,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            publisher,
            exchange: AutoDeclare::new(settings)?,
            routing_key: Box::new(routing_key),
        })
    }

    pub fn exchange(&self) -> &ExchangeDeclaration {
        self.exchange.destination()
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
        self.exchange
            .ensure_declared(self.publisher.channel_pool())
            .await?;

        let exchange = &self.exchange.destination().name;
        let routing_key = (self.routing_key)(message, headers);
        debug!(exchange = %exchange, routing_key = %routing_key, "Publishing message");
        let envelope =
            MessageEnvelope::json(exchange, routing_key, message)?.with_string_headers(headers);
        self.publisher.publish(envelope).await
    }
}

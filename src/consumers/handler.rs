use std::collections::HashMap;

use anyhow::Context;
use serde::de::DeserializeOwned;

use crate::amqp::convenience::headers_as_strings;
use crate::consumers::Incoming;

/// Implementers of the `Handler` trait process the messages a
/// [`QueueWorker`](crate::consumers::QueueWorker) pulls from its queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The worker acks the message when `handle` succeeds and hands failures over to the
/// [`RedeliveryHandler`](crate::consumers::RedeliveryHandler), which either parks the message
/// for a delayed retry or rejects it for good.
/// This decouples the low-level interactions with the message broker and the retry logic from
/// the actual business logic associated with the processing of a message.
///
/// # Errors
///
/// The error returned by `handle` travels with the retried message: its root cause and its
/// debug rendering are attached as headers.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    type Context: Send + Sync + 'static;

    async fn handle(&self, incoming: &Incoming<Self::Context>) -> Result<(), anyhow::Error>;
}

/// A [`Handler`] for JSON messages of a known type.
///
/// The body is deserialized into [`MessageHandler::Message`] with `serde_json` and the headers
/// are handed over as strings (see [`headers_as_strings`]). Field naming is up to the message
/// type's `serde` attributes, e.g. `#[serde(rename_all = "camelCase")]`. Use an `Option` as
/// message type to accept a `null` body.
///
/// A body that cannot be deserialized is a processing failure, like any error returned by
/// [`MessageHandler::process`]. Wrap the handler in [`JsonHandler`] to run it in a worker.
///
/// ```rust
/// use std::collections::HashMap;
/// use rabbit_lot::consumers::{Incoming, MessageHandler};
///
/// #[derive(serde::Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct OrderCreated {
///     order_id: u64,
/// }
///
/// struct OrderCreatedHandler;
///
/// #[async_trait::async_trait]
/// impl MessageHandler for OrderCreatedHandler {
///     type Message = OrderCreated;
///     type Context = ();
///
///     async fn process(
///         &self,
///         message: OrderCreated,
///         headers: HashMap<String, String>,
///         _incoming: &Incoming<()>,
///     ) -> Result<(), anyhow::Error> {
///         tracing::info!(order_id = message.order_id, tenant = ?headers.get("tenant"), "Order created");
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + Send;
    type Context: Send + Sync + 'static;

    async fn process(
        &self,
        message: Self::Message,
        headers: HashMap<String, String>,
        incoming: &Incoming<Self::Context>,
    ) -> Result<(), anyhow::Error>;
}

/// Runs a [`MessageHandler`] wherever a [`Handler`] is expected.
pub struct JsonHandler<H>(pub H);

#[async_trait::async_trait]
impl<H: MessageHandler> Handler for JsonHandler<H> {
    type Context = H::Context;

    async fn handle(&self, incoming: &Incoming<Self::Context>) -> Result<(), anyhow::Error> {
        tracing::debug!(delivery_tag = incoming.message.delivery_tag, "Handling message");
        let message: H::Message = serde_json::from_slice(&incoming.message.data)
            .context("Failed to deserialize the message body")?;
        let headers = headers_as_strings(&incoming.message.properties);
        self.0.process(message, headers, incoming).await
    }
}

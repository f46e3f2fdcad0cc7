//! Facilities to publish messages to RabbitMq. Check out [`Publisher`] as a starting point, and
//! [`ExchangePublisher`]/[`QueuePublisher`] to publish typed messages to a destination they
//! declare themselves.
mod destination;
mod exchange_publisher;
mod message_envelope;
mod publisher;
mod queue_publisher;

pub use destination::{Destination, ExchangeDeclaration, PublisherSettings, QueueDeclaration};
pub use exchange_publisher::ExchangePublisher;
pub use message_envelope::{default_properties, MessageEnvelope};
pub use publisher::{Publisher, PublisherBuilder, PublisherError};
pub use queue_publisher::QueuePublisher;

use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use std::sync::Arc;

/// A dequeued message enriched with some auxiliary data, ready for processing.
///
/// `Incoming` is the input type of message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
pub struct Incoming<C> {
    /// `context` is a set of resources that are required to process the message and are outside
    /// the lifecycle of the message itself - e.g. an HTTP client for a third-party API, a db connection
    /// pool, etc.
    ///
    /// It is behind an `Arc` pointer: deliveries are processed concurrently, on arbitrary threads,
    /// and they all share the same context.
    pub context: Arc<C>,
    /// `message` is what we received from RabbitMq: it includes headers, payload, delivery tag, etc.
    pub message: Delivery,
    /// The name of the queue.
    pub queue_name: String,
}

/// A received AMQP message.
///
/// Acknowledgements go through the channel the message was received on, see
/// [`BrokerChannel::ack`](crate::broker::BrokerChannel::ack).
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl Delivery {
    /// A delivery with default properties, as received from the default exchange.
    pub fn new(delivery_tag: DeliveryTag, routing_key: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            exchange: ShortString::from(""),
            routing_key: routing_key.into(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

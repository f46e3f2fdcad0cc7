use std::collections::HashMap;

use amq_protocol_types::{AMQPValue, FieldTable, LongString, ShortShortUInt, ShortString};

use crate::amqp::BasicProperties;

/// Non-persistent (1) or persistent (2).
const PERSISTENT: ShortShortUInt = 2;
const DEFAULT_CONTENT_TYPE: &str = "application/json";
const DEFAULT_CONTENT_ENCODING: &str = "utf-8";

/// A message to be published via [`Publisher`](crate::publishers::Publisher).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// The name of the exchange we are publishing the message to.
    pub exchange_name: String,
    /// The routing key used by exchange listeners to determine if they are interested or not
    /// to the message.
    pub routing_key: String,
    /// AMQP properties attached to the message.
    ///
    /// When `None`, the message is published as persistent UTF-8 encoded JSON.
    pub properties: Option<BasicProperties>,
}

impl MessageEnvelope {
    pub fn new(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            payload: payload.into(),
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            properties: None,
        }
    }

    /// Serialize `body` as the JSON payload of a new envelope.
    pub fn json<T: serde::Serialize>(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(exchange_name, routing_key, serde_json::to_vec(body)?))
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = Some(f(self.properties.unwrap_or_else(default_properties)));
        self
    }

    #[must_use]
    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    #[must_use]
    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    /// Attach `headers` as string headers. An empty map leaves the properties untouched.
    #[must_use]
    pub fn with_string_headers(self, headers: &HashMap<String, String>) -> Self {
        if headers.is_empty() {
            return self;
        }
        let mut table = FieldTable::default();
        for (name, value) in headers {
            table.insert(
                ShortString::from(name.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        self.with_headers(table)
    }

    #[must_use]
    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    #[must_use]
    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }
}

/// Persistent delivery, JSON content type, UTF-8 encoding.
pub fn default_properties() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(DEFAULT_CONTENT_TYPE.into())
        .with_content_encoding(DEFAULT_CONTENT_ENCODING.into())
}

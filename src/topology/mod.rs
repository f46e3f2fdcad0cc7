//! Describe the exchanges, queues and bindings a consumer relies on, and declare them.
//!
//! A [`QueueTopology`] names a main queue and, optionally, two satellites:
//!
//! - a **dead-letter** queue, where messages rejected from the main queue end up for good;
//! - a **parking-lot** queue, where failed messages wait for `ttl_ms` before the broker
//!   routes them back to the main exchange for another attempt.
//!
//! ```rust
//! use rabbit_lot::topology::{DeadLetterSettings, ParkingLotSettings, QueueTopology};
//!
//! let topology = QueueTopology::new("orders")
//!     .with_exchange("orders-exchange", "topic")
//!     .with_routing_keys(["order.created", "order.updated"])
//!     .with_dead_letter(DeadLetterSettings::enabled())
//!     .with_parking_lot(ParkingLotSettings::enabled().with_ttl_ms(30_000).with_max_retry_attempts(5));
//!
//! assert!(topology.validate().is_ok());
//! assert_eq!(topology.dead_letter_queue_name(), "orders.dlq");
//! assert_eq!(topology.parking_lot_exchange_name(), "orders-exchange.plx");
//! ```
mod factory;

pub use factory::declare;

use serde::Deserialize;

use crate::amqp::configuration::ConfigurationError;
use crate::amqp::ExchangeKind;

const DEFAULT_PREFETCH_COUNT: u16 = 250;
const DEFAULT_CONSUMER_COUNT: usize = 1;
const DEFAULT_EXCHANGE_KIND: &str = "topic";

const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";
const DEAD_LETTER_EXCHANGE_SUFFIX: &str = ".dlx";
const PARKING_LOT_QUEUE_SUFFIX: &str = ".plq";
const PARKING_LOT_EXCHANGE_SUFFIX: &str = ".plx";

const DEFAULT_PARKING_LOT_TTL_MS: i32 = 60_000;
const MINIMUM_PARKING_LOT_TTL_MS: i32 = 1_000;
const DEFAULT_PARKING_LOT_RETRY_ATTEMPTS: u16 = 3;
const MINIMUM_PARKING_LOT_RETRY_ATTEMPTS: u16 = 1;

/// Everything needed to set up, and consume from, one queue.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue_name: String,
    #[serde(default)]
    pub exchange: ExchangeSettings,
    /// The main queue is bound to the main exchange with each of these keys.
    /// The dead-letter and parking-lot queues are bound to their exchanges with the same keys.
    #[serde(default)]
    pub routing_keys: Vec<String>,
    /// How many unacknowledged deliveries each consumer accepts at once.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    /// How many consumers, each on its own channel, pull from the queue.
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,
    #[serde(default)]
    pub dead_letter: DeadLetterSettings,
    #[serde(default)]
    pub parking_lot: ParkingLotSettings,
}

fn default_prefetch_count() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

fn default_consumer_count() -> usize {
    DEFAULT_CONSUMER_COUNT
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExchangeSettings {
    /// A blank name stands for the broker's default exchange: nothing is declared or bound.
    #[serde(default)]
    pub name: String,
    /// `topic`, `direct`, `fanout`, `headers` or the name of a plugin-provided exchange type.
    #[serde(default = "default_exchange_kind")]
    pub kind: String,
}

fn default_exchange_kind() -> String {
    DEFAULT_EXCHANGE_KIND.to_owned()
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: default_exchange_kind(),
        }
    }
}

impl ExchangeSettings {
    pub fn exchange_kind(&self) -> ExchangeKind {
        parse_exchange_kind(&self.kind)
    }
}

/// Built-in kinds are matched case-insensitively, a blank kind means `topic`.
pub(crate) fn parse_exchange_kind(kind: &str) -> ExchangeKind {
    match kind.trim().to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" | "" => ExchangeKind::Topic,
        _ => ExchangeKind::Custom(kind.trim().to_owned()),
    }
}

/// Where rejected messages go.
///
/// Names left blank fall back to the main queue/exchange name plus the default suffix
/// (`.dlq` for the queue, `.dlx` for the exchange).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DeadLetterSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub queue_suffix: Option<String>,
    #[serde(default)]
    pub exchange_name: Option<String>,
    #[serde(default)]
    pub exchange_suffix: Option<String>,
}

impl DeadLetterSettings {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    #[must_use]
    pub fn with_queue_suffix(mut self, queue_suffix: impl Into<String>) -> Self {
        self.queue_suffix = Some(queue_suffix.into());
        self
    }

    #[must_use]
    pub fn with_exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    #[must_use]
    pub fn with_exchange_suffix(mut self, exchange_suffix: impl Into<String>) -> Self {
        self.exchange_suffix = Some(exchange_suffix.into());
        self
    }
}

/// Delayed retries for messages whose processing failed.
///
/// A failed message is published to the parking-lot exchange with an incremented `x-retries`
/// header. It sits in the parking-lot queue for `ttl_ms`, then the broker dead-letters it back
/// to the main exchange. Once `max_retry_attempts` is exceeded the message is rejected instead.
///
/// Names left blank fall back to the main queue/exchange name plus the default suffix
/// (`.plq` for the queue, `.plx` for the exchange).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ParkingLotSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub queue_suffix: Option<String>,
    #[serde(default)]
    pub exchange_name: Option<String>,
    #[serde(default)]
    pub exchange_suffix: Option<String>,
    #[serde(default = "default_parking_lot_ttl_ms")]
    pub ttl_ms: i32,
    #[serde(default = "default_parking_lot_retry_attempts")]
    pub max_retry_attempts: u16,
}

fn default_parking_lot_ttl_ms() -> i32 {
    DEFAULT_PARKING_LOT_TTL_MS
}

fn default_parking_lot_retry_attempts() -> u16 {
    DEFAULT_PARKING_LOT_RETRY_ATTEMPTS
}

impl Default for ParkingLotSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_name: None,
            queue_suffix: None,
            exchange_name: None,
            exchange_suffix: None,
            ttl_ms: DEFAULT_PARKING_LOT_TTL_MS,
            max_retry_attempts: DEFAULT_PARKING_LOT_RETRY_ATTEMPTS,
        }
    }
}

impl ParkingLotSettings {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ttl_ms(mut self, ttl_ms: i32) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    #[must_use]
    pub fn with_max_retry_attempts(mut self, max_retry_attempts: u16) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self
    }

    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    #[must_use]
    pub fn with_queue_suffix(mut self, queue_suffix: impl Into<String>) -> Self {
        self.queue_suffix = Some(queue_suffix.into());
        self
    }

    #[must_use]
    pub fn with_exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    #[must_use]
    pub fn with_exchange_suffix(mut self, exchange_suffix: impl Into<String>) -> Self {
        self.exchange_suffix = Some(exchange_suffix.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ttl_ms < MINIMUM_PARKING_LOT_TTL_MS {
            return Err(ConfigurationError::ParkingLotTtlTooSmall {
                minimum: MINIMUM_PARKING_LOT_TTL_MS,
                actual: self.ttl_ms,
            });
        }
        if self.max_retry_attempts < MINIMUM_PARKING_LOT_RETRY_ATTEMPTS {
            return Err(ConfigurationError::TooFewRetryAttempts {
                minimum: MINIMUM_PARKING_LOT_RETRY_ATTEMPTS,
                actual: self.max_retry_attempts,
            });
        }
        Ok(())
    }
}

impl QueueTopology {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            exchange: ExchangeSettings::default(),
            routing_keys: Vec::new(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_count: DEFAULT_CONSUMER_COUNT,
            dead_letter: DeadLetterSettings::default(),
            parking_lot: ParkingLotSettings::default(),
        }
    }

    #[must_use]
    pub fn with_exchange(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.exchange = ExchangeSettings {
            name: name.into(),
            kind: kind.into(),
        };
        self
    }

    #[must_use]
    pub fn with_routing_keys<I, K>(mut self, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.routing_keys = routing_keys.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    #[must_use]
    pub fn with_consumer_count(mut self, consumer_count: usize) -> Self {
        self.consumer_count = consumer_count;
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: DeadLetterSettings) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    #[must_use]
    pub fn with_parking_lot(mut self, parking_lot: ParkingLotSettings) -> Self {
        self.parking_lot = parking_lot;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName);
        }
        self.parking_lot.validate()
    }

    pub fn dead_letter_queue_name(&self) -> String {
        build_name(
            &self.queue_name,
            self.dead_letter.queue_name.as_deref(),
            self.dead_letter.queue_suffix.as_deref(),
            DEAD_LETTER_QUEUE_SUFFIX,
        )
    }

    pub fn dead_letter_exchange_name(&self) -> String {
        build_name(
            &self.exchange.name,
            self.dead_letter.exchange_name.as_deref(),
            self.dead_letter.exchange_suffix.as_deref(),
            DEAD_LETTER_EXCHANGE_SUFFIX,
        )
    }

    pub fn parking_lot_queue_name(&self) -> String {
        build_name(
            &self.queue_name,
            self.parking_lot.queue_name.as_deref(),
            self.parking_lot.queue_suffix.as_deref(),
            PARKING_LOT_QUEUE_SUFFIX,
        )
    }

    pub fn parking_lot_exchange_name(&self) -> String {
        build_name(
            &self.exchange.name,
            self.parking_lot.exchange_name.as_deref(),
            self.parking_lot.exchange_suffix.as_deref(),
            PARKING_LOT_EXCHANGE_SUFFIX,
        )
    }
}

/// `{name}{suffix}`, where a blank override counts as unset.
fn build_name(
    main_name: &str,
    name_override: Option<&str>,
    suffix_override: Option<&str>,
    default_suffix: &str,
) -> String {
    let name = non_blank(name_override).unwrap_or(main_name);
    let suffix = non_blank(suffix_override).unwrap_or(default_suffix);
    format!("{name}{suffix}")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

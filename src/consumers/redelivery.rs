//! What happens to a message whose processing failed.
use amq_protocol_types::{AMQPValue, LongString};
use tracing::{error, warn};

use crate::amqp::convenience::{set_header, BasicPropertiesExt};
use crate::broker::{BrokerChannel, BrokerConnector};
use crate::consumers::Delivery;
use crate::publishers::{Publisher, PublisherError};
use crate::topology::QueueTopology;

/// How many times the message went through the parking lot.
pub const RETRIES_HEADER: &str = "x-retries";
/// The innermost cause of the last processing failure.
pub const EXCEPTION_ROOT_CAUSE_HEADER: &str = "x-exception-root-cause";
/// The full error chain of the last processing failure.
pub const EXCEPTION_STACKTRACE_HEADER: &str = "x-exception-stacktrace";

/// Where a failed message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryOutcome {
    /// Parked for a delayed retry. `retry_count` is the value of the `x-retries` header on the
    /// parked copy.
    Retrying { retry_count: u32 },
    /// Rejected without requeue: the broker's dead-letter routing, if any, takes over.
    DeadLettered,
}

#[derive(thiserror::Error, Debug)]
pub enum RedeliveryError {
    #[error("Failed to reject delivery {delivery_tag}")]
    Reject {
        delivery_tag: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to acknowledge delivery {delivery_tag} before parking it")]
    Ack {
        delivery_tag: u64,
        #[source]
        source: anyhow::Error,
    },
    /// The original delivery has already been acknowledged: the message is lost.
    #[error("Failed to publish delivery {delivery_tag} to the parking lot exchange {exchange}")]
    Publish {
        delivery_tag: u64,
        exchange: String,
        #[source]
        source: PublisherError,
    },
}

/// Route a message whose processing failed either to the parking lot or to the dead-letter path.
///
/// The decision is driven by the `x-retries` header: a missing, negative or unreadable value
/// counts as zero. If the parking lot is enabled and the incremented count does not exceed its
/// `max_retry_attempts`, a copy of the message is published to the parking-lot exchange with the
/// incremented count and the failure details as headers. Otherwise the delivery is rejected
/// without requeue.
///
/// # Known limitations
///
/// - The original delivery is acknowledged **before** the copy is published. If publishing
///   fails, the message is gone: delivery is at-least-once only as long as the publish succeeds.
/// - The copy is published with the original routing key. The parking-lot queue must be bound
///   to the parking-lot exchange with keys matching the main queue's, otherwise the broker
///   silently drops the copy and `handle` still reports [`RedeliveryOutcome::Retrying`].
pub struct RedeliveryHandler<F: BrokerConnector> {
    publisher: Publisher<F>,
}

impl<F: BrokerConnector> RedeliveryHandler<F> {
    pub fn new(publisher: Publisher<F>) -> Self {
        Self { publisher }
    }

    /// Ack/reject `delivery` on `channel`, the channel it was received on.
    ///
    /// Any failure is logged with the delivery details and returned: it is not retried.
    #[tracing::instrument(
        name = "redelivery",
        skip_all,
        fields(delivery_tag = delivery.delivery_tag, queue_name = %topology.queue_name)
    )]
    pub async fn handle<C: BrokerChannel>(
        &self,
        topology: &QueueTopology,
        channel: &C,
        delivery: &Delivery,
        failure: &anyhow::Error,
    ) -> Result<RedeliveryOutcome, RedeliveryError> {
        let outcome = self.route(topology, channel, delivery, failure).await;
        if let Err(e) = &outcome {
            error!(
                error = ?e,
                delivery_tag = delivery.delivery_tag,
                exchange = delivery.exchange.as_str(),
                routing_key = delivery.routing_key.as_str(),
                redelivered = delivery.redelivered,
                message_id = ?delivery.properties.message_id(),
                "Failed to handle a message processing failure"
            );
        }
        outcome
    }

    async fn route<C: BrokerChannel>(
        &self,
        topology: &QueueTopology,
        channel: &C,
        delivery: &Delivery,
        failure: &anyhow::Error,
    ) -> Result<RedeliveryOutcome, RedeliveryError> {
        let retry_count = retry_count(delivery).saturating_add(1);
        let parking_lot = &topology.parking_lot;

        if !parking_lot.enabled || retry_count > u32::from(parking_lot.max_retry_attempts) {
            if parking_lot.enabled {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    retry_count, "Max retry attempts reached, sending the message to the dead letter"
                );
            } else {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    "No parking lot configured, sending the message to the dead letter"
                );
            }
            channel
                .reject(delivery.delivery_tag, false)
                .await
                .map_err(|source| RedeliveryError::Reject {
                    delivery_tag: delivery.delivery_tag,
                    source,
                })?;
            return Ok(RedeliveryOutcome::DeadLettered);
        }

        let exchange = topology.parking_lot_exchange_name();
        warn!(
            delivery_tag = delivery.delivery_tag,
            retry_count,
            exchange = %exchange,
            "Sending the message to the parking lot"
        );

        let properties = delivery.properties.clone();
        let properties = set_header(
            properties,
            RETRIES_HEADER,
            AMQPValue::LongInt(i32::try_from(retry_count).unwrap_or(i32::MAX)),
        );
        let properties = set_header(
            properties,
            EXCEPTION_ROOT_CAUSE_HEADER,
            AMQPValue::LongString(LongString::from(failure.root_cause().to_string())),
        );
        let properties = set_header(
            properties,
            EXCEPTION_STACKTRACE_HEADER,
            AMQPValue::LongString(LongString::from(format!("{failure:?}"))),
        );

        channel
            .ack(delivery.delivery_tag)
            .await
            .map_err(|source| RedeliveryError::Ack {
                delivery_tag: delivery.delivery_tag,
                source,
            })?;

        self.publisher
            .publish_raw(
                &delivery.data,
                &exchange,
                delivery.routing_key.as_str(),
                properties,
            )
            .await
            .map_err(|source| RedeliveryError::Publish {
                delivery_tag: delivery.delivery_tag,
                exchange,
                source,
            })?;

        Ok(RedeliveryOutcome::Retrying { retry_count })
    }
}

/// The `x-retries` header of `delivery`, zero when missing, negative or unreadable.
pub fn retry_count(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .get_header_int(RETRIES_HEADER)
        .map(|count| u32::try_from(count.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

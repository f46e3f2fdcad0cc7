use anyhow::Context;
use tracing::info;

use crate::amqp::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use crate::amqp::types::{AMQPValue, FieldTable, LongString};
use crate::amqp::ExchangeKind;
use crate::broker::BrokerChannel;

use super::QueueTopology;

pub(crate) const MESSAGE_TTL_ARGUMENT: &str = "x-message-ttl";
pub(crate) const DEAD_LETTER_EXCHANGE_ARGUMENT: &str = "x-dead-letter-exchange";

/// Declare the exchanges, queues and bindings described by `topology`.
///
/// In order:
/// 1. the dead-letter exchange and queue, if enabled;
/// 2. the main exchange and queue, dead-lettering to the dead-letter exchange if enabled;
/// 3. the parking-lot exchange and queue, if enabled. The parking-lot queue holds messages for
///    `ttl_ms` and then dead-letters them back to the main exchange.
///
/// Everything is durable. Declarations are idempotent, but AMQP queue arguments are immutable:
/// changing the dead-letter or parking-lot settings of an existing queue requires rolling a new
/// queue.
#[tracing::instrument(name = "declare_topology", skip_all, fields(queue_name = %topology.queue_name))]
pub async fn declare<C: BrokerChannel>(
    channel: &C,
    topology: &QueueTopology,
) -> Result<(), anyhow::Error> {
    let kind = topology.exchange.exchange_kind();

    if topology.dead_letter.enabled {
        let exchange = topology.dead_letter_exchange_name();
        let queue = topology.dead_letter_queue_name();
        declare_exchange(channel, &exchange, &kind).await?;
        declare_queue(channel, &queue, FieldTable::default()).await?;
        bind_queue(channel, &queue, &exchange, &topology.routing_keys).await?;
    }

    let mut main_arguments = FieldTable::default();
    if topology.dead_letter.enabled {
        main_arguments.insert(
            DEAD_LETTER_EXCHANGE_ARGUMENT.into(),
            long_string(topology.dead_letter_exchange_name()),
        );
    }
    declare_exchange(channel, &topology.exchange.name, &kind).await?;
    declare_queue(channel, &topology.queue_name, main_arguments).await?;
    bind_queue(
        channel,
        &topology.queue_name,
        &topology.exchange.name,
        &topology.routing_keys,
    )
    .await?;

    if topology.parking_lot.enabled {
        let exchange = topology.parking_lot_exchange_name();
        let queue = topology.parking_lot_queue_name();
        let mut arguments = FieldTable::default();
        arguments.insert(
            MESSAGE_TTL_ARGUMENT.into(),
            AMQPValue::LongInt(topology.parking_lot.ttl_ms),
        );
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARGUMENT.into(),
            long_string(topology.exchange.name.clone()),
        );
        declare_exchange(channel, &exchange, &kind).await?;
        declare_queue(channel, &queue, arguments).await?;
        bind_queue(channel, &queue, &exchange, &topology.routing_keys).await?;
    }

    Ok(())
}

fn long_string(value: String) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

async fn declare_exchange<C: BrokerChannel>(
    channel: &C,
    name: &str,
    kind: &ExchangeKind,
) -> Result<(), anyhow::Error> {
    // The default exchange always exists and cannot be declared.
    if name.trim().is_empty() {
        return Ok(());
    }
    info!(exchange = name, ?kind, "Declaring exchange");
    channel
        .declare_exchange(
            name,
            kind.clone(),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("Failed to declare exchange {name}"))
}

async fn declare_queue<C: BrokerChannel>(
    channel: &C,
    name: &str,
    arguments: FieldTable,
) -> Result<(), anyhow::Error> {
    info!(queue = name, "Declaring queue");
    channel
        .declare_queue(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            arguments,
        )
        .await
        .with_context(|| format!("Failed to declare queue {name}"))
}

async fn bind_queue<C: BrokerChannel>(
    channel: &C,
    queue: &str,
    exchange: &str,
    routing_keys: &[String],
) -> Result<(), anyhow::Error> {
    if exchange.trim().is_empty() || routing_keys.is_empty() {
        return Ok(());
    }
    info!(queue, exchange, ?routing_keys, "Binding queue");
    for routing_key in routing_keys {
        channel
            .bind_queue(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| {
                format!("Failed to bind queue {queue} to exchange {exchange} with key {routing_key}")
            })?;
    }
    Ok(())
}

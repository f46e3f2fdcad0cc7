use rabbit_lot::amqp::types::{AMQPValue, FieldTable, LongString};
use rabbit_lot::amqp::ExchangeKind;
use rabbit_lot::pool::ChannelProvider;
use rabbit_lot::topology::{declare, DeadLetterSettings, ParkingLotSettings, QueueTopology};

use crate::helpers::{get_connection_manager, FakeBroker, FakeChannel, Op};

async fn setup_channel(broker: &FakeBroker) -> FakeChannel {
    ChannelProvider::new(get_connection_manager(broker))
        .get(1)
        .await
        .unwrap()
}

/// Declarations and bindings, in the order they happened.
fn declarations(broker: &FakeBroker) -> Vec<Op> {
    broker
        .ops()
        .into_iter()
        .filter(|op| {
            matches!(
                op,
                Op::DeclareExchange { .. } | Op::DeclareQueue { .. } | Op::Bind { .. }
            )
        })
        .collect()
}

fn arguments(entries: &[(&str, AMQPValue)]) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in entries {
        table.insert((*key).into(), value.clone());
    }
    table
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.to_owned()))
}

fn exchange(name: &str) -> Op {
    Op::DeclareExchange {
        name: name.into(),
        kind: ExchangeKind::Topic,
        durable: true,
    }
}

fn queue(name: &str, arguments: FieldTable) -> Op {
    Op::DeclareQueue {
        name: name.into(),
        durable: true,
        arguments,
    }
}

fn bind(queue: &str, exchange: &str, routing_key: &str) -> Op {
    Op::Bind {
        queue: queue.into(),
        exchange: exchange.into(),
        routing_key: routing_key.into(),
    }
}

#[tokio::test]
async fn a_full_topology_is_declared_dead_letter_first_and_parking_lot_last() {
    // Arrange
    let broker = FakeBroker::default();
    let channel = setup_channel(&broker).await;
    let topology = QueueTopology::new("orders")
        .with_exchange("orders-exchange", "topic")
        .with_routing_keys(["order.created"])
        .with_dead_letter(DeadLetterSettings::enabled())
        .with_parking_lot(ParkingLotSettings::enabled().with_ttl_ms(30_000));

    // Act
    declare(&channel, &topology).await.unwrap();

    // Assert
    assert_eq!(
        declarations(&broker),
        vec![
            exchange("orders-exchange.dlx"),
            queue("orders.dlq", FieldTable::default()),
            bind("orders.dlq", "orders-exchange.dlx", "order.created"),
            exchange("orders-exchange"),
            queue(
                "orders",
                arguments(&[("x-dead-letter-exchange", long_string("orders-exchange.dlx"))])
            ),
            bind("orders", "orders-exchange", "order.created"),
            exchange("orders-exchange.plx"),
            queue(
                "orders.plq",
                arguments(&[
                    ("x-message-ttl", AMQPValue::LongInt(30_000)),
                    ("x-dead-letter-exchange", long_string("orders-exchange")),
                ])
            ),
            bind("orders.plq", "orders-exchange.plx", "order.created"),
        ]
    );
}

#[tokio::test]
async fn only_the_main_queue_is_declared_when_the_satellites_are_disabled() {
    let broker = FakeBroker::default();
    let channel = setup_channel(&broker).await;
    let topology = QueueTopology::new("orders")
        .with_exchange("orders-exchange", "topic")
        .with_routing_keys(["order.created", "order.updated"]);

    declare(&channel, &topology).await.unwrap();

    assert_eq!(
        declarations(&broker),
        vec![
            exchange("orders-exchange"),
            queue("orders", FieldTable::default()),
            bind("orders", "orders-exchange", "order.created"),
            bind("orders", "orders-exchange", "order.updated"),
        ]
    );
}

#[tokio::test]
async fn the_default_exchange_is_neither_declared_nor_bound_to() {
    let broker = FakeBroker::default();
    let channel = setup_channel(&broker).await;
    let topology = QueueTopology::new("orders").with_routing_keys(["order.created"]);

    declare(&channel, &topology).await.unwrap();

    assert_eq!(
        declarations(&broker),
        vec![queue("orders", FieldTable::default())]
    );
}

#[tokio::test]
async fn queues_are_not_bound_without_routing_keys() {
    let broker = FakeBroker::default();
    let channel = setup_channel(&broker).await;
    let topology = QueueTopology::new("orders")
        .with_exchange("orders-exchange", "topic")
        .with_parking_lot(ParkingLotSettings::enabled());

    declare(&channel, &topology).await.unwrap();

    let ops = declarations(&broker);
    assert!(!ops.iter().any(|op| matches!(op, Op::Bind { .. })));
    assert_eq!(ops.len(), 4);
}

#[tokio::test]
async fn custom_exchange_kinds_and_names_are_honoured() {
    let broker = FakeBroker::default();
    let channel = setup_channel(&broker).await;
    let topology = QueueTopology::new("orders")
        .with_exchange("orders-exchange", "Direct")
        .with_dead_letter(
            DeadLetterSettings::enabled()
                .with_queue_name("graveyard")
                .with_exchange_name("graveyard-exchange"),
        );

    declare(&channel, &topology).await.unwrap();

    let ops = declarations(&broker);
    assert_eq!(
        ops[0],
        Op::DeclareExchange {
            name: "graveyard-exchange.dlx".into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    );
    assert_eq!(ops[1], queue("graveyard.dlq", FieldTable::default()));
    assert!(ops.iter().all(|op| match op {
        Op::DeclareExchange { durable, .. } | Op::DeclareQueue { durable, .. } => *durable,
        _ => true,
    }));
}

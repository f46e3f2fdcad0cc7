use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rabbit_lot::amqp::configuration::ConfigurationError;
use rabbit_lot::amqp::convenience::{set_header, BasicPropertiesExt};
use rabbit_lot::amqp::types::AMQPValue;
use rabbit_lot::amqp::BasicProperties;
use rabbit_lot::consumers::{
    Delivery, Handler, Incoming, JsonHandler, MessageHandler, QueueWorker, RETRIES_HEADER,
};
use rabbit_lot::topology::{ParkingLotSettings, QueueTopology};
use shutdown_handler::ShutdownHandler;
use tokio::sync::RwLock;

use crate::helpers::{get_connection_manager, get_publisher, FakeBroker, Op};

#[derive(Default)]
struct Context {
    started: AtomicUsize,
    processed: Mutex<Vec<u64>>,
    // Handlers wait for a read guard: hold the write guard to keep them from completing.
    gate: RwLock<()>,
}

/// Fails on messages whose payload is `boom`.
struct OrderHandler;

#[async_trait::async_trait]
impl Handler for OrderHandler {
    type Context = Context;

    async fn handle(&self, incoming: &Incoming<Context>) -> Result<(), anyhow::Error> {
        incoming.context.started.fetch_add(1, Ordering::SeqCst);
        let _gate = incoming.context.gate.read().await;
        incoming
            .context
            .processed
            .lock()
            .unwrap()
            .push(incoming.message.delivery_tag);
        if incoming.message.data == b"boom" {
            anyhow::bail!("Failed to process order");
        }
        Ok(())
    }
}

fn orders() -> QueueTopology {
    QueueTopology::new("orders")
        .with_exchange("orders-exchange", "topic")
        .with_routing_keys(["order.created"])
        .with_prefetch_count(20)
}

fn get_worker(
    broker: &FakeBroker,
    topology: QueueTopology,
    context: Arc<Context>,
) -> QueueWorker<FakeBroker, OrderHandler> {
    let connections = get_connection_manager(broker);
    QueueWorker::new(
        connections.clone(),
        get_publisher(connections),
        topology,
        OrderHandler,
        context,
    )
    .unwrap()
}

fn order(delivery_tag: u64, payload: &str) -> Delivery {
    Delivery::new(delivery_tag, "order.created", payload)
}

/// The channels the worker consumed on.
fn consumer_channels(broker: &FakeBroker) -> Vec<usize> {
    broker
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            Op::Consume { channel, .. } => Some(channel),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn a_successfully_processed_message_is_acked() {
    // Arrange
    let broker = FakeBroker::default();
    let context = Arc::new(Context::default());
    let worker = get_worker(&broker, orders(), context.clone()).exit_after(1);
    broker.deliver(order(1, r#"{"id":1}"#));

    // Act
    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    // Assert
    assert_eq!(*context.processed.lock().unwrap(), vec![1]);
    let channel = consumer_channels(&broker)[0];
    let ops = broker.ops();
    assert!(ops.contains(&Op::Ack {
        channel,
        delivery_tag: 1
    }));
    assert!(ops.contains(&Op::Qos {
        channel,
        prefetch_count: 20
    }));
    assert!(broker.publishes().is_empty());
    assert_eq!(broker.closes_of(channel), 1);
}

#[tokio::test]
async fn the_topology_is_declared_on_a_dedicated_channel_before_consuming() {
    let broker = FakeBroker::default();
    let worker = get_worker(&broker, orders(), Arc::new(Context::default())).exit_after(1);
    broker.deliver(order(1, "{}"));

    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    let ops = broker.ops();
    let setup_channel = match ops.first() {
        Some(Op::Qos {
            channel,
            prefetch_count: 1,
        }) => *channel,
        op => panic!("Expected the setup channel's qos first, got {op:?}"),
    };
    let declared_queue = ops
        .iter()
        .position(|op| matches!(op, Op::DeclareQueue { name, .. } if name == "orders"))
        .unwrap();
    let setup_closed = ops
        .iter()
        .position(|op| *op == Op::Close { channel: setup_channel })
        .unwrap();
    let consumed = ops
        .iter()
        .position(|op| matches!(op, Op::Consume { .. }))
        .unwrap();
    assert!(declared_queue < setup_closed);
    assert!(setup_closed < consumed);
    assert_ne!(consumer_channels(&broker)[0], setup_channel);
    match &ops[consumed] {
        Op::Consume {
            queue,
            consumer_tag,
            ..
        } => {
            assert_eq!(queue, "orders");
            assert!(consumer_tag.starts_with("consumer-"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn a_failed_message_is_moved_to_the_parking_lot() {
    // Arrange
    let broker = FakeBroker::default();
    let topology = orders().with_parking_lot(ParkingLotSettings::enabled());
    let worker = get_worker(&broker, topology, Arc::new(Context::default())).exit_after(1);
    broker.deliver(order(1, "boom"));

    // Act
    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    // Assert
    let channel = consumer_channels(&broker)[0];
    assert!(broker.ops().contains(&Op::Ack {
        channel,
        delivery_tag: 1
    }));
    match broker.publishes().as_slice() {
        [Op::Publish {
            exchange,
            routing_key,
            properties,
            body,
            ..
        }] => {
            assert_eq!(exchange, "orders-exchange.plx");
            assert_eq!(routing_key, "order.created");
            assert_eq!(body, b"boom");
            assert_eq!(properties.get_header_int(RETRIES_HEADER), Some(1));
        }
        publishes => panic!("Expected a single publish, got {publishes:?}"),
    }
}

#[tokio::test]
async fn a_failed_message_without_a_parking_lot_is_rejected() {
    let broker = FakeBroker::default();
    let worker = get_worker(&broker, orders(), Arc::new(Context::default())).exit_after(2);
    broker.deliver(order(1, "boom"));
    broker.deliver(order(2, "{}"));

    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    let channel = consumer_channels(&broker)[0];
    let ops = broker.ops();
    assert!(ops.contains(&Op::Reject {
        channel,
        delivery_tag: 1,
        requeue: false
    }));
    assert!(ops.contains(&Op::Ack {
        channel,
        delivery_tag: 2
    }));
}

#[tokio::test]
async fn in_flight_messages_are_drained_on_shutdown() {
    // Arrange
    let broker = FakeBroker::default();
    let context = Arc::new(Context::default());
    let worker = get_worker(&broker, orders(), context.clone());
    for tag in 1..=3 {
        broker.deliver(order(tag, "{}"));
    }
    let shutdown = Arc::new(ShutdownHandler::new());
    // This ensures that the handlers don't complete until we want them to.
    let gate = context.gate.write().await;

    // Act
    let handle = tokio::spawn(worker.run_until_shutdown(shutdown.clone()));
    while context.started.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.shutdown();
    drop(gate);
    handle.await.unwrap().unwrap();

    // Assert
    let mut processed = context.processed.lock().unwrap().clone();
    processed.sort_unstable();
    assert_eq!(processed, vec![1, 2, 3]);
    let acks = broker
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::Ack { .. }))
        .count();
    assert_eq!(acks, 3);
    assert_eq!(broker.closes_of(consumer_channels(&broker)[0]), 1);
}

#[tokio::test]
async fn an_idle_worker_stops_on_shutdown() {
    let broker = FakeBroker::default();
    let worker = get_worker(&broker, orders(), Arc::new(Context::default()));
    let shutdown = Arc::new(ShutdownHandler::new());

    let handle = tokio::spawn(worker.run_until_shutdown(shutdown.clone()));
    broker.wait_for_consumers(1).await;
    shutdown.shutdown();

    handle.await.unwrap().unwrap();
    assert_eq!(broker.closes_of(consumer_channels(&broker)[0]), 1);
}

#[tokio::test]
async fn when_one_consumer_stops_the_others_follow() {
    // Arrange
    let broker = FakeBroker::default();
    let context = Arc::new(Context::default());
    let worker = get_worker(&broker, orders().with_consumer_count(2), context.clone());
    broker.deliver(order(1, "{}"));
    broker.end_deliveries();

    // Act
    tokio::time::timeout(
        Duration::from_secs(5),
        worker.run_until_shutdown(Arc::new(ShutdownHandler::new())),
    )
    .await
    .expect("The second consumer was never shut down")
    .unwrap();

    // Assert
    assert_eq!(*context.processed.lock().unwrap(), vec![1]);
    let channels = consumer_channels(&broker);
    assert_eq!(channels.len(), 2);
    assert_ne!(channels[0], channels[1]);
    for channel in channels {
        assert_eq!(broker.closes_of(channel), 1);
    }
}

#[tokio::test]
async fn a_worker_without_consumers_returns_immediately() {
    let broker = FakeBroker::default();
    let worker = get_worker(
        &broker,
        orders().with_consumer_count(0),
        Arc::new(Context::default()),
    );

    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    assert_eq!(broker.connect_attempts(), 0);
    assert!(broker.ops().is_empty());
}

#[test]
fn an_invalid_topology_is_refused() {
    let broker = FakeBroker::default();
    let connections = get_connection_manager(&broker);

    let outcome = QueueWorker::new(
        connections.clone(),
        get_publisher(connections),
        QueueTopology::new(""),
        OrderHandler,
        Context::default(),
    );

    assert!(matches!(outcome, Err(ConfigurationError::EmptyQueueName)));
}

#[tokio::test]
async fn a_message_that_cannot_reach_the_parking_lot_does_not_stop_the_worker() {
    // Arrange
    let broker = FakeBroker::default();
    let topology = orders().with_parking_lot(ParkingLotSettings::enabled());
    let worker = get_worker(&broker, topology, Arc::new(Context::default())).exit_after(2);
    broker.fail_publishes();
    broker.deliver(order(1, "boom"));
    broker.deliver(order(2, "{}"));

    // Act
    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    // Assert
    let channel = consumer_channels(&broker)[0];
    let ops = broker.ops();
    assert!(ops.contains(&Op::Ack {
        channel,
        delivery_tag: 1
    }));
    assert!(ops.contains(&Op::Ack {
        channel,
        delivery_tag: 2
    }));
    assert!(broker.publishes().is_empty());
}

#[derive(Debug, PartialEq, serde::Deserialize)]
struct OrderCreated {
    id: u64,
}

#[derive(Default)]
struct Orders(Mutex<Vec<(OrderCreated, HashMap<String, String>)>>);

struct OrderRecorder;

#[async_trait::async_trait]
impl MessageHandler for OrderRecorder {
    type Message = OrderCreated;
    type Context = Orders;

    async fn process(
        &self,
        message: OrderCreated,
        headers: HashMap<String, String>,
        incoming: &Incoming<Orders>,
    ) -> Result<(), anyhow::Error> {
        incoming.context.0.lock().unwrap().push((message, headers));
        Ok(())
    }
}

fn get_json_worker(
    broker: &FakeBroker,
    orders_seen: Arc<Orders>,
) -> QueueWorker<FakeBroker, JsonHandler<OrderRecorder>> {
    let connections = get_connection_manager(broker);
    QueueWorker::new(
        connections.clone(),
        get_publisher(connections),
        orders(),
        JsonHandler(OrderRecorder),
        orders_seen,
    )
    .unwrap()
}

#[tokio::test]
async fn json_messages_are_handed_over_typed_with_string_headers() {
    // Arrange
    let broker = FakeBroker::default();
    let orders_seen = Arc::new(Orders::default());
    let worker = get_json_worker(&broker, orders_seen.clone()).exit_after(1);
    let properties = set_header(BasicProperties::default(), "attempt", AMQPValue::LongInt(3));
    let properties = set_header(properties, "tenant", AMQPValue::LongString("acme".into()));
    broker.deliver(order(1, r#"{"id":42}"#).with_properties(properties));

    // Act
    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    // Assert
    let seen = orders_seen.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (message, headers) = &seen[0];
    assert_eq!(*message, OrderCreated { id: 42 });
    assert_eq!(headers.get("tenant").map(String::as_str), Some("acme"));
    assert_eq!(headers.get("attempt").map(String::as_str), Some("3"));
    let channel = consumer_channels(&broker)[0];
    assert!(broker.ops().contains(&Op::Ack {
        channel,
        delivery_tag: 1
    }));
}

#[tokio::test]
async fn a_message_that_is_not_valid_json_is_rejected() {
    let broker = FakeBroker::default();
    let orders_seen = Arc::new(Orders::default());
    let worker = get_json_worker(&broker, orders_seen.clone()).exit_after(1);
    broker.deliver(order(1, "not json"));

    worker
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    assert!(orders_seen.0.lock().unwrap().is_empty());
    let channel = consumer_channels(&broker)[0];
    assert!(broker.ops().contains(&Op::Reject {
        channel,
        delivery_tag: 1,
        requeue: false
    }));
}

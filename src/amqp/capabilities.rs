//! [`lapin`] implementations of the broker capability traits.
use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};

use crate::broker::{BrokerChannel, BrokerConnection, ShutdownObserver};
use crate::consumers::Delivery;

// AMQP 0-9-1 reply codes, see https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants
const REPLY_SUCCESS: u16 = 200;

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    type Channel = lapin::Channel;

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn create_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(lapin::Connection::create_channel(self).await?)
    }

    fn on_shutdown(&self, observer: Arc<dyn ShutdownObserver>) {
        self.on_error(move |error| observer.on_shutdown(&error.to_string()));
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::close(self, REPLY_SUCCESS, "closed by rabbit-lot").await?)
    }

    async fn enable_publisher_confirms(&self) -> Result<(), anyhow::Error> {
        Ok(self
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?)
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?)
    }

    /// Publish and, if publisher confirms are enabled on this channel, wait for the broker
    /// to confirm the message.
    ///
    /// Messages are not mandatory: a message no queue is bound for is dropped by the broker
    /// and the publish still succeeds.
    #[tracing::instrument(level = "debug", skip(self, properties, body))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), anyhow::Error> {
        let confirm = self
            .basic_publish(exchange, routing_key, publish_options(), body, properties)
            .await?
            .await?;
        confirmed(confirm)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        Ok(self.exchange_declare(name, kind, options, arguments).await?)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.queue_declare(name, options, arguments).await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        Ok(self
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<Delivery, anyhow::Error>>, anyhow::Error> {
        let consumer = self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }
}

fn publish_options() -> BasicPublishOptions {
    BasicPublishOptions {
        mandatory: false,
        // The immediate flag was dropped in RabbitMQ 3.0, setting it is a protocol error.
        immediate: false,
    }
}

fn confirmed(confirm: Confirmation) -> Result<(), anyhow::Error> {
    match confirm {
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(returned) => Err(anyhow::anyhow!(
            "The RabbitMq broker nacked the publishing of the message: {returned:?}"
        )),
    }
}

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use shutdown_handler::ShutdownHandler;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::amqp::configuration::ConfigurationError;
use crate::broker::{BrokerChannel, BrokerConnector, ChannelOf};
use crate::consumers::{Delivery, Handler, Incoming, RedeliveryHandler};
use crate::pool::{ChannelProvider, ConnectionManager};
use crate::publishers::Publisher;
use crate::topology::{self, QueueTopology};

/// Topology declarations do not need more than one delivery in flight.
const SETUP_PREFETCH_COUNT: u16 = 1;

/// Pulls messages from one queue and feeds them to a [`Handler`].
///
/// On start, the worker declares the queue's [topology](crate::topology) and then runs
/// `consumer_count` consumers, each on its own channel with the topology's `prefetch_count`.
/// Deliveries are processed concurrently: a message is acked when the handler succeeds and
/// handed to the [`RedeliveryHandler`] when it fails.
pub struct QueueWorker<F: BrokerConnector, H: Handler> {
    connections: Arc<ConnectionManager<F>>,
    redelivery: Arc<RedeliveryHandler<F>>,
    topology: Arc<QueueTopology>,
    handler: Arc<H>,
    context: Arc<H::Context>,
    exit_after: Option<usize>,
}

impl<F: BrokerConnector, H: Handler> Clone for QueueWorker<F, H> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            redelivery: Arc::clone(&self.redelivery),
            topology: Arc::clone(&self.topology),
            handler: Arc::clone(&self.handler),
            context: Arc::clone(&self.context),
            exit_after: self.exit_after,
        }
    }
}

impl<F: BrokerConnector, H: Handler> QueueWorker<F, H> {
    /// `publisher` is used to move failed messages to the parking lot.
    ///
    /// The context is wrapped in an `Arc` - if your context is already behind an `Arc` pointer,
    /// it won't be "double-wrapped".
    pub fn new(
        connections: Arc<ConnectionManager<F>>,
        publisher: Publisher<F>,
        topology: QueueTopology,
        handler: H,
        context: impl Into<Arc<H::Context>>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_shared(
            connections,
            Arc::new(RedeliveryHandler::new(publisher)),
            topology,
            Arc::new(handler),
            context.into(),
        )
    }

    /// A worker sharing its handler, context and redelivery handler with other workers.
    pub(crate) fn with_shared(
        connections: Arc<ConnectionManager<F>>,
        redelivery: Arc<RedeliveryHandler<F>>,
        topology: QueueTopology,
        handler: Arc<H>,
        context: Arc<H::Context>,
    ) -> Result<Self, ConfigurationError> {
        topology.validate()?;
        Ok(Self {
            connections,
            redelivery,
            topology: Arc::new(topology),
            handler,
            context,
            exit_after: None,
        })
    }

    /// Stop each consumer after it has received `n` deliveries.
    /// Useful in tests, when you know how many messages are going to be published.
    #[must_use]
    pub fn exit_after(mut self, n: usize) -> Self {
        self.exit_after = Some(n);
        self
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Run until SIGTERM is received or one of the consumers stops.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await
    }

    /// Run until `shutdown` is triggered or one of the consumers stops.
    ///
    /// When a consumer stops, for whatever reason, the others are shut down too.
    /// Every consumer waits for its in-flight messages before returning.
    /// The first consumer error, if any, is returned.
    #[tracing::instrument(skip_all, name = "queue_worker_run", fields(queue_name = %self.topology.queue_name))]
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), anyhow::Error> {
        if self.topology.consumer_count == 0 {
            warn!("No consumers configured, the queue worker has nothing to do");
            return Ok(());
        }

        self.setup().await?;

        let mut consumers = FuturesUnordered::from_iter(
            (0..self.topology.consumer_count)
                .map(|_| {
                    let consumer = self.clone();
                    let shutdown = shutdown.clone();
                    async move { consumer.consume(shutdown.wait_for_signal()).await }
                })
                .map(tokio::spawn),
        );

        let mut result = Ok(());
        while let Some(outcome) = consumers.next().await {
            let outcome = outcome
                .map_err(anyhow::Error::from)
                .and_then(|consumed| consumed);
            if let Err(e) = outcome {
                error!(error = ?e, "Consumer failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            shutdown.shutdown();
        }
        result
    }

    async fn setup(&self) -> Result<(), anyhow::Error> {
        let provider = ChannelProvider::new(Arc::clone(&self.connections));
        let declared = match provider.get(SETUP_PREFETCH_COUNT).await {
            Ok(channel) => topology::declare(&channel, &self.topology).await,
            Err(e) => Err(e.into()),
        };
        provider.close().await;
        declared
    }

    async fn consume(self, shutdown: impl Future<Output = ()>) -> Result<(), anyhow::Error> {
        let provider = ChannelProvider::new(Arc::clone(&self.connections));
        let result = self.consume_on(&provider, shutdown).await;
        provider.close().await;
        result
    }

    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.topology.queue_name))]
    async fn consume_on(
        &self,
        provider: &ChannelProvider<F>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        let channel = provider.get(self.topology.prefetch_count).await?;
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let mut deliveries = channel
            .consume(&self.topology.queue_name, &consumer_tag)
            .await?;
        info!(consumer_tag, "Started consuming messages");

        let mut in_flight = FuturesUnordered::new();
        let mut counter = 0;
        tokio::pin!(shutdown);

        let result = 'event_loop: loop {
            if self.exit_after == Some(counter) {
                break 'event_loop Ok(());
            }

            tokio::select! {
                // prefer the handling of shutdowns over processing more deliveries
                biased;

                _ = &mut shutdown => {
                    info!("Queue worker received shutdown event");
                    break 'event_loop Ok(());
                }

                _ = in_flight.next(), if !in_flight.is_empty() => {}

                delivery = deliveries.next() => {
                    match delivery {
                        None => {
                            warn!(consumer_tag, "The delivery stream has ended");
                            break 'event_loop Ok(());
                        }
                        Some(Err(e)) => {
                            error!(error = ?e, "Consumer error");
                            break 'event_loop Err(e);
                        }
                        Some(Ok(delivery)) => {
                            // Each delivery gets its own task: up to `prefetch_count` messages are
                            // processed concurrently, and a panic only takes one message down.
                            let process = self.clone().process(channel.clone(), delivery);
                            in_flight.push(tokio::spawn(process));
                            counter += 1;
                        }
                    }
                }
            }
        };

        // If the set is empty, this returns immediately.
        while in_flight.next().await.is_some() {}

        result
    }

    /// Hand a delivery to the handler, then settle it with the broker.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(delivery_tag = delivery.delivery_tag),
        level = tracing::Level::DEBUG
    )]
    async fn process(self, channel: ChannelOf<F>, delivery: Delivery) {
        debug!("Message received");
        let delivery_tag = delivery.delivery_tag;
        let incoming = Incoming {
            context: Arc::clone(&self.context),
            message: delivery,
            queue_name: self.topology.queue_name.clone(),
        };

        match self.handler.handle(&incoming).await {
            Ok(()) => {
                if let Err(e) = channel.ack(delivery_tag).await {
                    error!(error = ?e, delivery_tag, "Failed to ack the message");
                }
            }
            Err(failure) => {
                warn!(error = ?failure, delivery_tag, "Failed to process the message");
                if let Err(e) = self
                    .redelivery
                    .handle(&self.topology, &channel, &incoming.message, &failure)
                    .await
                {
                    // The redelivery handler logs the delivery details, the loop goes on.
                    debug!(error = ?e, delivery_tag, "The failed message could not be redelivered");
                }
            }
        }
    }
}

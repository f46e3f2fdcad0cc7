use std::sync::Arc;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use shutdown_handler::ShutdownHandler;
use tracing::{error, info, warn};

use crate::broker::BrokerConnector;
use crate::consumers::{Handler, QueueWorker, RedeliveryHandler};
use crate::pool::ConnectionManager;
use crate::publishers::Publisher;
use crate::topology::QueueTopology;

/// Where a [`MultiQueueWorker`] gets the queues it consumes from.
///
/// The queues are loaded once, when the worker starts.
#[async_trait::async_trait]
pub trait QueueProvider: Send + Sync + 'static {
    async fn queues(&self) -> Result<Vec<QueueTopology>, anyhow::Error>;
}

#[async_trait::async_trait]
impl QueueProvider for Vec<QueueTopology> {
    async fn queues(&self) -> Result<Vec<QueueTopology>, anyhow::Error> {
        Ok(self.clone())
    }
}

/// Feeds the messages of several queues to the same [`Handler`].
///
/// Each queue gets a [`QueueWorker`]: its topology is declared, then its consumers start.
/// All workers share the handler, the context and the shutdown signal.
pub struct MultiQueueWorker<F: BrokerConnector, H: Handler, P: QueueProvider> {
    connections: Arc<ConnectionManager<F>>,
    redelivery: Arc<RedeliveryHandler<F>>,
    queue_provider: P,
    handler: Arc<H>,
    context: Arc<H::Context>,
}

impl<F: BrokerConnector, H: Handler, P: QueueProvider> MultiQueueWorker<F, H, P> {
    /// `publisher` is used to move failed messages to the parking lot of their queue.
    pub fn new(
        connections: Arc<ConnectionManager<F>>,
        publisher: Publisher<F>,
        queue_provider: P,
        handler: H,
        context: impl Into<Arc<H::Context>>,
    ) -> Self {
        Self {
            connections,
            redelivery: Arc::new(RedeliveryHandler::new(publisher)),
            queue_provider,
            handler: Arc::new(handler),
            context: context.into(),
        }
    }

    /// Run until SIGTERM is received or one of the consumers stops.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await
    }

    /// Run until `shutdown` is triggered or one of the consumers stops.
    ///
    /// Every topology is validated before any queue is set up: a single invalid topology fails
    /// the whole worker. When a queue worker stops, the others are shut down too, and the first
    /// error, if any, is returned.
    #[tracing::instrument(skip_all, name = "multi_queue_worker_run")]
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), anyhow::Error> {
        let topologies = self
            .queue_provider
            .queues()
            .await
            .context("Failed to load the queue topologies")?;
        if topologies.is_empty() {
            warn!("No queues configured, the multi-queue worker has nothing to do");
            return Ok(());
        }

        let workers = topologies
            .into_iter()
            .map(|topology| {
                QueueWorker::with_shared(
                    Arc::clone(&self.connections),
                    Arc::clone(&self.redelivery),
                    topology,
                    Arc::clone(&self.handler),
                    Arc::clone(&self.context),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(queues = workers.len(), "Starting the queue workers");

        let mut running = FuturesUnordered::from_iter(
            workers
                .into_iter()
                .map(|worker| worker.run_until_shutdown(shutdown.clone()))
                .map(tokio::spawn),
        );

        let mut result = Ok(());
        while let Some(outcome) = running.next().await {
            let outcome = outcome
                .map_err(anyhow::Error::from)
                .and_then(|worked| worked);
            if let Err(e) = outcome {
                error!(error = ?e, "Queue worker failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            shutdown.shutdown();
        }
        result
    }
}

//! The exchange or queue behind a typed publisher, declared before the first message goes out.
use anyhow::Context;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::amqp::configuration::ConfigurationError;
use crate::amqp::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use crate::amqp::types::FieldTable;
use crate::broker::{BrokerChannel, BrokerConnector};
use crate::pool::ChannelPool;
use crate::publishers::PublisherError;
use crate::topology::parse_exchange_kind;

const DEFAULT_EXCHANGE_KIND: &str = "topic";

/// Something a typed publisher can declare on the broker.
#[async_trait::async_trait]
pub trait Destination: Send + Sync + 'static {
    fn validate(&self) -> Result<(), ConfigurationError>;

    async fn declare<C: BrokerChannel>(&self, channel: &C) -> Result<(), anyhow::Error>;
}

/// How to declare the exchange an [`ExchangePublisher`](crate::publishers::ExchangePublisher)
/// publishes to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExchangeDeclaration {
    pub name: String,
    /// `topic`, `direct`, `fanout`, `headers` or the name of a plugin-provided exchange type.
    #[serde(default = "default_exchange_kind")]
    pub kind: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// Only check that the exchange exists.
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub nowait: bool,
    #[serde(default)]
    pub arguments: FieldTable,
}

fn default_exchange_kind() -> String {
    DEFAULT_EXCHANGE_KIND.to_owned()
}

fn default_durable() -> bool {
    true
}

impl ExchangeDeclaration {
    /// A durable topic exchange.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_exchange_kind(),
            durable: true,
            auto_delete: false,
            passive: false,
            nowait: false,
            arguments: FieldTable::default(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    #[must_use]
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }
}

#[async_trait::async_trait]
impl Destination for ExchangeDeclaration {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyExchangeName);
        }
        if self.kind.trim().is_empty() {
            return Err(ConfigurationError::EmptyExchangeKind);
        }
        Ok(())
    }

    async fn declare<C: BrokerChannel>(&self, channel: &C) -> Result<(), anyhow::Error> {
        info!(exchange = %self.name, kind = %self.kind, "Creating exchange");
        channel
            .declare_exchange(
                &self.name,
                parse_exchange_kind(&self.kind),
                ExchangeDeclareOptions {
                    passive: self.passive,
                    durable: self.durable,
                    auto_delete: self.auto_delete,
                    internal: false,
                    nowait: self.nowait,
                },
                self.arguments.clone(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {}", self.name))
    }
}

/// How to declare the queue a [`QueuePublisher`](crate::publishers::QueuePublisher) publishes to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// Only check that the queue exists.
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub nowait: bool,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    /// A durable, shared queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
            nowait: false,
            arguments: FieldTable::default(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    #[must_use]
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }
}

#[async_trait::async_trait]
impl Destination for QueueDeclaration {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName);
        }
        Ok(())
    }

    async fn declare<C: BrokerChannel>(&self, channel: &C) -> Result<(), anyhow::Error> {
        info!(queue = %self.name, "Creating queue");
        channel
            .declare_queue(
                &self.name,
                QueueDeclareOptions {
                    passive: self.passive,
                    durable: self.durable,
                    exclusive: self.exclusive,
                    auto_delete: self.auto_delete,
                    nowait: self.nowait,
                },
                self.arguments.clone(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {}", self.name))
    }
}

/// A destination plus whether the publisher should declare it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PublisherSettings<D> {
    pub destination: D,
    /// Declare the destination before the first publish. When off, it must already exist.
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,
}

fn default_auto_create() -> bool {
    true
}

impl<D> PublisherSettings<D> {
    pub fn new(destination: D) -> Self {
        Self {
            destination,
            auto_create: true,
        }
    }

    #[must_use]
    pub fn without_auto_create(mut self) -> Self {
        self.auto_create = false;
        self
    }
}

/// Declares a destination at most once, the first time it is needed.
///
/// Concurrent first publishes wait for the same declaration. A failed declaration is retried
/// by the next publish.
pub(crate) struct AutoDeclare<D> {
    settings: PublisherSettings<D>,
    declared: OnceCell<()>,
}

impl<D: Destination> AutoDeclare<D> {
    pub(crate) fn new(settings: PublisherSettings<D>) -> Result<Self, ConfigurationError> {
        settings.destination.validate()?;
        Ok(Self {
            settings,
            declared: OnceCell::new(),
        })
    }

    pub(crate) fn destination(&self) -> &D {
        &self.settings.destination
    }

    pub(crate) async fn ensure_declared<F: BrokerConnector>(
        &self,
        pool: &ChannelPool<F>,
    ) -> Result<(), PublisherError> {
        if !self.settings.auto_create {
            return Ok(());
        }
        self.declared
            .get_or_try_init(|| async {
                let channel = pool.borrow().await?;
                let declared = self.settings.destination.declare(&*channel).await;
                channel.release().await;
                declared.map_err(|e| {
                    error!(error = ?e, "Error while trying to create the publisher's destination");
                    PublisherError::Declaration(e)
                })
            })
            .await?;
        Ok(())
    }
}

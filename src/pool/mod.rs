//! Connection and channel management.
//!
//! - [`ConnectionManager`] keeps one connection per [`ConnectionRole`], established lazily with
//!   bounded exponential backoff and replaced after the broker shuts it down.
//! - [`ChannelPool`] bounds and recycles the channels used to publish.
//! - [`ChannelProvider`] owns the single, long-lived channel of a consumer.
//!
//! ```rust
//! use std::sync::Arc;
//! use rabbit_lot::amqp::ConnectionFactory;
//! use rabbit_lot::amqp::configuration::{ChannelPoolSettings, RabbitMqSettings};
//! use rabbit_lot::pool::{ChannelPool, ChannelProvider, ConnectionManager};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!
//!     // connections are shared by the pool and by every consumer.
//!     let connections = Arc::new(ConnectionManager::new(
//!         ConnectionFactory::new_from_config(&settings)?,
//!         settings.retry_policy()?,
//!     ));
//!
//!     let pool = ChannelPool::new(
//!         Arc::clone(&connections),
//!         ChannelPoolSettings::default().with_max_size(16),
//!     )?;
//!     let publishing_channel = pool.borrow().await?;
//!     publishing_channel.release().await;
//!
//!     let provider = ChannelProvider::new(connections);
//!     let _consuming_channel = provider.get(250).await?;
//!     provider.close().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
mod provider;

pub use channel::{ChannelPool, PooledChannel};
pub use connection::{ConnectionManager, ConnectionRole, RetryPolicy};
pub use error::Error;
pub use provider::ChannelProvider;

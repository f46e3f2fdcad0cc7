//! One lazily-established, shared connection per [`ConnectionRole`].
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::amqp::configuration::ConfigurationError;
use crate::broker::{BrokerConnection, BrokerConnector, ConnectError, ShutdownObserver};

use super::Error;

/// What a connection is used for.
///
/// Consumers and publishers never share a connection: a publisher-side flow-control block
/// must not stall consumers, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Consumer,
    Publisher,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer => write!(f, "consumer"),
            Self::Publisher => write!(f, "publisher"),
        }
    }
}

/// Bounded exponential backoff for connection attempts.
///
/// The first attempt is made immediately. If it fails with a retryable error, it is retried up
/// to `max_retry_attempts` times, the n-th retry waiting `delay_multiplier ^ n` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retry_attempts: u16,
    delay_multiplier: u16,
}

impl RetryPolicy {
    pub fn new(max_retry_attempts: u16, delay_multiplier: u16) -> Result<Self, ConfigurationError> {
        if delay_multiplier == 0 {
            return Err(ConfigurationError::InvalidDelayMultiplier);
        }
        Ok(Self {
            max_retry_attempts,
            delay_multiplier,
        })
    }

    /// Never retry: the first failure is final.
    pub fn no_retries() -> Self {
        Self {
            max_retry_attempts: 0,
            delay_multiplier: 1,
        }
    }

    pub fn max_retry_attempts(&self) -> u16 {
        self.max_retry_attempts
    }

    /// How long to wait before the `retry`-th retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_secs(u64::from(self.delay_multiplier).saturating_pow(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            delay_multiplier: 2,
        }
    }
}

/// `ConnectionManager` owns at most one live connection per [`ConnectionRole`].
///
/// Connections are established on first demand and reused until they report themselves closed
/// or the broker shuts them down; the next [`ConnectionManager::acquire`] then replaces them.
///
/// Roles are independent: a consumer connection stuck in backoff does not hold up publishers.
pub struct ConnectionManager<F: BrokerConnector> {
    connector: F,
    retry_policy: RetryPolicy,
    consumer: RoleSlot<F::Connection>,
    publisher: RoleSlot<F::Connection>,
}

struct RoleSlot<C> {
    cached: RwLock<Option<CachedConnection<C>>>,
    /// Held for the whole connect-with-retries sequence: one attempt in flight per role.
    connect_lock: Mutex<()>,
}

struct CachedConnection<C> {
    connection: Arc<C>,
    shut_down: Arc<AtomicBool>,
}

impl<C: BrokerConnection> RoleSlot<C> {
    fn new() -> Self {
        Self {
            cached: RwLock::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    fn live(&self) -> Option<Arc<C>> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| !c.shut_down.load(Ordering::Acquire) && c.connection.is_open())
            .map(|c| Arc::clone(&c.connection))
    }
}

/// Flags a cached connection for replacement when the broker shuts it down.
///
/// Reconnection stays lazy: it happens on the next `acquire` for the role.
struct MarkForReplacement {
    role: ConnectionRole,
    shut_down: Arc<AtomicBool>,
}

impl ShutdownObserver for MarkForReplacement {
    fn on_shutdown(&self, reason: &str) {
        warn!(role = %self.role, reason, "RabbitMQ connection has been shut down");
        self.shut_down.store(true, Ordering::Release);
    }
}

impl<F: BrokerConnector> ConnectionManager<F> {
    pub fn new(connector: F, retry_policy: RetryPolicy) -> Self {
        Self {
            connector,
            retry_policy,
            consumer: RoleSlot::new(),
            publisher: RoleSlot::new(),
        }
    }

    fn slot(&self, role: ConnectionRole) -> &RoleSlot<F::Connection> {
        match role {
            ConnectionRole::Consumer => &self.consumer,
            ConnectionRole::Publisher => &self.publisher,
        }
    }

    /// Get the live connection for `role`, establishing it if needed.
    ///
    /// Concurrent callers for the same role share a single connection attempt.
    /// Dropping the returned future cancels the attempt, including any backoff wait.
    pub async fn acquire(&self, role: ConnectionRole) -> Result<Arc<F::Connection>, Error> {
        let slot = self.slot(role);
        if let Some(connection) = slot.live() {
            return Ok(connection);
        }

        let _guard = slot.connect_lock.lock().await;
        // Somebody else may have connected while we were waiting for the lock.
        if let Some(connection) = slot.live() {
            return Ok(connection);
        }

        let connection = Arc::new(self.connect_with_retries(role).await?);
        let shut_down = Arc::new(AtomicBool::new(false));
        connection.on_shutdown(Arc::new(MarkForReplacement {
            role,
            shut_down: Arc::clone(&shut_down),
        }));
        *slot.cached.write() = Some(CachedConnection {
            connection: Arc::clone(&connection),
            shut_down,
        });
        Ok(connection)
    }

    #[tracing::instrument(name = "connection_manager_connect", skip(self))]
    async fn connect_with_retries(&self, role: ConnectionRole) -> Result<F::Connection, Error> {
        let mut retry = 0u32;
        loop {
            info!(attempt = retry + 1, "Attempting to connect to RabbitMQ...");
            match self.connector.connect().await {
                Ok(connection) => {
                    info!("Successfully connected to RabbitMQ.");
                    return Ok(connection);
                }
                Err(e)
                    if e.is_retryable()
                        && retry < u32::from(self.retry_policy.max_retry_attempts) =>
                {
                    retry += 1;
                    let delay = self.retry_policy.delay(retry);
                    warn!(error = ?e, retry, ?delay, "Failed to connect to RabbitMQ, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(Self::establishment_failure(role, retry + 1, e)),
            }
        }
    }

    fn establishment_failure(role: ConnectionRole, attempts: u32, source: ConnectError) -> Error {
        Error::ConnectionEstablishmentFailure {
            role,
            attempts,
            source,
        }
    }
}

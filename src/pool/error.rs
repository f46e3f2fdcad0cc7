use std::time::Duration;

use crate::broker::ConnectError;
use crate::pool::ConnectionRole;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The retry budget was exhausted, or the failure was not worth retrying.
    #[error("Failed to establish a {role} connection to RabbitMq after {attempts} attempt(s)")]
    ConnectionEstablishmentFailure {
        role: ConnectionRole,
        attempts: u32,
        #[source]
        source: ConnectError,
    },
    /// No channel became available within the configured borrow timeout.
    #[error("Timed out after {0:?} waiting for a channel from the pool")]
    BorrowTimeout(Duration),
    /// The live-channel count disagrees with the admission semaphore.
    ///
    /// This is an invariant violation - it is never expected in correct operation.
    #[error("The channel pool is exhausted (max size: {max_size}) although a slot was granted")]
    PoolExhausted { max_size: usize },
    /// The pool has been shut down.
    #[error("The channel pool has been closed")]
    PoolClosed,
    #[error("Failed to open a new channel")]
    ChannelCreation(#[source] anyhow::Error),
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}

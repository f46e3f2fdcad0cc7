//! Facilities to consume messages from RabbitMq queues. Check out [`QueueWorker`] as a starting
//! point, and [`MultiQueueWorker`] to serve several queues with the same handler.
mod handler;
mod incoming_message;
mod multi_queue;
mod redelivery;
mod worker;

pub use handler::{Handler, JsonHandler, MessageHandler};
pub use incoming_message::{Delivery, Incoming};
pub use multi_queue::{MultiQueueWorker, QueueProvider};
pub use redelivery::{
    retry_count, RedeliveryError, RedeliveryHandler, RedeliveryOutcome,
    EXCEPTION_ROOT_CAUSE_HEADER, EXCEPTION_STACKTRACE_HEADER, RETRIES_HEADER,
};
pub use worker::QueueWorker;

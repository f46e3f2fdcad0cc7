//! `rabbit-lot` is a resource-management and failure-handling layer for RabbitMQ, built on top
//! of [`lapin`].
//!
//! - [`pool`] keeps one connection per role (consumers, publishers), re-established with bounded
//!   exponential backoff, and hands out channels through a bounded [`ChannelPool`](pool::ChannelPool)
//!   or a long-lived [`ChannelProvider`](pool::ChannelProvider).
//! - [`consumers`] runs handlers against a queue and routes failed messages through a
//!   _parking lot_: a holding queue that re-delivers them after a delay, up to a maximum number
//!   of attempts, before they are dead-lettered for good.
//! - [`topology`] declares the main, dead-letter and parking-lot exchanges and queues.
//! - [`publishers`] publishes messages over the channel pool.
//!
//! The pool and the redelivery logic are written against the capability traits in [`broker`],
//! implemented for [`lapin`] in [`amqp`].

pub mod amqp;
pub mod broker;
pub mod consumers;
pub mod pool;
pub mod publishers;
pub mod topology;

//! Helpers for connecting to a rabbitmq broker, and the [`lapin`] implementations of the
//! [broker capabilities](crate::broker).

mod capabilities;
pub mod configuration;
pub mod convenience;
mod factory;
pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection, ExchangeKind};

pub use lapin::{options, types, BasicProperties};

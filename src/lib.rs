// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rabbitha
//!
//! A resilient publish/consume adapter over a RabbitMQ topic exchange.
//!
//! - [`consume`] starts a supervised subscription on the input queue. Setup failures are
//!   handed to the handler and retried after a fixed delay, forever; connection faults
//!   after the subscription is active are retried the same way.
//! - [`publish`] sends one persistent message under the output routing key on a fresh
//!   connection.
//!
//! Both are thin wrappers over [`supervisor::Supervisor`] and [`publisher::Publisher`]
//! built on the lapin client in [`channel`].

mod dispatcher;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod supervisor;
pub mod topology;

pub use config::{AckMode, BrokerConfig};
pub use errors::AmqpError;
pub use handler::{handler_fn, ConsumeHandler};
pub use message::Message;
pub use publisher::Publisher;
pub use supervisor::{Supervisor, SupervisorHandle};

use channel::LapinBroker;
use std::sync::Arc;

/// Starts the resilient delivery loop on the broker described by `config`.
///
/// Must be called from within a tokio runtime.
///
/// # Parameters
/// * `config` - Broker url, exchange and input queue; validated before anything starts
/// * `handler` - Receives `Ok(message)` per delivery and `Err(error)` per failed setup
///
/// # Returns
/// A handle that stops the loop, or the configuration error
pub fn consume(
    config: BrokerConfig,
    handler: Arc<dyn ConsumeHandler>,
) -> Result<SupervisorHandle, AmqpError> {
    Supervisor::new(config, LapinBroker::new()).start(handler)
}

/// Publishes one message under the configured output routing key.
///
/// # Parameters
/// * `config` - Broker url, exchange and output routing key
/// * `message` - The raw payload
///
/// # Returns
/// `Ok(())` once the broker accepted the publish, otherwise the first failure
pub async fn publish(config: BrokerConfig, message: &[u8]) -> Result<(), AmqpError> {
    Publisher::new(config, LapinBroker::new())
        .publish(message)
        .await
}

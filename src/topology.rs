// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares the exchange, queue and binding the adapter relies on. Declarations are
//! idempotent on the broker side, so the topology is installed again on every restart.
//!
//! Installation runs strictly in order: exchanges, then queues, then queue bindings.
//! The first failure aborts the installation.

use crate::{
    broker::BrokerChannel,
    config::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// An ordered set of declarations to install on a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology.
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// The consume-side layout: a durable topic exchange, the durable input queue, and
    /// the binding between them on the input routing key.
    pub fn consumer(cfg: &BrokerConfig) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(ExchangeDefinition::new(&cfg.exchange).topic().durable())
            .queue(QueueDefinition::new(&cfg.input_queue.name).durable())
            .queue_binding(
                QueueBinding::new(&cfg.input_queue.name)
                    .exchange(&cfg.exchange)
                    .routing_key(&cfg.input_queue.routing_key),
            )
    }

    /// The publish-side layout: the durable topic exchange only.
    pub fn publisher(cfg: &BrokerConfig) -> AmqpTopology {
        AmqpTopology::new().exchange(ExchangeDefinition::new(&cfg.exchange).topic().durable())
    }

    /// Adds an exchange, declared before any queue.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue, declared after the exchanges.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a binding, installed once every exchange and queue exists.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology on the given channel.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            let declared = channel.queue_declare(def).await?;
            debug!("queue: {} was created", declared);
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

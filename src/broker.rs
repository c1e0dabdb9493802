// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seam
//!
//! The supervisor and the publisher only talk to the broker through these traits. The
//! production implementation lives in [`crate::channel`] and is backed by lapin; tests
//! substitute mocks or an in-memory broker.

use crate::{
    config::{AckMode, ConnectionOptions},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Message, PublishProperties},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Stream of deliveries for one subscription. An `Err` item or the end of the stream
/// means the subscription is gone.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// Callback fired when the connection fails asynchronously (socket closed, missed
/// heartbeats).
pub type FaultHook = Box<dyn FnMut(AmqpError) + Send + 'static>;

/// Opens connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        opts: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// An open session to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers the callback for asynchronous connection failures. Registering again
    /// replaces the previous callback.
    fn on_error(&self, hook: FaultHook);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A command context scoped to one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns the name the broker assigned to it.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Hands one message to the channel. Returns once the channel accepted it; no
    /// publisher confirm is awaited.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

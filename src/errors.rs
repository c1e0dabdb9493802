// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient Adapter
//!
//! `AmqpError` represents every failure the adapter can observe: setup failures on the
//! consume path (connect, channel, topology, subscription), asynchronous transport faults
//! after a subscription is active, and one-shot publish failures.
//!
//! The consume path never returns these to the host process; they are handed to the
//! registered handler and logged. The publish path returns them to the caller once.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The configured broker URL could not be parsed
    #[error("invalid broker uri `{0}`")]
    InvalidUriError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The connection or the delivery stream failed after the subscription was active
    #[error("transport failure: {0}")]
    TransportError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error parsing or serializing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// A required configuration field is missing or malformed
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// The handler panicked while processing an outcome
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// `start` was called on a supervisor whose delivery loop is already running
    #[error("a delivery loop is already running")]
    AlreadyConsuming,
}

impl AmqpError {
    /// Whether the error was raised asynchronously by the transport rather than by a
    /// specific setup step.
    pub fn is_transport(&self) -> bool {
        matches!(self, AmqpError::TransportError(_))
    }
}

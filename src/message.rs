// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered and Outgoing Messages
//!
//! `Message` is what the consume handler receives: the payload, the delivery metadata
//! and the capability to acknowledge it. `PublishProperties` carries what the publisher
//! attaches to an outgoing message.

use crate::{errors::AmqpError, otel};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::debug;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Acknowledges a single delivery on the channel that received it.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Confirms the delivery; the broker removes it from the queue.
    async fn ack(&self) -> Result<(), AmqpError>;
    /// Rejects the delivery, putting it back on the queue when `requeue` is set.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered from the input queue.
pub struct Message {
    /// Raw payload
    pub data: Vec<u8>,
    /// Channel-scoped tag identifying the delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// String-valued AMQP headers, including trace propagation keys
    pub headers: BTreeMap<String, String>,
    acker: Option<Arc<dyn DeliveryAcker>>,
}

impl Message {
    /// Creates a message with empty routing metadata and no acker.
    ///
    /// # Parameters
    /// * `data` - The payload
    /// * `delivery_tag` - The tag the broker assigned to the delivery
    pub fn new(data: Vec<u8>, delivery_tag: u64) -> Message {
        Message {
            data,
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            message_id: None,
            content_type: None,
            headers: BTreeMap::new(),
            acker: None,
        }
    }

    /// Sets the exchange the message was published to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Sets the routing key the message was published with.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Marks the message as previously delivered and not acknowledged.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Sets the publisher-assigned message id.
    pub fn message_id(mut self, id: Option<String>) -> Self {
        self.message_id = id;
        self
    }

    /// Sets the MIME type of the payload.
    pub fn content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Replaces the headers.
    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Attaches the acknowledgment capability. Messages consumed in auto-ack mode have
    /// none, and acknowledging them is a no-op.
    pub fn with_acker(mut self, acker: Arc<dyn DeliveryAcker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Whether the broker waits for an ack or nack of this delivery.
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledges the delivery. A no-op for auto-ack deliveries.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => {
                debug!(delivery_tag = self.delivery_tag, "auto-ack delivery, ack skipped");
                Ok(())
            }
        }
    }

    /// Negatively acknowledges the delivery. A no-op for auto-ack deliveries.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.nack(requeue).await,
            None => {
                debug!(delivery_tag = self.delivery_tag, "auto-ack delivery, nack skipped");
                Ok(())
            }
        }
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// The OpenTelemetry context propagated by the publisher, if any.
    pub fn context(&self) -> Context {
        otel::extract_context(&self.headers)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("len", &self.data.len())
            .field("requires_ack", &self.requires_ack())
            .finish()
    }
}

/// Properties attached to an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub persistent: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl PublishProperties {
    /// Properties for a message the broker writes to disk (delivery mode 2).
    pub fn persistent() -> PublishProperties {
        PublishProperties {
            persistent: true,
            ..Default::default()
        }
    }

    /// Sets the MIME type of the payload.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the message id.
    pub fn with_message_id(mut self, id: String) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # One-shot Publisher
//!
//! Each publish opens its own connection and channel, declares the exchange, hands a
//! persistent message to the channel under the output routing key, and releases the
//! connection. Nothing is shared with the supervisor and failures are never retried.
//!
//! A successful publish means the local channel accepted the message; no publisher
//! confirm is awaited.

use crate::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection},
    config::BrokerConfig,
    dispatcher::release,
    errors::AmqpError,
    message::{PublishProperties, JSON_CONTENT_TYPE},
    otel,
    topology::AmqpTopology,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::sleep;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Runs once the exit grace delay has elapsed after a publish with `exit_on_publish`.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Publishes single messages to the configured exchange.
pub struct Publisher {
    config: Arc<BrokerConfig>,
    broker: Arc<dyn BrokerClient>,
    exit: ExitHook,
}

impl Publisher {
    /// Creates a publisher whose exit hook terminates the process successfully.
    pub fn new(config: BrokerConfig, broker: Arc<dyn BrokerClient>) -> Publisher {
        Publisher {
            config: Arc::new(config),
            broker,
            exit: Arc::new(|| {
                std::process::exit(0);
            }),
        }
    }

    /// Replaces what happens after the grace delay when `exit_on_publish` is set.
    pub fn with_exit_hook(mut self, exit: ExitHook) -> Self {
        self.exit = exit;
        self
    }

    /// Publishes `message` under the configured output routing key.
    ///
    /// Opens a fresh connection, declares the exchange and sends the message as
    /// persistent. Failures are returned once and never retried.
    ///
    /// # Parameters
    /// * `message` - The raw payload
    ///
    /// # Returns
    /// `Ok(())` when published, or the failing step's error
    pub async fn publish(&self, message: &[u8]) -> Result<(), AmqpError> {
        self.publish_with(message, PublishProperties::persistent())
            .await
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(&self, value: &T) -> Result<(), AmqpError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        self.publish_with(
            &payload,
            PublishProperties::persistent().with_content_type(JSON_CONTENT_TYPE),
        )
        .await
    }

    async fn publish_with(&self, message: &[u8], props: PublishProperties) -> Result<(), AmqpError> {
        let cfg = &self.config;
        cfg.validate_publisher()?;

        let connection = self.broker.connect(&cfg.url, &cfg.opts).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect, message not published");
            err
        })?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                release(None, &connection).await;
                return Err(err);
            }
        };

        if let Err(err) = self.send(channel.as_ref(), message, props).await {
            release(Some(&channel), &connection).await;
            return Err(err);
        }

        if cfg.exit_on_publish {
            self.schedule_exit(connection);
        } else {
            release(Some(&channel), &connection).await;
        }

        Ok(())
    }

    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        message: &[u8],
        props: PublishProperties,
    ) -> Result<(), AmqpError> {
        let cfg = &self.config;
        AmqpTopology::publisher(cfg).install(channel).await?;

        let mut headers = BTreeMap::new();
        otel::inject_context(&Context::current(), &mut headers);

        let message_id = Uuid::new_v4().to_string();
        let props = props
            .with_message_id(message_id.clone())
            .with_headers(headers);

        channel
            .basic_publish(&cfg.exchange, &cfg.output_queue.routing_key, message, &props)
            .await?;

        debug!(
            exchange = cfg.exchange,
            routing_key = cfg.output_queue.routing_key,
            message_id,
            "message published"
        );

        Ok(())
    }

    fn schedule_exit(&self, connection: Arc<dyn BrokerConnection>) {
        let grace = self.config.exit_grace_duration();
        let exit = self.exit.clone();

        info!(grace_ms = self.config.exit_grace_ms, "exiting after publish");
        tokio::spawn(async move {
            sleep(grace).await;
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "connection already closed");
            }
            exit();
        });
    }
}

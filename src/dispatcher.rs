// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Setup and Delivery Loop
//!
//! `Subscription::establish` runs the setup sequence for the consume path:
//!
//! 1. connect (and register the asynchronous fault hook)
//! 2. open a channel
//! 3. install the topology (exchange, queue, binding)
//! 4. apply the QoS prefetch when configured
//! 5. subscribe to the input queue
//!
//! Each step starts only after the previous one succeeded. A failing step releases
//! whatever was already opened before the error is returned.
//!
//! `Subscription::deliver` then forwards deliveries to the handler, one at a time and in
//! arrival order, until the subscription faults or the supervisor is cancelled. A handler
//! panic counts as a fault.

use crate::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection, DeliveryStream},
    config::BrokerConfig,
    errors::AmqpError,
    handler::{self, ConsumeHandler},
    otel,
    topology::AmqpTopology,
};
use futures_util::StreamExt;
use opentelemetry::{global, trace::Span};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Why a delivery loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The supervisor was shut down.
    Cancelled,
    /// The connection, the channel or the delivery stream failed, or the handler
    /// panicked.
    Fault(AmqpError),
}

/// An active subscription on the input queue and the resources it owns.
pub(crate) struct Subscription {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryStream,
    faults: mpsc::UnboundedReceiver<AmqpError>,
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
}

impl Subscription {
    pub(crate) async fn establish(
        broker: &dyn BrokerClient,
        cfg: &BrokerConfig,
    ) -> Result<Subscription, AmqpError> {
        let connection = broker.connect(&cfg.url, &cfg.opts).await?;

        let (fault_tx, faults) = mpsc::unbounded_channel();
        connection.on_error(Box::new(move |err| {
            let _ = fault_tx.send(err);
        }));

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                release(None, &connection).await;
                return Err(err);
            }
        };

        let (deliveries, consumer_tag) = match subscribe(channel.as_ref(), cfg).await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                release(Some(&channel), &connection).await;
                return Err(err);
            }
        };

        Ok(Subscription {
            connection,
            channel,
            deliveries,
            faults,
            queue: cfg.input_queue.name.clone(),
            consumer_tag,
        })
    }

    /// Forwards deliveries to `handler` until a fault or cancellation.
    pub(crate) async fn deliver(
        &mut self,
        handler: &Arc<dyn ConsumeHandler>,
        token: &CancellationToken,
    ) -> LoopExit {
        let tracer = global::tracer("amqp consumer");

        info!(
            queue = self.queue,
            consumer_tag = self.consumer_tag,
            "waiting for messages"
        );

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return LoopExit::Cancelled,

                Some(fault) = self.faults.recv() => return LoopExit::Fault(fault),

                next = self.deliveries.next() => match next {
                    Some(Ok(msg)) => {
                        debug!(
                            routing_key = msg.routing_key,
                            delivery_tag = msg.delivery_tag,
                            "received delivery"
                        );

                        let (_ctx, mut span) = otel::new_span(&msg.headers, &tracer, &msg.routing_key);
                        let handled = handler::invoke(handler, Ok(msg)).await;
                        span.end();

                        if let Err(err) = handled {
                            return LoopExit::Fault(err);
                        }
                    }
                    Some(Err(err)) => return LoopExit::Fault(err),
                    None => {
                        return LoopExit::Fault(AmqpError::TransportError(
                            "delivery stream closed".to_owned(),
                        ))
                    }
                },
            }
        }
    }

    /// Closes the channel and the connection. The subscription is never reused.
    pub(crate) async fn release(self) {
        release(Some(&self.channel), &self.connection).await;
    }
}

/// Installs the topology and registers the consumer.
async fn subscribe(
    channel: &dyn BrokerChannel,
    cfg: &BrokerConfig,
) -> Result<(DeliveryStream, String), AmqpError> {
    AmqpTopology::consumer(cfg).install(channel).await?;

    if let Some(prefetch) = cfg.prefetch {
        channel.basic_qos(prefetch).await?;
    }

    let consumer_tag = format!("{}-{}", cfg.input_queue.name, Uuid::new_v4());
    let deliveries = channel
        .basic_consume(&cfg.input_queue.name, &consumer_tag, cfg.ack_mode)
        .await?;

    Ok((deliveries, consumer_tag))
}

pub(crate) async fn release(
    channel: Option<&Arc<dyn BrokerChannel>>,
    connection: &Arc<dyn BrokerConnection>,
) {
    if let Some(channel) = channel {
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "channel already closed");
        }
    }

    if let Err(err) = connection.close().await {
        debug!(error = err.to_string(), "connection already closed");
    }
}

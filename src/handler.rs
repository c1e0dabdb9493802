// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Handler
//!
//! The callback the supervisor forwards deliveries and setup failures to. It receives
//! `Ok(message)` for every delivery and `Err(error)` for every failed setup attempt, and
//! is invoked again after each restart, so it must tolerate being called many times.

use crate::{errors::AmqpError, message::Message};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{any::Any, future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};

/// Receives deliveries and setup failures from the supervisor.
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    /// Processes one outcome. Calls are serialized: the next delivery is not forwarded
    /// until this future completes.
    async fn handle(&self, outcome: Result<Message, AmqpError>);
}

/// Runs the handler, turning a panic into [`AmqpError::HandlerPanicked`].
pub(crate) async fn invoke(
    handler: &Arc<dyn ConsumeHandler>,
    outcome: Result<Message, AmqpError>,
) -> Result<(), AmqpError> {
    AssertUnwindSafe(handler.handle(outcome))
        .catch_unwind()
        .await
        .map_err(|payload| AmqpError::HandlerPanicked(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Adapts an async closure into a [`ConsumeHandler`].
pub struct ClosureHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ConsumeHandler for ClosureHandler<F, Fut>
where
    F: Fn(Result<Message, AmqpError>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, outcome: Result<Message, AmqpError>) {
        (self.f)(outcome).await
    }
}

/// Wraps `f` as a shareable handler.
///
/// ```no_run
/// let handler = rabbitha::handler_fn(|outcome| async move {
///     match outcome {
///         Ok(msg) => {
///             let _ = msg.ack().await;
///         }
///         Err(err) => eprintln!("broker unavailable: {err}"),
///     }
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumeHandler>
where
    F: Fn(Result<Message, AmqpError>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(ClosureHandler {
        f,
        _fut: PhantomData,
    })
}

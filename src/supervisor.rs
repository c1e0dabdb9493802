// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Keeps a delivery subscription alive for as long as the supervisor runs. Every failure
//! leads to the same restart: wait a fixed delay, then run the whole setup sequence again
//! with the handler held in the handler slot.
//!
//! Two failure paths exist:
//!
//! - **Setup failures** (connect, channel, topology, qos, consume): logged, handed to the
//!   handler as `Err(error)`, then restarted.
//! - **Asynchronous faults** after the subscription is active (connection error hook,
//!   delivery stream error or end): logged and restarted. The handler is not called since
//!   no setup step failed.
//!
//! The delay is fixed and retries are unbounded. Only [`SupervisorHandle::shutdown`]
//! stops the loop.

use crate::{
    broker::BrokerClient,
    config::BrokerConfig,
    dispatcher::{LoopExit, Subscription},
    errors::AmqpError,
    handler::{self, ConsumeHandler},
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, RwLock,
};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where the supervisor keeps the handler it restarts with.
///
/// Written by `start`, read by both failure paths.
#[derive(Default)]
pub struct HandlerSlot {
    inner: RwLock<Option<Arc<dyn ConsumeHandler>>>,
}

impl HandlerSlot {
    /// Stores `handler`, replacing any previously registered one.
    pub fn register(&self, handler: Arc<dyn ConsumeHandler>) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// The handler restarts are performed with, if one was registered.
    pub fn current(&self) -> Option<Arc<dyn ConsumeHandler>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct SupervisorInner {
    config: BrokerConfig,
    broker: Arc<dyn BrokerClient>,
    slot: HandlerSlot,
    running: AtomicBool,
    attempts: AtomicU64,
}

/// Supervises the consume path for one input queue.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Creates an idle supervisor. Nothing connects until [`Supervisor::start`].
    ///
    /// # Parameters
    /// * `config` - Broker url, exchange, input queue and restart settings
    /// * `broker` - The client used to open connections, usually a `LapinBroker`
    ///
    /// # Returns
    /// A supervisor that can be cloned and shared; clones control the same loop
    pub fn new(config: BrokerConfig, broker: Arc<dyn BrokerClient>) -> Supervisor {
        Supervisor {
            inner: Arc::new(SupervisorInner {
                config,
                broker,
                slot: HandlerSlot::default(),
                running: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `handler` and starts the setup sequence on a new tokio task.
    ///
    /// Must be called from within a tokio runtime. Fails if the configuration lacks a
    /// consume-side field or if this supervisor is already running.
    ///
    /// # Parameters
    /// * `handler` - Receives every delivery and every setup failure
    ///
    /// # Returns
    /// A handle to stop the supervisor, or the validation error
    pub fn start(&self, handler: Arc<dyn ConsumeHandler>) -> Result<SupervisorHandle, AmqpError> {
        self.inner.config.validate_consumer()?;

        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyConsuming);
        }

        self.inner.slot.register(handler);

        let token = CancellationToken::new();
        let task = tokio::spawn(run(self.inner.clone(), token.clone()));

        Ok(SupervisorHandle { token, task })
    }

    /// Whether the supervisor task is alive, connected or waiting to restart.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of setup attempts made so far, across restarts.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// The handler currently registered in the slot.
    pub fn handler(&self) -> Option<Arc<dyn ConsumeHandler>> {
        self.inner.slot.current()
    }
}

/// Controls a running supervisor.
pub struct SupervisorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Asks the supervisor to stop. It is observed before each restart attempt, during
    /// the restart delay, during setup, and between deliveries.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Waits for the supervisor task to finish.
    pub async fn join(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "supervisor task failed");
            AmqpError::InternalError
        })
    }

    /// Shuts down and waits for the task, releasing any active subscription.
    pub async fn stop(self) -> Result<(), AmqpError> {
        self.shutdown();
        self.join().await
    }
}

/// Clears the running flag when the supervisor task ends, including by unwinding.
struct RunningGuard(Arc<SupervisorInner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

async fn run(inner: Arc<SupervisorInner>, token: CancellationToken) {
    let _running = RunningGuard(inner.clone());
    let delay = inner.config.restart_delay_duration();
    let delay_ms = inner.config.restart_delay_ms;

    loop {
        if token.is_cancelled() {
            break;
        }

        let Some(handler) = inner.slot.current() else {
            break;
        };

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "setting up the subscription");

        let setup = tokio::select! {
            _ = token.cancelled() => break,
            setup = Subscription::establish(inner.broker.as_ref(), &inner.config) => setup,
        };

        match setup {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delay_ms, "failure to set up the subscription, will restart"
                );
                if let Err(panicked) = handler::invoke(&handler, Err(err)).await {
                    error!(error = panicked.to_string(), "handler failed on a setup error");
                }
            }
            Ok(mut subscription) => {
                let exit = subscription.deliver(&handler, &token).await;
                subscription.release().await;

                match exit {
                    LoopExit::Cancelled => break,
                    LoopExit::Fault(err) => error!(
                        error = err.to_string(),
                        delay_ms, "broker exception, will attempt re-connecting"
                    ),
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    info!("supervisor stopped");
}

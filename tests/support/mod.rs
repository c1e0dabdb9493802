// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory topic broker used by the integration tests.
//!
//! It routes published messages to bound queues with AMQP topic matching, buffers them
//! while no consumer is attached, and can be taken down or have its connections dropped
//! to exercise the supervisor's failure paths.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rabbitha::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection, DeliveryStream, FaultHook},
    config::{AckMode, ConnectionOptions},
    exchange::ExchangeDefinition,
    message::{DeliveryAcker, PublishProperties},
    queue::{QueueBinding, QueueDefinition},
    AmqpError, ConsumeHandler, Message,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Once},
    time::Duration,
};
use tokio::{sync::mpsc, time::sleep};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}

/// Whether `key` matches the topic binding `pattern`.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone, Debug)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub props: PublishProperties,
}

struct Consumer {
    connection: usize,
    sender: mpsc::UnboundedSender<Result<Message, AmqpError>>,
    ack_mode: AckMode,
}

#[derive(Default)]
struct ConnectionState {
    open: bool,
    hook: Option<FaultHook>,
}

#[derive(Default)]
struct State {
    available: bool,
    next_tag: u64,
    connects: usize,
    exchange_declares: Vec<ExchangeDefinition>,
    queue_declares: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
    queues: HashMap<String, VecDeque<(String, String, Vec<u8>)>>,
    consumers: HashMap<String, Consumer>,
    connections: Vec<ConnectionState>,
    published: Vec<Published>,
    acked: Vec<u64>,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange && topic_matches(b.key(), routing_key))
            .map(|b| b.queue_name().to_owned())
            .collect();

        for queue in targets {
            self.queues.entry(queue.clone()).or_default().push_back((
                exchange.to_owned(),
                routing_key.to_owned(),
                payload.to_vec(),
            ));
        }
    }
}

/// Handle on the in-memory broker shared by every connection it hands out.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            state: Arc::new(Mutex::new(State {
                available: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    /// Publishes directly on the broker, bypassing the adapter.
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.route(exchange, routing_key, payload);
        drop(state);
        self.flush();
    }

    /// Drops every open connection as a dead socket would: fault hooks fire and the
    /// consumers' delivery streams end.
    pub fn drop_connections(&self) {
        let mut hooks = vec![];
        {
            let mut state = self.state.lock().unwrap();
            for conn in state.connections.iter_mut().filter(|c| c.open) {
                conn.open = false;
                if let Some(hook) = conn.hook.take() {
                    hooks.push(hook);
                }
            }
            state.consumers.clear();
        }

        for mut hook in hooks {
            hook(AmqpError::TransportError("connection reset by peer".to_owned()));
        }
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn exchange_declares(&self) -> Vec<ExchangeDefinition> {
        self.state.lock().unwrap().exchange_declares.clone()
    }

    pub fn queue_declares(&self) -> Vec<QueueDefinition> {
        self.state.lock().unwrap().queue_declares.clone()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| c.open)
            .count()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state.lock().unwrap().consumers.contains_key(queue)
    }

    /// Polls until a consumer is attached to `queue`.
    pub async fn wait_for_consumer(&self, queue: &str) {
        while !self.has_consumer(queue) {
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        let queues: Vec<String> = state.consumers.keys().cloned().collect();

        for queue in queues {
            while let Some((exchange, routing_key, payload)) = state
                .queues
                .get_mut(&queue)
                .and_then(|pending| pending.pop_front())
            {
                state.next_tag += 1;
                let tag = state.next_tag;

                let consumer = &state.consumers[&queue];
                let mut msg = Message::new(payload, tag)
                    .exchange(&exchange)
                    .routing_key(&routing_key);
                if consumer.ack_mode == AckMode::Manual {
                    msg = msg.with_acker(Arc::new(MemoryAcker {
                        tag,
                        state: self.state.clone(),
                    }));
                }
                let _ = consumer.sender.send(Ok(msg));
            }
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        _url: &str,
        _opts: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;

        if !state.available {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.connections.push(ConnectionState {
            open: true,
            hook: None,
        });

        Ok(Arc::new(MemoryConnection {
            id: state.connections.len() - 1,
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: usize,
    broker: MemoryBroker,
}

impl MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.state.lock().unwrap().connections[self.id].open
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        Ok(Arc::new(MemoryChannel {
            connection: self.id,
            broker: self.broker.clone(),
        }))
    }

    fn on_error(&self, hook: FaultHook) {
        self.broker.state.lock().unwrap().connections[self.id].hook = Some(hook);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        let id = self.id;
        state.connections[id].open = false;
        state.connections[id].hook = None;
        state.consumers.retain(|_, c| c.connection != id);
        Ok(())
    }
}

struct MemoryChannel {
    connection: usize,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), AmqpError> {
        if self.broker.state.lock().unwrap().connections[self.connection].open {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("connection closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker
            .state
            .lock()
            .unwrap()
            .exchange_declares
            .push(def.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.check_open()?;
        let mut state = self.broker.state.lock().unwrap();
        state.queue_declares.push(def.clone());
        state.queues.entry(def.name().to_owned()).or_default();
        Ok(def.name().to_owned())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut state = self.broker.state.lock().unwrap();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        self.check_open()
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker.state.lock().unwrap().consumers.insert(
            queue.to_owned(),
            Consumer {
                connection: self.connection,
                sender,
                ack_mode,
            },
        );
        self.broker.flush();

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        {
            let mut state = self.broker.state.lock().unwrap();
            state.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
                props: props.clone(),
            });
            state.route(exchange, routing_key, payload);
        }
        self.broker.flush();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

struct MemoryAcker {
    tag: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.state.lock().unwrap().acked.push(self.tag);
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Handler forwarding every outcome to a channel the test can await.
pub struct ForwardingHandler {
    sender: mpsc::UnboundedSender<Result<Message, AmqpError>>,
}

#[async_trait]
impl ConsumeHandler for ForwardingHandler {
    async fn handle(&self, outcome: Result<Message, AmqpError>) {
        let _ = self.sender.send(outcome);
    }
}

pub fn forwarding_handler() -> (
    Arc<dyn ConsumeHandler>,
    mpsc::UnboundedReceiver<Result<Message, AmqpError>>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(ForwardingHandler { sender }), receiver)
}

/// Waits for the next outcome handed to a forwarding handler.
pub async fn next_outcome(
    receiver: &mut mpsc::UnboundedReceiver<Result<Message, AmqpError>>,
) -> Result<Message, AmqpError> {
    tokio::time::timeout(Duration::from_secs(30), receiver.recv())
        .await
        .expect("no outcome within 30s")
        .expect("handler channel closed")
}

//! In-process broker with AMQP-like exchange, queue and binding semantics.
//!
//! A test double for the dispatch core; the service binary always talks to
//! RabbitMQ through `LapinBroker`. Faults can be switched on to exercise the
//! failure paths.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::clients::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ExchangeKind, ExchangeOptions,
    PublishProperties, QueueOptions,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
}

#[derive(Debug)]
struct MemoryQueue {
    options: QueueOptions,
    messages: Vec<DeliveredMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    connections: Vec<Arc<AtomicBool>>,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: AtomicBool,
    fail_queue_declarations: AtomicBool,
    fail_bindings: AtomicBool,
    fail_publishes: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    faults: Faults,
    dials: AtomicUsize,
    open_channels: AtomicUsize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_delay(&self) -> Option<Duration> {
        *self
            .faults
            .publish_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connection attempts, successful or not.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.inner
            .state()
            .connections
            .iter()
            .filter(|closed| !closed.load(Ordering::SeqCst))
            .count()
    }

    /// Drops every live connection from the broker side, as a network loss would.
    pub fn sever_connections(&self) {
        for closed in &self.inner.state().connections {
            closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner
            .faults
            .refuse_connections
            .store(refuse, Ordering::SeqCst);
    }

    pub fn fail_queue_declarations(&self, fail: bool) {
        self.inner
            .faults
            .fail_queue_declarations
            .store(fail, Ordering::SeqCst);
    }

    pub fn fail_bindings(&self, fail: bool) {
        self.inner.faults.fail_bindings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.faults.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_publishes(&self, delay: Option<Duration>) {
        *self
            .inner
            .faults
            .publish_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeOptions> {
        self.inner.state().exchanges.get(name).copied()
    }

    pub fn queue(&self, name: &str) -> Option<QueueOptions> {
        self.inner.state().queues.get(name).map(|q| q.options)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(exchange, binding key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.inner
            .state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.key.clone()))
            .collect()
    }

    pub fn messages(&self, queue: &str) -> Vec<DeliveredMessage> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.messages.clone())
            .unwrap_or_default()
    }

    /// Removes a queue and its bindings, as an operator would from the admin UI.
    pub fn delete_queue(&self, name: &str) {
        let mut state = self.inner.state();
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
    }

    /// Declares an exchange out of band, e.g. with conflicting arguments.
    pub fn preload_exchange(&self, name: &str, options: ExchangeOptions) {
        self.inner
            .state()
            .exchanges
            .insert(name.to_string(), options);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);

        if self.inner.faults.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError(format!("connection refused by {}", uri)));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let mut state = self.inner.state();
        state
            .connections
            .retain(|closed| !closed.load(Ordering::SeqCst));
        state.connections.push(Arc::clone(&closed));
        drop(state);

        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            closed,
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::new("connection is closed"));
        }

        self.inner.open_channels.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            connection_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::new("channel is closed"));
        }
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::new("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut state = self.inner.state();
        match state.exchanges.get(name) {
            Some(existing) if *existing != options => Err(BrokerError(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), options);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;

        if self
            .inner
            .faults
            .fail_queue_declarations
            .load(Ordering::SeqCst)
        {
            return Err(BrokerError(format!(
                "ACCESS_REFUSED - queue '{}' cannot be declared",
                name
            )));
        }

        let mut state = self.inner.state();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BrokerError(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    MemoryQueue {
                        options,
                        messages: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        if self.inner.faults.fail_bindings.load(Ordering::SeqCst) {
            return Err(BrokerError(format!(
                "ACCESS_REFUSED - cannot bind '{}' to '{}'",
                queue, exchange
            )));
        }

        let mut state = self.inner.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        if let Some(delay) = self.inner.publish_delay() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.faults.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::new("channel closed by broker: publish rejected"));
        }

        let mut state = self.inner.state();
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let kind = state
                .exchanges
                .get(exchange)
                .map(|e| e.kind)
                .ok_or_else(|| BrokerError(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

            let mut queues: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Topic => topic_matches(&b.key, routing_key),
                    ExchangeKind::Direct => b.key == routing_key,
                    ExchangeKind::Fanout => true,
                })
                .map(|b| b.queue.clone())
                .collect();
            queues.sort();
            queues.dedup();
            queues
        };

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.messages.push(DeliveredMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    properties: properties.clone(),
                });
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}

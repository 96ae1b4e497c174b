//! Transport-neutral view of an AMQP 0-9-1 broker.
//!
//! The dispatch core only talks to these traits, so it can run against
//! RabbitMQ through [`crate::clients::rbmq::LapinBroker`] or against the
//! in-process [`crate::clients::memory::MemoryBroker`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl ExchangeOptions {
    pub fn durable_topic() -> Self {
        Self {
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub persistent: bool,
    pub mandatory: bool,
    pub immediate: bool,
}

impl PublishProperties {
    pub fn persistent_json() -> Self {
        Self {
            content_type: "application/json".to_string(),
            persistent: true,
            mandatory: false,
            immediate: false,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// True once the connection is gone, whether we closed it or the broker did.
    fn is_closed(&self) -> bool;

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

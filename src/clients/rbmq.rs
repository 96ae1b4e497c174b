use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as LapinExchangeKind,
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{debug, info};

use crate::clients::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ExchangeKind, ExchangeOptions,
    PublishProperties, QueueOptions,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError(err.to_string())
    }
}

/// RabbitMQ access through `lapin`.
#[derive(Debug, Default, Clone)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        debug!("Connecting to RabbitMQ");

        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

        info!("RabbitMQ connection established");

        Ok(Arc::new(RabbitMqConnection { connection }))
    }
}

pub struct RabbitMqConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(RabbitMqChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Ok(());
        }
        self.connection.close(REPLY_SUCCESS, "OK".into()).await?;
        Ok(())
    }
}

pub struct RabbitMqChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let kind = match options.kind {
            ExchangeKind::Direct => LapinExchangeKind::Direct,
            ExchangeKind::Fanout => LapinExchangeKind::Fanout,
            ExchangeKind::Topic => LapinExchangeKind::Topic,
        };

        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let delivery_mode = if properties.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    immediate: properties.immediate,
                },
                payload,
                BasicProperties::default()
                    .with_content_type(properties.content_type.as_str().into())
                    .with_delivery_mode(delivery_mode),
            )
            .await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel.close(REPLY_SUCCESS, "OK".into()).await?;
        Ok(())
    }
}

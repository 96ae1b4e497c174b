pub mod connection;
pub mod publisher;
pub mod topology;

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    clients::broker::{Broker, BrokerChannel},
    config::Config,
    dispatch::connection::{ConnectionManager, ConnectionStatus},
    models::{error::DispatchError, notification::Notification},
};

/// Result of one [`Dispatcher::send`]. `error` is set exactly when the
/// notification was not accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub accepted: bool,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(error: &DispatchError) -> Self {
        Self {
            accepted: false,
            error: Some(error.to_string()),
        }
    }
}

pub struct Dispatcher {
    connections: ConnectionManager,
    exchange: String,
    operation_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        connections: ConnectionManager,
        exchange: impl Into<String>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            exchange: exchange.into(),
            operation_timeout,
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &Config) -> Self {
        let connections = ConnectionManager::new(
            broker,
            config.rabbitmq_url.clone(),
            config.idle_timeout(),
            config.dial_timeout(),
        );
        Self::new(
            connections,
            config.exchange_name.clone(),
            config.operation_timeout(),
        )
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.connections.status().await
    }

    /// Publishes `notification`, folding every failure into the outcome.
    pub async fn send(&self, notification: &Notification) -> DispatchOutcome {
        match self.try_send(notification).await {
            Ok(()) => DispatchOutcome::accepted(),
            Err(e) => {
                warn!(
                    application = %notification.application,
                    user_id = %notification.user_id,
                    kind = e.kind(),
                    error = %e,
                    "Notification dispatch failed"
                );
                DispatchOutcome::rejected(&e)
            }
        }
    }

    pub async fn try_send(&self, notification: &Notification) -> Result<(), DispatchError> {
        let lease = self.connections.acquire().await?;

        let channel = lease
            .create_channel()
            .await
            .map_err(|e| DispatchError::Connection(format!("failed to open channel: {}", e)))?;

        let result = match timeout(
            self.operation_timeout,
            self.provision_and_publish(channel.as_ref(), notification),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.operation_timeout)),
        };

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close channel");
        }

        result
    }

    async fn provision_and_publish(
        &self,
        channel: &dyn BrokerChannel,
        notification: &Notification,
    ) -> Result<(), DispatchError> {
        let routing_key = notification.routing_key();

        topology::ensure(channel, &self.exchange, &routing_key).await?;
        publisher::publish(channel, &self.exchange, notification).await
    }

    /// Force-closes the broker connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.connections.disconnect().await;
    }
}

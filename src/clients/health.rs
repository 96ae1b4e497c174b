use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    clients::{broker::Broker, database::AuditStore},
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
};

pub const MESSAGE_BROKER: &str = "message_broker";
pub const AUDIT_STORE: &str = "audit_store";

pub struct HealthChecker {
    broker: Arc<dyn Broker>,
    broker_url: String,
    dial_timeout: Duration,
    audit_store: Arc<dyn AuditStore>,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<dyn Broker>,
        broker_url: String,
        dial_timeout: Duration,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            broker,
            broker_url,
            dial_timeout,
            audit_store,
        }
    }

    /// `broker_connection` is the dispatcher's connection state, reported as-is.
    pub async fn check_all(&self, broker_connection: String) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert(MESSAGE_BROKER.to_string(), self.check_broker().await);
        checks.insert(AUDIT_STORE.to_string(), self.check_audit_store().await);

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            broker_connection,
            checks,
        }
    }

    async fn check_broker(&self) -> ServiceHealth {
        let start = Instant::now();

        match timeout(self.dial_timeout, self.broker.connect(&self.broker_url)).await {
            Ok(Ok(connection)) => {
                if let Err(e) = connection.close().await {
                    debug!(error = %e, "Failed to close health check connection");
                }
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Broker health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Broker connection failed");
                ServiceHealth::unhealthy(format!("Connection failed: {}", e))
            }
            Err(_) => {
                warn!("Broker health check timed out");
                ServiceHealth::unhealthy(format!(
                    "Connection timed out after {:?}",
                    self.dial_timeout
                ))
            }
        }
    }

    async fn check_audit_store(&self) -> ServiceHealth {
        let start = Instant::now();

        match timeout(self.dial_timeout, self.audit_store.health_check()).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Audit store health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Audit store health check failed");
                ServiceHealth::unhealthy(e.to_string())
            }
            Err(_) => {
                warn!("Audit store health check timed out");
                ServiceHealth::unhealthy(format!(
                    "Health check timed out after {:?}",
                    self.dial_timeout
                ))
            }
        }
    }
}

/// The broker is critical; a failing audit store only degrades the service
/// because audit writes never block dispatch.
fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let unhealthy = |name: &str| {
        checks
            .get(name)
            .is_some_and(|health| health.status == HealthStatus::Unhealthy)
    };

    if unhealthy(MESSAGE_BROKER) {
        HealthStatus::Unhealthy
    } else if checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

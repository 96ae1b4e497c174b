use tracing::{debug, warn};

use crate::{
    clients::broker::{BrokerChannel, ExchangeOptions, QueueOptions},
    models::error::DispatchError,
};

/// Declares the topic exchange, the queue named `queue` and the binding
/// between them, keyed by the queue name.
///
/// Every declaration is idempotent on the broker, so this runs before each
/// publish instead of caching what was already provisioned. A queue or
/// binding removed behind our back is recreated on the next dispatch.
pub async fn ensure(
    channel: &dyn BrokerChannel,
    exchange: &str,
    queue: &str,
) -> Result<(), DispatchError> {
    channel
        .declare_exchange(exchange, ExchangeOptions::durable_topic())
        .await
        .map_err(|e| {
            warn!(exchange, error = %e, "Failed to declare exchange");
            DispatchError::Topology(format!("exchange '{}': {}", exchange, e))
        })?;

    channel
        .declare_queue(queue, QueueOptions::durable())
        .await
        .map_err(|e| {
            warn!(queue, error = %e, "Failed to declare queue");
            DispatchError::Topology(format!("queue '{}': {}", queue, e))
        })?;

    channel
        .bind_queue(queue, exchange, queue)
        .await
        .map_err(|e| {
            warn!(queue, exchange, error = %e, "Failed to bind queue");
            DispatchError::Topology(format!("binding '{}' to '{}': {}", queue, exchange, e))
        })?;

    debug!(exchange, queue, "Topology ensured");

    Ok(())
}

use tracing::{info, warn};

use crate::{
    clients::broker::{BrokerChannel, PublishProperties},
    models::{error::DispatchError, notification::Notification},
};

/// Publishes `notification` as persistent JSON to `exchange` under its
/// routing key. Not retried; the caller owns retry policy.
pub async fn publish(
    channel: &dyn BrokerChannel,
    exchange: &str,
    notification: &Notification,
) -> Result<(), DispatchError> {
    let payload = serde_json::to_vec(notification)?;
    let routing_key = notification.routing_key();

    channel
        .publish(
            exchange,
            &routing_key,
            &payload,
            &PublishProperties::persistent_json(),
        )
        .await
        .map_err(|e| {
            warn!(routing_key = %routing_key, error = %e, "Broker rejected publish");
            DispatchError::Publish(e.to_string())
        })?;

    info!(
        routing_key = %routing_key,
        bytes = payload.len(),
        "Notification published"
    );

    Ok(())
}

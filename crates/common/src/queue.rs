//! Producer side of the notification queue.
//!
//! The queue is a Redis stream. Each entry carries the JSON envelope in a
//! single `payload` field; the relay reads it through a consumer group.

use redis::aio::ConnectionManager;

use crate::error::AppError;
use crate::types::NotificationEnvelope;

/// Stream field holding the serialized envelope.
pub const PAYLOAD_FIELD: &str = "payload";

/// Publish one envelope to `queue`. Returns the stream entry ID.
///
/// Producers call this exactly once per created notification.
pub async fn publish_notification(
    redis: &mut ConnectionManager,
    queue: &str,
    envelope: &NotificationEnvelope,
) -> Result<String, AppError> {
    let payload = envelope.to_json()?;
    publish_raw(redis, queue, &payload).await
}

/// Publish an already-serialized payload.
pub async fn publish_raw(
    redis: &mut ConnectionManager,
    queue: &str,
    payload: &str,
) -> Result<String, AppError> {
    let entry_id: String = redis::cmd("XADD")
        .arg(queue)
        .arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .query_async(redis)
        .await?;

    tracing::debug!(queue, entry_id = %entry_id, "Notification published");
    Ok(entry_id)
}

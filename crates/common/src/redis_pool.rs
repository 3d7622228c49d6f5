use redis::Client;
use redis::aio::ConnectionManager;

use crate::error::AppError;

/// Open a Redis connection manager and make sure the broker answers.
///
/// Each call opens a separate connection. Fails fast so a relay never starts
/// consuming without a reachable queue.
pub async fn create_redis_pool(redis_url: &str) -> Result<ConnectionManager, AppError> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

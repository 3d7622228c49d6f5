//! Consumer side of the durable notification queue.
//!
//! Entries stay in the stream's pending list until acknowledged, so a relay
//! that restarts under the same consumer name first replays what it had
//! fetched but not acknowledged, then continues with new entries.
//!
//! Blocking reads get a connection of their own. Redis answers commands on
//! one connection in order, so an `XACK` sent behind an idle
//! `XREADGROUP ... BLOCK` would wait out the whole block.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;

use herald_common::error::AppError;
use herald_common::queue::PAYLOAD_FIELD;
use herald_common::redis_pool::create_redis_pool;

/// One fetched queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-assigned ID, used for acknowledgement
    pub id: String,
    /// Raw envelope JSON; `None` if the entry had no payload field
    pub payload: Option<String>,
}

/// A subscription to a single durable queue.
pub trait NotificationQueue: Clone + Send + Sync + 'static {
    /// Fetch up to `max` entries, waiting at most `block` when none are ready.
    /// An empty batch means the wait elapsed.
    fn fetch(
        &self,
        max: usize,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<QueueMessage>, AppError>> + Send;

    /// Tell the broker the entry has been handled.
    fn ack(&self, id: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Redis-stream-backed queue read through a consumer group.
#[derive(Clone)]
pub struct RedisStreamQueue {
    /// Used only by `fetch`, which the single fetch loop calls
    reader: ConnectionManager,
    /// Group management and acknowledgements
    writer: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    /// Position in this consumer's pending backlog; `None` once replayed.
    backlog_cursor: Arc<Mutex<Option<String>>>,
}

impl RedisStreamQueue {
    /// Attach to `stream` as `consumer` within `group`, creating the stream
    /// and group if needed. Opens two connections to `redis_url`.
    pub async fn connect(
        redis_url: &str,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self, AppError> {
        let queue = Self {
            reader: create_redis_pool(redis_url).await?,
            writer: create_redis_pool(redis_url).await?,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            backlog_cursor: Arc::new(Mutex::new(Some("0".to_string()))),
        };
        queue.ensure_group().await?;

        tracing::info!(
            stream,
            group,
            consumer,
            "Subscribed to notification queue"
        );
        Ok(queue)
    }

    async fn ensure_group(&self) -> Result<(), AppError> {
        let mut conn = self.writer.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(stream = %self.stream, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backlog_position(&self) -> Option<String> {
        self.backlog_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_backlog_position(&self, position: Option<String>) {
        *self
            .backlog_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = position;
    }
}

impl NotificationQueue for RedisStreamQueue {
    fn fetch(
        &self,
        max: usize,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<QueueMessage>, AppError>> + Send {
        let queue = self.clone();
        async move {
            let mut conn = queue.reader.clone();

            if let Some(position) = queue.backlog_position() {
                let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(&queue.group)
                    .arg(&queue.consumer)
                    .arg("COUNT")
                    .arg(max)
                    .arg("STREAMS")
                    .arg(&queue.stream)
                    .arg(&position)
                    .query_async(&mut conn)
                    .await?;

                let messages = collect_messages(reply);
                match messages.last() {
                    Some(last) => {
                        tracing::info!(
                            count = messages.len(),
                            "Replaying unacknowledged notifications"
                        );
                        queue.set_backlog_position(Some(last.id.clone()));
                        return Ok(messages);
                    }
                    None => queue.set_backlog_position(None),
                }
            }

            let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&queue.group)
                .arg(&queue.consumer)
                .arg("COUNT")
                .arg(max)
                .arg("BLOCK")
                .arg(block.as_millis() as u64)
                .arg("STREAMS")
                .arg(&queue.stream)
                .arg(">")
                .query_async(&mut conn)
                .await?;

            Ok(collect_messages(reply))
        }
    }

    fn ack(&self, id: &str) -> impl Future<Output = Result<(), AppError>> + Send {
        let mut conn = self.writer.clone();
        let stream = self.stream.clone();
        let group = self.group.clone();
        let id = id.to_string();
        async move {
            let _acked: i64 = redis::cmd("XACK")
                .arg(&stream)
                .arg(&group)
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            Ok(())
        }
    }
}

fn collect_messages(reply: Option<StreamReadReply>) -> Vec<QueueMessage> {
    reply
        .map(|reply| {
            reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids)
                .map(|entry| QueueMessage {
                    payload: entry.get::<String>(PAYLOAD_FIELD),
                    id: entry.id,
                })
                .collect()
        })
        .unwrap_or_default()
}

//! Queue consumer. Pulls notification envelopes off the durable queue and
//! routes each one to its recipient's live connection.
//!
//! Delivery is at-most-once: every entry is acknowledged once it has been
//! handled, whether it was pushed, dropped because the user is offline, or
//! dropped because it could not be decoded or delivered.
//!
//! A single fetch loop feeds a fixed pool of workers. Entries are sharded by
//! recipient, so one user's notifications are always handled by the same
//! worker in queue order while different users proceed in parallel.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::{NotificationEnvelope, PushEvent, UserId};

use crate::queue::{NotificationQueue, QueueMessage};
use crate::registry::ConnectionRegistry;
use crate::store::UserStore;

/// How long a single fetch may wait for new entries.
const FETCH_BLOCK: Duration = Duration::from_secs(5);

/// Pause after a failed fetch before trying again.
const FETCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Pushed to the recipient's registered connection
    Delivered,
    /// Recipient has no registered connection; dropped
    Offline,
    /// Recipient does not exist; dropped
    UnknownRecipient,
    /// Payload could not be decoded; dropped
    Malformed,
    /// Push to the registered connection failed; dropped and connection evicted
    Failed,
}

/// Tuning for the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub workers: usize,
    pub push_timeout: Duration,
    pub fetch_block: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.queue_batch_size.max(1),
            workers: config.relay_workers.max(1),
            push_timeout: Duration::from_millis(config.push_timeout_ms),
            fetch_block: FETCH_BLOCK,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 16,
            workers: 4,
            push_timeout: Duration::from_secs(5),
            fetch_block: FETCH_BLOCK,
        }
    }
}

/// Resolves a recipient and pushes one envelope.
#[derive(Clone)]
pub struct Deliverer<S> {
    store: S,
    registry: ConnectionRegistry,
    push_timeout: Duration,
}

impl<S: UserStore> Deliverer<S> {
    pub fn new(store: S, registry: ConnectionRegistry, push_timeout: Duration) -> Self {
        Self {
            store,
            registry,
            push_timeout,
        }
    }

    pub async fn deliver(&self, envelope: NotificationEnvelope) -> DeliveryOutcome {
        let user_id = envelope.user_id.clone();
        let notification_id = envelope.id.clone();

        match self.store.find_user(&user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    notification_id = %notification_id,
                    user_id = %user_id,
                    "Unknown recipient; notification dropped"
                );
                return DeliveryOutcome::UnknownRecipient;
            }
            // The registry, not the store, decides delivery.
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification_id,
                    user_id = %user_id,
                    error = %e,
                    "Recipient lookup failed; trying registry anyway"
                );
            }
        }

        let Some(handle) = self.registry.lookup(&user_id) else {
            tracing::debug!(
                notification_id = %notification_id,
                user_id = %user_id,
                "Recipient offline; notification dropped"
            );
            return DeliveryOutcome::Offline;
        };

        match handle
            .push(PushEvent::notification(envelope), self.push_timeout)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    notification_id = %notification_id,
                    user_id = %user_id,
                    connection_id = %handle.connection_id(),
                    "Notification delivered"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification_id,
                    user_id = %user_id,
                    connection_id = %handle.connection_id(),
                    error = %e,
                    "Delivery failed; evicting connection"
                );
                self.registry
                    .unregister_connection(&user_id, handle.connection_id());
                handle.evict();
                DeliveryOutcome::Failed
            }
        }
    }
}

struct Job {
    entry_id: String,
    envelope: NotificationEnvelope,
}

/// Long-lived subscription to the notification queue.
pub struct QueueConsumer<Q, S> {
    queue: Q,
    deliverer: Deliverer<S>,
    settings: ConsumerSettings,
}

impl<Q: NotificationQueue, S: UserStore> QueueConsumer<Q, S> {
    pub fn new(queue: Q, store: S, registry: ConnectionRegistry, settings: ConsumerSettings) -> Self {
        Self {
            queue,
            deliverer: Deliverer::new(store, registry, settings.push_timeout),
            settings,
        }
    }

    /// Decode, deliver and acknowledge a single entry inline.
    pub async fn handle_message(&self, message: QueueMessage) -> DeliveryOutcome {
        let outcome = match decode(&message) {
            Ok(envelope) => self.deliverer.deliver(envelope).await,
            Err(outcome) => outcome,
        };
        acknowledge(&self.queue, &message.id, outcome).await;
        outcome
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Stops fetching on shutdown and lets workers finish the entries
    /// already handed to them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (senders, workers) = self.spawn_workers();

        tracing::info!(
            workers = senders.len(),
            batch_size = self.settings.batch_size,
            "Queue consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                fetched = self.queue.fetch(self.settings.batch_size, self.settings.fetch_block) => fetched,
            };

            match fetched {
                Ok(batch) => {
                    for message in batch {
                        self.dispatch(message, &senders).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to fetch from notification queue");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(FETCH_RETRY_BACKOFF) => {}
                    }
                }
            }
        }

        drop(senders);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Delivery worker panicked");
            }
        }

        tracing::info!("Queue consumer stopped");
    }

    fn spawn_workers(&self) -> (Vec<mpsc::Sender<Job>>, Vec<JoinHandle<()>>) {
        (0..self.settings.workers.max(1))
            .map(|index| {
                let (tx, mut rx) = mpsc::channel::<Job>(self.settings.batch_size.max(1));
                let queue = self.queue.clone();
                let deliverer = self.deliverer.clone();
                let handle = tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        let outcome = deliverer.deliver(job.envelope).await;
                        acknowledge(&queue, &job.entry_id, outcome).await;
                    }
                    tracing::debug!(worker = index, "Delivery worker drained");
                });
                (tx, handle)
            })
            .unzip()
    }

    async fn dispatch(&self, message: QueueMessage, senders: &[mpsc::Sender<Job>]) {
        let envelope = match decode(&message) {
            Ok(envelope) => envelope,
            Err(outcome) => {
                acknowledge(&self.queue, &message.id, outcome).await;
                return;
            }
        };

        let shard = shard_for(&envelope.user_id, senders.len());
        let job = Job {
            entry_id: message.id,
            envelope,
        };
        if let Err(e) = senders[shard].send(job).await {
            // Worker gone: the entry stays pending and is replayed on restart.
            tracing::error!(shard, entry_id = %e.0.entry_id, "Delivery worker unavailable");
        }
    }
}

/// Pick the worker for a recipient. Stable for a given user.
fn shard_for(user_id: &UserId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

fn decode(message: &QueueMessage) -> Result<NotificationEnvelope, DeliveryOutcome> {
    let Some(raw) = message.payload.as_deref() else {
        tracing::warn!(entry_id = %message.id, "Queue entry has no payload; dropped");
        return Err(DeliveryOutcome::Malformed);
    };

    NotificationEnvelope::from_json(raw).map_err(|e| {
        tracing::warn!(
            entry_id = %message.id,
            error = %AppError::from(e),
            "Malformed notification; dropped"
        );
        DeliveryOutcome::Malformed
    })
}

async fn acknowledge<Q: NotificationQueue>(queue: &Q, entry_id: &str, outcome: DeliveryOutcome) {
    match queue.ack(entry_id).await {
        Ok(()) => tracing::trace!(entry_id, ?outcome, "Queue entry acknowledged"),
        Err(e) => tracing::error!(entry_id, ?outcome, error = %e, "Failed to acknowledge queue entry"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryQueue, MemoryUserStore};
    use crate::registry::ConnectionHandle;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        queue: MemoryQueue,
        store: MemoryUserStore,
        registry: ConnectionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: MemoryQueue::new(),
                store: MemoryUserStore::new(),
                registry: ConnectionRegistry::new(),
            }
        }

        fn consumer(&self) -> QueueConsumer<MemoryQueue, MemoryUserStore> {
            let settings = ConsumerSettings {
                push_timeout: Duration::from_millis(50),
                fetch_block: Duration::from_millis(20),
                ..ConsumerSettings::default()
            };
            QueueConsumer::new(
                self.queue.clone(),
                self.store.clone(),
                self.registry.clone(),
                settings,
            )
        }

        async fn next_message(&self) -> QueueMessage {
            let mut batch = self.queue.fetch(1, WAIT).await.unwrap();
            batch.pop().expect("queue should have an entry")
        }
    }

    async fn wait_until_acked(queue: &MemoryQueue, id: &str) {
        tokio::time::timeout(WAIT, async {
            while !queue.is_acked(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("entry was never acknowledged");
    }

    #[tokio::test]
    async fn test_offline_recipient_is_acked_without_push() {
        let fx = Fixture::new();
        let user = fx.store.add_user("u1").unwrap();
        let id = fx.queue.publish(&NotificationEnvelope::new(user.clone(), "hi"));

        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::Offline);
        assert!(fx.queue.is_acked(&id));
        assert!(fx.store.flag_writes().is_empty());
    }

    #[tokio::test]
    async fn test_registered_recipient_gets_exactly_one_push() {
        let fx = Fixture::new();
        let user = fx.store.add_user("u1").unwrap();
        let (handle, mut rx) = ConnectionHandle::channel(user.clone(), 8);
        fx.registry.register(user.clone(), handle);

        let envelope = NotificationEnvelope::new(user.clone(), "hello");
        let id = fx.queue.publish(&envelope);
        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert!(fx.queue.is_acked(&id));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "notification");
        assert_eq!(event.data, envelope);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_goes_to_latest_handle_only() {
        let fx = Fixture::new();
        let user = fx.store.add_user("u1").unwrap();
        let (h1, mut rx1) = ConnectionHandle::channel(user.clone(), 8);
        let (h2, mut rx2) = ConnectionHandle::channel(user.clone(), 8);
        fx.registry.register(user.clone(), h1);
        fx.registry.register(user.clone(), h2);

        fx.queue.publish(&NotificationEnvelope::new(user.clone(), "hello"));
        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked() {
        let fx = Fixture::new();
        let garbage = fx.queue.publish_payload(Some("{not json".to_string()));
        let empty = fx.queue.publish_payload(None);
        let consumer = fx.consumer();

        assert_eq!(
            consumer.handle_message(fx.next_message().await).await,
            DeliveryOutcome::Malformed
        );
        assert_eq!(
            consumer.handle_message(fx.next_message().await).await,
            DeliveryOutcome::Malformed
        );
        assert!(fx.queue.is_acked(&garbage));
        assert!(fx.queue.is_acked(&empty));
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_acked() {
        let fx = Fixture::new();
        let ghost = UserId::new("ghost").unwrap();
        let (handle, mut rx) = ConnectionHandle::channel(ghost.clone(), 8);
        fx.registry.register(ghost.clone(), handle);

        let id = fx.queue.publish(&NotificationEnvelope::new(ghost, "boo"));
        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::UnknownRecipient);
        assert!(fx.queue.is_acked(&id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_connection_is_evicted() {
        let fx = Fixture::new();
        let user = fx.store.add_user("u1").unwrap();
        let (handle, rx) = ConnectionHandle::channel(user.clone(), 8);
        fx.registry.register(user.clone(), handle.clone());
        drop(rx);

        let id = fx.queue.publish(&NotificationEnvelope::new(user.clone(), "hello"));
        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert!(fx.queue.is_acked(&id));
        assert!(fx.registry.lookup(&user).is_none());
        tokio::time::timeout(WAIT, handle.evicted())
            .await
            .expect("connection should be told to close");
    }

    #[tokio::test]
    async fn test_backpressured_connection_times_out() {
        let fx = Fixture::new();
        let user = fx.store.add_user("u1").unwrap();
        let (handle, _rx) = ConnectionHandle::channel(user.clone(), 1);
        fx.registry.register(user.clone(), handle);
        let consumer = fx.consumer();

        fx.queue.publish(&NotificationEnvelope::new(user.clone(), "1"));
        fx.queue.publish(&NotificationEnvelope::new(user.clone(), "2"));

        assert_eq!(
            consumer.handle_message(fx.next_message().await).await,
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            consumer.handle_message(fx.next_message().await).await,
            DeliveryOutcome::Failed
        );
        assert!(fx.registry.lookup(&user).is_none());
    }

    #[tokio::test]
    async fn test_run_preserves_per_user_order_and_stops_on_shutdown() {
        let fx = Fixture::new();
        let alice = fx.store.add_user("alice").unwrap();
        let bob = fx.store.add_user("bob").unwrap();
        let (ha, mut rx_alice) = ConnectionHandle::channel(alice.clone(), 64);
        let (hb, mut rx_bob) = ConnectionHandle::channel(bob.clone(), 64);
        fx.registry.register(alice.clone(), ha);
        fx.registry.register(bob.clone(), hb);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(fx.consumer().run(shutdown_rx));

        let mut last = String::new();
        for i in 0..20 {
            fx.queue
                .publish(&NotificationEnvelope::new(alice.clone(), format!("a{}", i)));
            last = fx
                .queue
                .publish(&NotificationEnvelope::new(bob.clone(), format!("b{}", i)));
        }
        wait_until_acked(&fx.queue, &last).await;

        for i in 0..20 {
            let a = tokio::time::timeout(WAIT, rx_alice.recv()).await.unwrap().unwrap();
            assert_eq!(a.data.message, serde_json::json!(format!("a{}", i)));
            let b = tokio::time::timeout(WAIT, rx_bob.recv()).await.unwrap().unwrap();
            assert_eq!(b.data.message, serde_json::json!(format!("b{}", i)));
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(WAIT, task)
            .await
            .expect("consumer should stop")
            .unwrap();
        assert_eq!(fx.queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_recipient_deleted_after_connect_is_dropped() {
        let fx = Fixture::new();
        let user = fx.store.add_user("u1").unwrap();
        let (handle, mut rx) = ConnectionHandle::channel(user.clone(), 8);
        fx.registry.register(user.clone(), handle);
        fx.store.remove_user(&user);

        let id = fx.queue.publish(&NotificationEnvelope::new(user.clone(), "gone"));
        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::UnknownRecipient);
        assert!(fx.queue.is_acked(&id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_opaque_recipient_id_is_routed() {
        let fx = Fixture::new();
        let user = fx.store.add_user("64f1c0ffee").unwrap();
        let (handle, mut rx) = ConnectionHandle::channel(user.clone(), 8);
        fx.registry.register(user.clone(), handle);

        let id = fx.queue.publish_payload(Some(
            r#"{"id":"n2","userId":"64f1c0ffee","message":"hi"}"#.to_string(),
        ));
        let outcome = fx.consumer().handle_message(fx.next_message().await).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert!(fx.queue.is_acked(&id));
        assert_eq!(rx.recv().await.unwrap().data.id, "n2");
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        let user = UserId::new("u1").unwrap();
        let shard = shard_for(&user, 4);
        assert!(shard < 4);
        assert_eq!(shard, shard_for(&user, 4));
        assert_eq!(shard_for(&user, 0), 0);
    }
}

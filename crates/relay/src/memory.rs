//! In-process queue and user store.
//!
//! Used by the test suites and for running the relay without Redis or
//! PostgreSQL. Semantics mirror the real backends: fetched entries stay
//! pending until acknowledged.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use herald_common::error::AppError;
use herald_common::types::{InvalidUserId, NotificationEnvelope, User, UserId};

use crate::queue::{NotificationQueue, QueueMessage};
use crate::store::UserStore;

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<QueueMessage>,
    pending: Vec<String>,
    acked: Vec<String>,
}

/// In-memory [`NotificationQueue`].
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    published: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an envelope. Returns the entry ID.
    pub fn publish(&self, envelope: &NotificationEnvelope) -> String {
        let payload = envelope
            .to_json()
            .unwrap_or_else(|e| format!("<unserializable: {}>", e));
        self.publish_payload(Some(payload))
    }

    /// Enqueue a raw payload, including malformed ones.
    pub fn publish_payload(&self, payload: Option<String>) -> String {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.ready.push_back(QueueMessage {
                id: id.clone(),
                payload,
            });
            id
        };
        self.published.notify_one();
        id
    }

    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    pub fn is_acked(&self, id: &str) -> bool {
        self.lock().acked.iter().any(|a| a == id)
    }

    /// Entries not yet fetched plus entries fetched but not acknowledged.
    pub fn outstanding(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_ready(&self, max: usize) -> Vec<QueueMessage> {
        let mut state = self.lock();
        let count = max.min(state.ready.len());
        let batch: Vec<QueueMessage> = state.ready.drain(..count).collect();
        state.pending.extend(batch.iter().map(|m| m.id.clone()));
        batch
    }
}

impl NotificationQueue for MemoryQueue {
    fn fetch(
        &self,
        max: usize,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<QueueMessage>, AppError>> + Send {
        let queue = self.clone();
        async move {
            let batch = queue.take_ready(max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(block, queue.published.notified()).await;
            Ok(queue.take_ready(max))
        }
    }

    fn ack(&self, id: &str) -> impl Future<Output = Result<(), AppError>> + Send {
        let queue = self.clone();
        let id = id.to_string();
        async move {
            let mut state = queue.lock();
            match state.pending.iter().position(|p| *p == id) {
                Some(pos) => {
                    state.pending.remove(pos);
                    state.acked.push(id);
                    Ok(())
                }
                None => Err(AppError::Queue(format!("Unknown or already acked entry {}", id))),
            }
        }
    }
}

/// In-memory [`UserStore`] that also records every flag write.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<Mutex<HashMap<UserId, User>>>,
    flag_writes: Arc<Mutex<Vec<(UserId, bool)>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a disconnected user, named after its ID, and return the ID.
    pub fn add_user(&self, id: &str) -> Result<UserId, InvalidUserId> {
        let id = UserId::new(id)?;
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                User {
                    id: id.clone(),
                    username: id.to_string(),
                    connected: false,
                },
            );
        Ok(id)
    }

    pub fn remove_user(&self, id: &UserId) {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Current flag value, `None` for unknown users.
    pub fn connected(&self, id: &UserId) -> Option<bool> {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|u| u.connected)
    }

    pub fn flag_writes(&self) -> Vec<(UserId, bool)> {
        self.flag_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl UserStore for MemoryUserStore {
    fn find_user(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Option<User>, AppError>> + Send {
        let user = self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        async move { Ok(user) }
    }

    fn set_connected(
        &self,
        id: &UserId,
        connected: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send {
        let result = {
            let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            match users.get_mut(id) {
                Some(user) => {
                    user.connected = connected;
                    self.flag_writes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((id.clone(), connected));
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("User {} not found", id))),
            }
        };
        async move { result }
    }
}

//! Connection registry: the one structure every concurrent actor touches.
//!
//! Maps a user to the handle of their live connection. Policy is
//! last-writer-wins: registering a user who already has an entry replaces it,
//! and the replaced socket is left open until it closes on its own.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use herald_common::types::{PushEvent, UserId};

/// Why a push to a registered connection failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("push timed out after {0:?}")]
    TimedOut(Duration),
}

/// Cloneable handle to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    user_id: UserId,
    sender: mpsc::Sender<PushEvent>,
    eviction: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiving end its connection task drains.
    pub fn channel(user_id: UserId, buffer: usize) -> (Self, mpsc::Receiver<PushEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = Self {
            connection_id: Uuid::new_v4(),
            user_id,
            sender,
            eviction: Arc::new(Notify::new()),
        };
        (handle, receiver)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Queue an event for the connection's writer, waiting at most `timeout`
    /// for buffer space.
    pub async fn push(&self, event: PushEvent, timeout: Duration) -> Result<(), DeliveryError> {
        self.sender
            .send_timeout(event, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryError::Closed,
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(timeout),
            })
    }

    /// Ask the owning connection task to close.
    pub fn evict(&self) {
        self.eviction.notify_one();
    }

    /// Resolves once [`evict`](Self::evict) has been called.
    pub async fn evicted(&self) {
        self.eviction.notified().await;
    }
}

/// In-memory map from user ID to live connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handle for `user_id`. Returns the replaced handle.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.clone(), handle);

        if let Some(prev) = &previous {
            tracing::debug!(
                user_id = %user_id,
                replaced_connection = %prev.connection_id,
                "Registry entry replaced"
            );
        }
        previous
    }

    /// Remove the entry for `user_id`, if any.
    pub fn unregister(&self, user_id: &UserId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
    }

    /// Remove the entry for `user_id` only if it still belongs to
    /// `connection_id`. Returns whether an entry was removed.
    pub fn unregister_connection(&self, user_id: &UserId, connection_id: Uuid) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get(user_id) {
            Some(current) if current.connection_id == connection_id => {
                map.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, user_id: &UserId) -> Option<ConnectionHandle> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

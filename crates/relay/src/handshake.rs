//! Connection handshake and lifecycle.
//!
//! Every incoming connection walks
//! `Connecting → Authenticated → Active → Closed`, or stops at `Rejected`
//! when its credential does not check out. Registry and flag cleanup only
//! ever run for a connection that reached `Active`.
//!
//! Flag writes for one user are serialized with that user's registry
//! changes, so the flag always ends up matching whether a connection is
//! registered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use herald_common::auth::verify_token;
use herald_common::error::AppError;
use herald_common::types::{PushEvent, UserId};

use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::store::UserStore;

/// Lifecycle state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
    Rejected,
}

/// Per-user async locks. Entries are dropped once nobody holds or waits on
/// them.
#[derive(Debug, Clone, Default)]
struct UserLocks {
    inner: Arc<Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl UserLocks {
    /// Run `critical` while holding `user_id`'s lock.
    async fn with_lock<F, T>(&self, user_id: &UserId, critical: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.clone())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            critical.await
        };
        drop(lock);

        // Clones are only handed out under the map lock, so a count of one
        // means no other task holds or awaits this entry.
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(user_id);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Authenticates connections and keeps the registry and `connected` flag in
/// step with their lifetimes.
#[derive(Clone)]
pub struct HandshakeManager<S> {
    secret: Arc<str>,
    store: S,
    registry: ConnectionRegistry,
    outbound_buffer: usize,
    flag_locks: UserLocks,
}

impl<S: UserStore> HandshakeManager<S> {
    pub fn new(
        secret: impl Into<Arc<str>>,
        store: S,
        registry: ConnectionRegistry,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            secret: secret.into(),
            store,
            registry,
            outbound_buffer,
            flag_locks: UserLocks::default(),
        }
    }

    /// Start tracking a newly accepted connection.
    pub fn begin(&self) -> Connection<S> {
        Connection {
            state: ConnectionState::Connecting,
            user_id: None,
            handle: None,
            manager: self.clone(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

/// One connection's view of the handshake.
///
/// Dropping an `Active` connection without calling [`close`](Self::close)
/// still removes it from the registry and schedules the flag reset.
pub struct Connection<S: UserStore> {
    state: ConnectionState,
    user_id: Option<UserId>,
    handle: Option<ConnectionHandle>,
    manager: HandshakeManager<S>,
}

impl<S: UserStore> Connection<S> {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Verify the credential and confirm the user exists.
    ///
    /// Any failure moves the connection to `Rejected` without touching the
    /// registry or the store's flag.
    pub async fn authenticate(&mut self, token: Option<&str>) -> Result<UserId, AppError> {
        if self.state != ConnectionState::Connecting {
            return Err(AppError::Internal(format!(
                "Cannot authenticate a connection in state {:?}",
                self.state
            )));
        }

        let user_id = match verify_token(token, &self.manager.secret) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Connection rejected");
                self.state = ConnectionState::Rejected;
                return Err(e.into());
            }
        };

        match self.manager.store.find_user(&user_id).await {
            Ok(Some(user)) => {
                tracing::debug!(user_id = %user.id, username = %user.username, "Connection authenticated");
            }
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "Connection rejected: unknown user");
                self.state = ConnectionState::Rejected;
                return Err(AppError::Auth("Unknown user".to_string()));
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "User lookup failed during handshake");
                self.state = ConnectionState::Rejected;
                return Err(e);
            }
        }

        self.user_id = Some(user_id.clone());
        self.state = ConnectionState::Authenticated;
        Ok(user_id)
    }

    /// Publish the authenticated connection: flag the user as connected and
    /// register the handle. Returns the receiver the connection's writer
    /// drains plus the handle itself.
    pub async fn activate(
        &mut self,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<PushEvent>), AppError> {
        let user_id = match (self.state, &self.user_id) {
            (ConnectionState::Authenticated, Some(id)) => id.clone(),
            (state, _) => {
                return Err(AppError::Internal(format!(
                    "Cannot activate a connection in state {:?}",
                    state
                )));
            }
        };

        let manager = &self.manager;
        let (handle, receiver) =
            ConnectionHandle::channel(user_id.clone(), manager.outbound_buffer);
        let previous = manager
            .flag_locks
            .with_lock(&user_id, async {
                if let Err(e) = manager.store.set_connected(&user_id, true).await {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to set connected flag");
                }
                manager.registry.register(user_id.clone(), handle.clone())
            })
            .await;

        if let Some(previous) = previous {
            tracing::info!(
                user_id = %user_id,
                previous_connection = %previous.connection_id(),
                connection_id = %handle.connection_id(),
                "User reconnected; previous connection no longer receives pushes"
            );
        }

        self.handle = Some(handle.clone());
        self.state = ConnectionState::Active;

        tracing::info!(
            user_id = %user_id,
            connection_id = %handle.connection_id(),
            connections = self.manager.registry.len(),
            "Connection active"
        );
        Ok((handle, receiver))
    }

    /// Tear the connection down. Safe to call in any state and more than once.
    pub async fn close(&mut self) {
        match self.state {
            ConnectionState::Active => {
                self.state = ConnectionState::Closed;
                if let Some((user_id, connection_id)) = self.release() {
                    clear_flag_if_offline(&self.manager, &user_id, connection_id).await;
                }
            }
            ConnectionState::Connecting | ConnectionState::Authenticated => {
                self.state = ConnectionState::Closed;
                tracing::debug!("Connection closed before activation");
            }
            ConnectionState::Closed | ConnectionState::Rejected => {}
        }
    }

    /// Drop the registry entry if it is still ours.
    fn release(&mut self) -> Option<(UserId, Uuid)> {
        let handle = self.handle.take()?;
        let user_id = handle.user_id().clone();
        let connection_id = handle.connection_id();
        self.manager
            .registry
            .unregister_connection(&user_id, connection_id);
        Some((user_id, connection_id))
    }
}

impl<S: UserStore> Drop for Connection<S> {
    fn drop(&mut self) {
        if self.state != ConnectionState::Active {
            return;
        }
        self.state = ConnectionState::Closed;

        let Some((user_id, connection_id)) = self.release() else {
            return;
        };
        tracing::debug!(user_id = %user_id, "Connection dropped without explicit close");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                runtime.spawn(async move {
                    clear_flag_if_offline(&manager, &user_id, connection_id).await;
                });
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "No runtime to reset connected flag");
            }
        }
    }
}

/// Reset the flag unless a newer connection for the same user is registered.
///
/// Runs under the user's flag lock, so a concurrent activation either
/// registers before the check or writes `true` after our `false`.
async fn clear_flag_if_offline<S: UserStore>(
    manager: &HandshakeManager<S>,
    user_id: &UserId,
    connection_id: Uuid,
) {
    manager
        .flag_locks
        .with_lock(user_id, async {
            if manager.registry.lookup(user_id).is_some() {
                tracing::info!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    "Connection closed; user still has a newer connection"
                );
                return;
            }

            if let Err(e) = manager.store.set_connected(user_id, false).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to clear connected flag");
            }

            tracing::info!(
                user_id = %user_id,
                connection_id = %connection_id,
                "Connection closed"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryUserStore;
    use herald_common::auth::encode_token;
    use herald_common::types::User;
    use std::time::Duration;
    use tokio::sync::Notify;

    const SECRET: &str = "handshake-test-secret";
    const WAIT: Duration = Duration::from_secs(2);

    fn manager() -> (HandshakeManager<MemoryUserStore>, MemoryUserStore) {
        let store = MemoryUserStore::new();
        let manager = HandshakeManager::new(SECRET, store.clone(), ConnectionRegistry::new(), 8);
        (manager, store)
    }

    fn token_for(user: &UserId) -> String {
        encode_token(user, SECRET, 1).unwrap()
    }

    /// Store whose `set_connected(false)` parks until released.
    #[derive(Clone)]
    struct GatedStore {
        inner: MemoryUserStore,
        clearing: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl UserStore for GatedStore {
        fn find_user(
            &self,
            id: &UserId,
        ) -> impl Future<Output = Result<Option<User>, AppError>> + Send {
            self.inner.find_user(id)
        }

        fn set_connected(
            &self,
            id: &UserId,
            connected: bool,
        ) -> impl Future<Output = Result<(), AppError>> + Send {
            let store = self.clone();
            let id = id.clone();
            async move {
                if !connected {
                    store.clearing.notify_one();
                    store.release.notified().await;
                }
                store.inner.set_connected(&id, connected).await
            }
        }
    }

    #[tokio::test]
    async fn test_valid_token_activates_and_registers() {
        let (manager, store) = manager();
        let user = store.add_user("u1").unwrap();

        let mut conn = manager.begin();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.authenticate(Some(&token_for(&user))).await.unwrap(), user);
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.user_id(), Some(&user));
        assert!(manager.registry().lookup(&user).is_none());

        let (handle, _rx) = conn.activate().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(store.connected(&user), Some(true));
        assert_eq!(
            manager.registry().lookup(&user).unwrap().connection_id(),
            handle.connection_id()
        );
        assert_eq!(manager.flag_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_token_never_touches_registry() {
        let (manager, store) = manager();
        let user = store.add_user("u1").unwrap();
        let forged = encode_token(&user, "some-other-secret", 1).unwrap();

        let mut conn = manager.begin();
        let err = conn.authenticate(Some(&forged)).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(conn.state(), ConnectionState::Rejected);
        assert!(conn.activate().await.is_err());

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Rejected);
        assert!(manager.registry().is_empty());
        assert!(store.flag_writes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (manager, store) = manager();
        let mut conn = manager.begin();
        let err = conn.authenticate(None).await.unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: No token provided");
        assert!(manager.registry().is_empty());
        assert!(store.flag_writes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let (manager, store) = manager();
        let ghost = UserId::new("ghost").unwrap();

        let mut conn = manager.begin();
        assert!(conn.authenticate(Some(&token_for(&ghost))).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Rejected);
        assert!(manager.registry().is_empty());
        assert!(store.flag_writes().is_empty());
    }

    #[tokio::test]
    async fn test_close_before_authentication_is_noop() {
        let (manager, store) = manager();
        let other = store.add_user("someone-else").unwrap();
        let (handle, _rx) = ConnectionHandle::channel(other.clone(), 1);
        manager.registry().register(other, handle);

        let mut conn = manager.begin();
        conn.close().await;
        drop(conn);

        assert_eq!(manager.registry().len(), 1);
        assert!(store.flag_writes().is_empty());
    }

    #[tokio::test]
    async fn test_close_after_authentication_without_activation() {
        let (manager, store) = manager();
        let user = store.add_user("u1").unwrap();

        let mut conn = manager.begin();
        conn.authenticate(Some(&token_for(&user))).await.unwrap();
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(store.flag_writes().is_empty());
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_clears_flag_and_registry() {
        let (manager, store) = manager();
        let user = store.add_user("u1").unwrap();

        let mut conn = manager.begin();
        conn.authenticate(Some(&token_for(&user))).await.unwrap();
        conn.activate().await.unwrap();
        conn.close().await;
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(store.connected(&user), Some(false));
        assert!(manager.registry().lookup(&user).is_none());
        assert_eq!(
            store.flag_writes(),
            vec![(user.clone(), true), (user.clone(), false)]
        );
        assert_eq!(manager.flag_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_stale_close_keeps_newer_connection() {
        let (manager, store) = manager();
        let user = store.add_user("u1").unwrap();
        let token = token_for(&user);

        let mut first = manager.begin();
        first.authenticate(Some(&token)).await.unwrap();
        first.activate().await.unwrap();

        let mut second = manager.begin();
        second.authenticate(Some(&token)).await.unwrap();
        let (h2, _rx2) = second.activate().await.unwrap();

        first.close().await;

        assert_eq!(
            manager.registry().lookup(&user).unwrap().connection_id(),
            h2.connection_id()
        );
        assert_eq!(store.connected(&user), Some(true));
    }

    #[tokio::test]
    async fn test_reconnect_during_slow_close_leaves_flag_set() {
        let inner = MemoryUserStore::new();
        let user = inner.add_user("u1").unwrap();
        let store = GatedStore {
            inner: inner.clone(),
            clearing: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        let manager = HandshakeManager::new(SECRET, store.clone(), ConnectionRegistry::new(), 8);
        let token = token_for(&user);

        let mut first = manager.begin();
        first.authenticate(Some(&token)).await.unwrap();
        first.activate().await.unwrap();

        // The first connection sees the user offline and starts clearing the flag.
        let closing = tokio::spawn(async move {
            first.close().await;
            first
        });
        tokio::time::timeout(WAIT, store.clearing.notified())
            .await
            .expect("close never reached the store");

        // The user reconnects while that write is still in flight.
        let mut second = manager.begin();
        second.authenticate(Some(&token)).await.unwrap();
        let reconnect = tokio::spawn(async move {
            let (handle, rx) = second.activate().await.unwrap();
            (second, handle, rx)
        });
        tokio::task::yield_now().await;

        store.release.notify_one();
        let _first = tokio::time::timeout(WAIT, closing).await.unwrap().unwrap();
        let (_second, handle, _rx) = tokio::time::timeout(WAIT, reconnect)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            manager.registry().lookup(&user).map(|h| h.connection_id()),
            Some(handle.connection_id())
        );
        assert_eq!(inner.connected(&user), Some(true));
        assert_eq!(
            inner.flag_writes(),
            vec![(user.clone(), true), (user.clone(), false), (user.clone(), true)]
        );
    }

    #[tokio::test]
    async fn test_drop_runs_cleanup() {
        let (manager, store) = manager();
        let user = store.add_user("u1").unwrap();

        let mut conn = manager.begin();
        conn.authenticate(Some(&token_for(&user))).await.unwrap();
        conn.activate().await.unwrap();
        drop(conn);

        assert!(manager.registry().lookup(&user).is_none());
        for _ in 0..50 {
            if store.connected(&user) == Some(false) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connected flag was not cleared after drop");
    }
}

//! Relay service. Wires the registry, queue consumer and handshake
//! endpoint together and owns their lifetimes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use herald_common::config::AppConfig;

use crate::consumer::{ConsumerSettings, QueueConsumer};
use crate::handshake::HandshakeManager;
use crate::queue::NotificationQueue;
use crate::registry::ConnectionRegistry;
use crate::routes::create_router;
use crate::state::RelayState;
use crate::store::UserStore;

/// Tuning for the whole relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub consumer: ConsumerSettings,
    /// Per-connection outbound buffer, in events
    pub outbound_buffer: usize,
    pub ping_interval: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            consumer: ConsumerSettings::from_config(config),
            outbound_buffer: config.outbound_buffer.max(1),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            consumer: ConsumerSettings::default(),
            outbound_buffer: 64,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// The relay process: one registry, one queue subscription, one accept loop.
pub struct RelayService<Q, S> {
    secret: Arc<str>,
    queue: Q,
    store: S,
    registry: ConnectionRegistry,
    settings: RelaySettings,
}

impl<Q: NotificationQueue, S: UserStore> RelayService<Q, S> {
    pub fn new(secret: impl Into<Arc<str>>, queue: Q, store: S, settings: RelaySettings) -> Self {
        Self {
            secret: secret.into(),
            queue,
            store,
            registry: ConnectionRegistry::new(),
            settings,
        }
    }

    /// The registry this service owns. Clones share the same map.
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Serve connections on `listener` and consume the queue until `shutdown`
    /// resolves.
    ///
    /// On shutdown the listener stops accepting, live connections are closed,
    /// and the consumer stops fetching and drains what it already fetched.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = QueueConsumer::new(
            self.queue,
            self.store.clone(),
            self.registry.clone(),
            self.settings.consumer.clone(),
        );
        let consumer_task = tokio::spawn(consumer.run(shutdown_rx.clone()));

        let handshake = HandshakeManager::new(
            self.secret,
            self.store,
            self.registry.clone(),
            self.settings.outbound_buffer,
        );
        let state = RelayState::new(
            handshake,
            self.registry.clone(),
            self.settings.ping_interval,
            shutdown_rx,
        );
        let app = create_router(state).layer(TraceLayer::new_for_http());

        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Relay listening");

        // Dropping `shutdown_tx` (e.g. if serving fails) also stops the
        // consumer and every connection.
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutdown requested; closing connections");
                let _ = shutdown_tx.send(true);
            })
            .await;

        if let Err(e) = consumer_task.await {
            tracing::error!(error = %e, "Queue consumer task failed");
        }

        served?;
        Ok(())
    }
}

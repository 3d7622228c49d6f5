//! Shared state handed to every route handler.

use std::time::Duration;

use tokio::sync::watch;

use crate::handshake::HandshakeManager;
use crate::registry::ConnectionRegistry;

/// Relay state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct RelayState<S> {
    pub handshake: HandshakeManager<S>,
    pub registry: ConnectionRegistry,
    pub ping_interval: Duration,
    /// Flips to `true` when the relay is shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl<S> RelayState<S> {
    pub fn new(
        handshake: HandshakeManager<S>,
        registry: ConnectionRegistry,
        ping_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handshake,
            registry,
            ping_interval,
            shutdown,
        }
    }
}

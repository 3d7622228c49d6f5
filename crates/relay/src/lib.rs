//! Herald relay. Pushes queued notifications to users' live WebSocket
//! connections.

pub mod consumer;
pub mod handshake;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;

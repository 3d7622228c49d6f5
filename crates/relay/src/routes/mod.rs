pub mod health;
pub mod ws;

use axum::Router;

use crate::state::RelayState;
use crate::store::UserStore;

/// Build the complete relay router.
pub fn create_router<S: UserStore>(state: RelayState<S>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(ws::router())
        .with_state(state)
}

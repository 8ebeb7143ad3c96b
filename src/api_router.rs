//! API Router
//!
//! Combines the REST endpoints of the agent registry, session store and
//! message log with the WebSocket endpoint into one router.

use axum::Router;
use std::sync::Arc;

use crate::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(crate::agents::configure_agent_routes())
        .merge(crate::sessions::configure_session_routes())
        .merge(crate::messages::configure_message_routes())
        .merge(crate::realtime::configure_realtime_routes())
}

use std::sync::Arc;

use crate::config::AppConfig;
use crate::realtime::RoomRouter;
use crate::shared::utils::DbPool;

/// Shared application state handed to every handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub router: Arc<RoomRouter>,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> Self {
        Self {
            conn,
            config,
            router: Arc::new(RoomRouter::new()),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("config", &self.config)
            .field("router", &"Arc<RoomRouter>")
            .finish()
    }
}

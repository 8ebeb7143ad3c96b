//! Background sweep that closes sessions idle past the configured threshold.
//!
//! This is the only component allowed to close a session without an explicit
//! party action, and it goes through the exact same guarded close path as
//! everyone else, so agent capacity is released consistently and a double
//! close stays a no-op.

use chrono::Duration as ChronoDuration;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::realtime::{events::ServerEvent, room};
use crate::sessions;
use crate::shared::enums::CloseReason;
use crate::shared::error::ChatError;
use crate::shared::state::AppState;

pub struct TimeoutReaper {
    state: Arc<AppState>,
    shutdown: watch::Sender<bool>,
}

impl TimeoutReaper {
    pub fn new(state: Arc<AppState>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { state, shutdown }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let period = Duration::from_secs(self.state.config.chat.reaper_interval_secs);
            info!(
                "timeout reaper started: sweeping every {}s, idle threshold {}s",
                period.as_secs(),
                self.state.config.chat.idle_timeout_secs
            );
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match self.sweep().await {
                            Ok(0) => {}
                            Ok(closed) => info!("closed {} idle sessions", closed),
                            Err(e) => error!("reaper sweep failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("timeout reaper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the sweep loop to exit after the current iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One pass: collect stale sessions, close each through the session
    /// store. A failure on one session must not stop the rest of the batch.
    async fn sweep(&self) -> Result<usize, ChatError> {
        let idle = ChronoDuration::seconds(self.state.config.chat.idle_timeout_secs);
        let stale = {
            let mut conn = self.state.conn.get()?;
            sessions::stale_sessions(&mut conn, idle)?
        };

        let mut closed = 0;
        for session_id in stale {
            let result = {
                let mut conn = self.state.conn.get()?;
                sessions::close_session(&mut conn, session_id, CloseReason::Timeout)
            };
            match result {
                Ok(session) => {
                    closed += 1;
                    self.state
                        .router
                        .broadcast(
                            &room::session(session_id),
                            ServerEvent::SessionClosed { session },
                        )
                        .await;
                }
                Err(e) => error!("failed to close idle session {}: {}", session_id, e),
            }
        }
        Ok(closed)
    }
}

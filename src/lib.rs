pub mod agents;
pub mod api_router;
pub mod config;
pub mod messages;
pub mod realtime;
pub mod reaper;
pub mod sessions;
pub mod shared;

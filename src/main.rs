use anyhow::Context;
use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use chatserver::agents;
use chatserver::api_router::configure_api_routes;
use chatserver::config::AppConfig;
use chatserver::reaper::TimeoutReaper;
use chatserver::shared::state::AppState;
use chatserver::shared::utils::{create_conn, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;

    let pool = create_conn(&config.database_url).context("failed to create database pool")?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("migrations failed: {}", e))?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = Arc::new(AppState::new(pool, config));

    let reaper = Arc::new(TimeoutReaper::new(app_state.clone()));
    reaper.clone().spawn();

    let app = configure_api_routes()
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    info!("starting chat server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let shutdown_state = app_state.clone();
    let shutdown_reaper = reaper.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_reaper.shutdown();
            match shutdown_state.conn.get() {
                Ok(mut conn) => {
                    if let Err(e) = agents::set_all_offline(&mut conn) {
                        error!("failed to mark agents offline: {}", e);
                    }
                }
                Err(e) => error!("no database connection during shutdown: {}", e),
            }
        })
        .await?;

    Ok(())
}

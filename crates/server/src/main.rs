use supervisor_server::{AppState, config::ServerConfig, routes};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] supervisor_server::config::ConfigError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // Load environment variables from `.env` if present
    dotenv::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,supervisor={level},supervisor_server={level},tower_http={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string)
        .map_err(|e| anyhow::anyhow!("invalid tracing filter: {}", e))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = ServerConfig::load()?;
    tracing::info!(
        "[SERVER] Agent service at {}, step timeout {}ms, {} attempts per step",
        config.agent_service_url,
        config.supervisor.step_timeout_ms,
        config.supervisor.max_attempts
    );

    let state = AppState::from_config(config.clone());

    // Lifecycle sweep: connections, idle flows, alerts
    let heartbeat_state = state.clone();
    let interval = config.supervisor.heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            heartbeat_state.heartbeat().await;
        }
    });

    let app_router = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Server running on http://{}", local_addr);

    axum::serve(listener, app_router).await?;
    Ok(())
}

use anyhow::Result;
use tapedeck_server::{api, state};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapedeck_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tapedeck server...");

    // Load configuration
    let config = state::Config::load()?;
    tracing::info!("Recordings are stored under {}", config.storage_root.display());

    // Create application state
    let state = state::AppState::new(config.clone())?;

    // Build the router
    let app = api::create_router(state);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_ingest::config::Config;
use feed_ingest::fetcher::HttpFetcher;
use feed_ingest::routes::{self, AppState};
use feed_ingest::service::FeedService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feed_ingest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; a bad source list is fatal
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FEEDS_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("feeds.toml"));
    let config = Config::load(&config_path)?;

    let fetcher = Arc::new(HttpFetcher::new(config.fetcher_config())?);
    let service = Arc::new(FeedService::new(&config, fetcher)?);
    info!("Loaded {} feeds from {}", config.feeds.len(), config_path.display());

    // Start per-feed polling
    service.start().await;

    let state = Arc::new(AppState {
        service: service.clone(),
        config_path,
    });
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    // The hosting platform supplies the port
    let port: u16 = match std::env::var("PORT") {
        Ok(port) => port.parse()?,
        Err(_) => 3000,
    };
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server starting on http://localhost:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

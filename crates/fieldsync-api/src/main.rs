mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use fieldsync_core::{LibSqlConnector, SyncEngine};
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldsync_api=info".parse().expect("valid directive"))
                .add_directive("fieldsync_core=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting fieldsync-api with config: {:?}", config);

    let engine = Arc::new(
        SyncEngine::connect(config.engine.clone(), Arc::new(LibSqlConnector::new())).await?,
    );
    let heartbeat = engine.spawn_heartbeat();

    let state = AppState::new(Arc::clone(&config), Arc::clone(&engine));
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("fieldsync-api listening on {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown(config.shutdown_grace).await;
    if let Err(err) = heartbeat.await {
        tracing::warn!(error = %err, "Heartbeat task ended abnormally");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

//! Render gateway server
//!
//! Serves `GET /_render?url=<page url>` by running the configured JavaScript
//! bundle inside a fresh sandbox per request.
//!
//!   render-gateway --bundle-url https://cdn.example.com/dist/ --script vendor.js,app.js
//!   render-gateway --bundle-dir ./dist --script app.js
//!
//! Every flag can also be set through its environment variable (`PORT`,
//! `RENDER_WORKERS`, `RENDER_BUNDLE_URL`, ...); see `--help`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;

use render_gateway::{
    handler, AppState, BundleConfiguration, DenoEngine, GatewayConfig, Logger, RenderPool,
    SandboxEnvironment, TracingLogger,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::parse();

    // Default to INFO, RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let logger: Arc<dyn Logger> = Arc::new(TracingLogger);
    let bundle = Arc::new(BundleConfiguration::from_config(&config, Arc::clone(&logger))?);
    let environment = Arc::new(SandboxEnvironment::new(
        bundle,
        DenoEngine,
        config.environment_options(),
        Arc::clone(&logger),
    )?);
    let pool = Arc::new(RenderPool::new(environment, config.workers)?);

    let app = handler::router(AppState::new(
        Arc::clone(&pool),
        logger,
        config.secret.clone(),
    ));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("render-gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down render workers");
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown(),
        Err(_) => tracing::warn!("Render pool still in use at shutdown"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}

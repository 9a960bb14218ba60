//! Tenant Gateway - Main entry point
//!
//! This is the main server that:
//! - Routes HTTP requests to tenants by host name
//! - Loads tenant libraries on first use
//! - Reloads or evicts tenants as their deployments change

use anyhow::Result;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_gateway::server::{self, GatewayState};
use tenant_gateway::{AppConfig, DylibLoader, ModuleHost, TenantRouter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,tenant_gateway=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tenant Gateway");

    // Load configuration
    let config = AppConfig::from_env();
    tracing::info!("Configuration loaded: {:?}", config);

    let modules = ModuleHost::new(DylibLoader::new());
    let router = Arc::new(TenantRouter::start(config.router.clone(), modules));

    let state = Arc::new(GatewayState {
        config: config.clone(),
        router: Arc::clone(&router),
    });

    let app = server::create_gateway_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    router.shutdown().await;
    tracing::info!("Gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

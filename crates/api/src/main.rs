//! Membra API Server
//!
//! Serves order creation and lookup, the Stripe webhook and admin
//! reconciliation endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use membra_api::{create_router, AppState, Config};
use membra_billing::BillingService;
use membra_shared::{create_pool, init_tracing, run_migrations, DbConfig, LogFormat};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing(
        "info,membra_api=debug,membra_billing=debug,tower_http=info",
        LogFormat::from_env(),
    );

    tracing::info!("Starting Membra API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let db_config =
        DbConfig::from_env().ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
    tracing::info!(config = ?config, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&db_config).await?;
    tracing::info!("Database connection established");

    if db_config.run_migrations {
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let billing = Arc::new(BillingService::from_env(pool)?);
    tracing::info!("Stripe billing service initialized");

    if config.run_reconciler {
        billing.reconciler.start();
    } else {
        tracing::info!("Polling reconciler left to the worker");
    }

    let state = AppState::new(billing.clone(), &config);

    // Explicit origin allowlist
    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    billing.reconciler.stop();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use table_booking::config::{AppConfig, StoreBackend};
use table_booking::metrics::EngineMetrics;
use table_booking::policy::PolicyEngine;
use table_booking::refunds::SimulatedRefundGateway;
use table_booking::store::{BookingStore, MemoryStore, PgStore};
use table_booking::sweep::SweepScheduler;
use table_booking::{create_router, db, AppState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!("Table Booking API - Starting...");

    let config = AppConfig::from_env().expect("Invalid configuration");

    let store: Arc<dyn BookingStore> = match config.store {
        StoreBackend::Postgres => {
            let database_url = config.database_url.as_deref().expect("DATABASE_URL must be set in environment");

            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url, config.db_statement_timeout_ms)
                .await
                .expect("Failed to create database pool");

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Migrations completed successfully");

            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let metrics = EngineMetrics::new();
    let gateway_timeout = Duration::from_millis(config.gateway_timeout_ms);
    let state = AppState::new(
        store.clone(),
        config.policy.clone(),
        config.gateway.clone(),
        Arc::new(SimulatedRefundGateway::new(Duration::from_millis(200))),
        gateway_timeout,
        &config.jwt_secret,
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = Arc::new(SweepScheduler::new(store, PolicyEngine::new(config.policy.clone()), metrics));
    let sweep_handle = tokio::spawn(sweep.run(Duration::from_secs(config.sweep_interval_secs), shutdown_rx));

    let app = create_router(state, Duration::from_secs(config.request_timeout_secs));

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Table Booking API is running on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep_handle.await {
        tracing::error!("Sweep scheduler ended abnormally: {}", e);
    }
    tracing::info!("Table Booking API stopped");
}

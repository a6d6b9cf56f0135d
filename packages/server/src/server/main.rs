// Main entry point for the dialer server

use std::sync::Arc;

use anyhow::{Context, Result};
use dialer_core::config::Config;
use dialer_core::coordinator::RedisCoordinator;
use dialer_core::dispatch::{
    retry::start_retry_scheduler, CallWorker, CounterReconciler, InvariantMonitor, LeaseJanitor,
    Promoter, QueueReconciler, WaitlistCompactor, WaitlistSyncer,
};
use dialer_core::domains::campaigns::PostgresCampaignStore;
use dialer_core::kernel::{
    DialerKernel, DispatchConfig, ExotelCarrier, ServiceHost, StaticPhoneDirectory,
};
use dialer_core::server::build_app;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dialer_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting campaign dialer");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Durable store
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    // Coordinator substrate
    tracing::info!("Connecting to coordinator...");
    let coordinator = Arc::new(
        RedisCoordinator::connect(&config.redis_url)
            .await
            .context("Failed to connect to redis")?,
    );

    let dial_from =
        std::env::var("EXOTEL_FROM_NUMBER").context("EXOTEL_FROM_NUMBER must be set")?;
    let dial_app = std::env::var("EXOTEL_APP_ID").context("EXOTEL_APP_ID must be set")?;

    let kernel = Arc::new(DialerKernel::new(
        Arc::new(PostgresCampaignStore::new(pool)),
        coordinator,
        Arc::new(ExotelCarrier::new()),
        Arc::new(StaticPhoneDirectory::from_config(
            &config.exotel,
            dial_from,
            dial_app,
        )),
        DispatchConfig::from(&config),
    ));

    // Background services. Only the primary instance dials; every instance
    // promotes and reconciles.
    let mut host = ServiceHost::new();
    host.spawn(Box::new(WaitlistSyncer::new(kernel.clone())));
    host.spawn(Box::new(Promoter::new(kernel.clone())));
    host.spawn(Box::new(LeaseJanitor::new(kernel.clone())));
    host.spawn(Box::new(WaitlistCompactor::new(kernel.clone())));
    host.spawn(Box::new(QueueReconciler::new(kernel.clone())));
    host.spawn(Box::new(CounterReconciler::new(kernel.clone())));
    host.spawn(Box::new(InvariantMonitor::new(kernel.clone())));
    if config.primary {
        host.spawn(Box::new(CallWorker::new(kernel.clone())));
    } else {
        tracing::info!("non-primary instance: call worker disabled");
    }

    let _retry_scheduler = start_retry_scheduler(kernel.clone())
        .await
        .context("Failed to start retry scheduler")?;

    // HTTP surface
    let app = build_app(kernel);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let shutdown = host.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Stop services without mass-releasing leases: in-flight slots are
    // reclaimed by TTL + janitor.
    host.shutdown().await;
    tracing::info!("dialer stopped");
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or, on unix, SIGTERM — the signal container
/// runtimes send on a normal stop.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

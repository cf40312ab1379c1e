use payment_gateway::api;
use payment_gateway::config::AppConfig;
use payment_gateway::database::{
    init_pool_from_config, InMemoryTransactionStore, PgTransactionRepository, TransactionStore,
};
use payment_gateway::logging::init_tracing;
use payment_gateway::payments::ProviderRegistry;
use payment_gateway::services::{NotificationService, PaymentOrchestrator};
use payment_gateway::workers::ExpirySweeper;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "🚀 Starting payment gateway service"
    );

    let store: Arc<dyn TransactionStore> = match &config.database {
        Some(database) => {
            info!("📊 Initializing database connection pool...");
            let pool = init_pool_from_config(database).await.map_err(|e| {
                error!("❌ Failed to initialize database: {}", e);
                e
            })?;
            info!("✅ Database ready");
            Arc::new(PgTransactionRepository::new(pool))
        }
        None => {
            warn!("⏭️  DATABASE_URL not set, using the in-memory transaction store");
            Arc::new(InMemoryTransactionStore::new())
        }
    };

    let registry = ProviderRegistry::from_config(config.vnpay.clone(), config.gateway.clone())?;
    info!(
        providers = ?registry.list_available_providers(),
        "✅ Payment providers registered"
    );

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        registry,
        store.clone(),
        Arc::new(NotificationService::new()),
    ));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = ExpirySweeper::new(store, config.sweeper.clone());
        info!("🧹 Expiry sweeper started");
        Some(tokio::spawn(sweeper.run(worker_shutdown_rx)))
    } else {
        info!("⏭️  Expiry sweeper disabled (EXPIRY_SWEEP_ENABLED=false)");
        None
    };

    let app = api::router(orchestrator);
    info!("✅ Routes configured");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for expiry sweeper shutdown");
        }
    }

    info!("👋 Server shutdown complete");

    Ok(())
}

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hospital_audit::access::AccessPolicy;
use hospital_audit::api;
use hospital_audit::compliance::ComplianceScheduler;
use hospital_audit::config::AppConfig;
use hospital_audit::database::{AuditStore, Database, MemoryStore};
use hospital_audit::{AuditService, BackgroundTasks};

const MEMORY_URL: &str = "memory://";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hospital_audit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting hospital audit service");

    // Load configuration
    let config = AppConfig::load()?;
    info!("Configuration loaded");

    // Initialize ledger store
    let store: Arc<dyn AuditStore> = if config.database.url == MEMORY_URL {
        warn!("Using in-memory audit ledger; entries will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let database =
            Database::with_max_connections(&config.database.url, config.database.max_connections).await?;
        info!("Database connected");

        database.run_migrations().await?;
        info!("Database migrations completed");
        Arc::new(database)
    };

    // Load access policy
    let policy = match &config.access_policy_path {
        Some(path) => {
            let policy = AccessPolicy::from_file(Path::new(path))?;
            info!("Access policy loaded from {}", path);
            policy
        }
        None => AccessPolicy::default(),
    };

    let service = AuditService::new(store, &config, policy);

    // Start background tasks
    let scheduler = ComplianceScheduler::new(service.clone(), config.compliance.clone());
    let background = BackgroundTasks::start(&service, &scheduler);
    info!(
        "Audit drain worker and compliance scheduler started ({} jobs)",
        background.job_count()
    );

    // Build application
    let app = api::router(service);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, flushing queued audit events");
    background.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

use event_store::SqlxEventStore;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::RedisStreamBroker;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_service::handlers::{AuditLogHandler, HandlerRegistry};
use worker_service::{Config, Worker};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {e}");
            eprintln!("ERROR: Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting worker-service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.app_env);
    tracing::info!(
        stream = %config.worker.stream_name,
        group = %config.worker.group_name,
        consumer = %config.worker.consumer_name,
        "Consumer identity"
    );

    let connect_options = config
        .database_url
        .parse::<PgConnectOptions>()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("database url: {e}")))?
        .options([("statement_timeout", "30s")]);

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .test_before_acquire(true)
        .connect_with(connect_options)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("database pool: {e}")))?;

    tracing::info!("Connected to database");

    let broker = RedisStreamBroker::connect(&config.redis_url)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("redis client: {e}")))?;

    let mut registry = HandlerRegistry::new();
    for event_type in &config.handled_event_types {
        registry.register(Arc::new(AuditLogHandler::new(event_type.clone())));
    }
    if registry.is_empty() {
        tracing::warn!(
            "WORKER_EVENT_TYPES is empty; deliveries will fail retryably until handlers are registered"
        );
    } else {
        tracing::info!(handler_count = registry.len(), "Handlers registered");
    }

    let worker = Worker::new(
        Arc::new(SqlxEventStore::new(pool)),
        Arc::new(broker),
        Arc::new(registry),
        config.worker.clone(),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let worker_task = tokio::spawn(async move { worker.run(shutdown_rx).await });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    let _ = worker_task.await;

    tracing::info!("Worker-service shutting down");
    Ok(())
}

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use chrono::Utc;
use ingest_service::services::{IngestService, IngestionSettings, RetryScheduler};
use ingest_service::{handlers, metrics, Config};
use redis::Client as RedisClient;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_broker::RedisStreamBroker;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactional_outbox::metrics::OutboxMetrics;
use transactional_outbox::{OutboxRelay, RelayConfig, SqlxOutboxRepository, StreamOutboxPublisher};

struct HealthState {
    db_pool: sqlx::Pool<sqlx::Postgres>,
    redis_client: RedisClient,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    checks: HashMap<String, ComponentCheck>,
    timestamp: String,
}

impl HealthState {
    async fn check_postgres(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.db_pool)
            .await
            .map(|_| ())
    }

    async fn check_redis(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "unexpected PING response",
            )))
        }
    }
}

async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"alive": true}))
}

async fn readiness_check(state: web::Data<HealthState>) -> HttpResponse {
    let mut checks = HashMap::new();
    let mut ready = true;

    let start = Instant::now();
    let pg_result = state.check_postgres().await;
    let pg_latency = Some(start.elapsed().as_millis() as u64);
    checks.insert(
        "postgresql".to_string(),
        match pg_result {
            Ok(_) => ComponentCheck {
                status: ComponentStatus::Healthy,
                message: "PostgreSQL connection successful".to_string(),
                latency_ms: pg_latency,
            },
            Err(e) => {
                ready = false;
                ComponentCheck {
                    status: ComponentStatus::Unhealthy,
                    message: format!("PostgreSQL connection failed: {e}"),
                    latency_ms: pg_latency,
                }
            }
        },
    );

    let start = Instant::now();
    let redis_result = state.check_redis().await;
    let redis_latency = Some(start.elapsed().as_millis() as u64);
    checks.insert(
        "redis".to_string(),
        match redis_result {
            Ok(_) => ComponentCheck {
                status: ComponentStatus::Healthy,
                message: "Redis ping successful".to_string(),
                latency_ms: redis_latency,
            },
            Err(e) => {
                ready = false;
                ComponentCheck {
                    status: ComponentStatus::Unhealthy,
                    message: format!("Redis ping failed: {e}"),
                    latency_ms: redis_latency,
                }
            }
        },
    );

    let response = ReadinessResponse {
        ready,
        checks,
        timestamp: Utc::now().to_rfc3339(),
    };

    if ready {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

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

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=warn,sqlx=warn".into()),
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

    tracing::info!("Starting ingest-service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.app.env);

    let connect_options = config
        .database
        .url
        .parse::<PgConnectOptions>()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("database url: {e}")))?
        .options([("statement_timeout", "30s")]);

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .test_before_acquire(true)
        .connect_with(connect_options)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("database pool: {e}")))?;

    tracing::info!("Connected to database");

    let redis_client = RedisClient::open(config.redis.url.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("redis client: {e}")))?;
    let broker = Arc::new(RedisStreamBroker::new(redis_client.clone()));

    let ingest_service = Arc::new(IngestService::new(
        db_pool.clone(),
        IngestionSettings {
            allowed_event_types: config.ingestion.allowed_event_types.clone(),
            stream_name: config.ingestion.stream_name.clone(),
        },
    ));

    let outbox_repository = Arc::new(SqlxOutboxRepository::new(db_pool.clone()));
    let outbox_publisher = Arc::new(StreamOutboxPublisher::new(broker));
    let relay = OutboxRelay::new(
        outbox_repository,
        outbox_publisher,
        RelayConfig {
            poll_interval: config.outbox.poll_interval,
            max_batch: config.outbox.max_batch_size,
        },
    )
    .with_metrics(OutboxMetrics::new("ingest-service"));

    let scheduler = RetryScheduler::new(
        db_pool.clone(),
        config.ingestion.stream_name.clone(),
        config.scheduler.clone(),
    );

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("Starting HTTP server at {}", bind_address);

    let service_data = web::Data::new(ingest_service);
    let health_state = web::Data::new(HealthState {
        db_pool: db_pool.clone(),
        redis_client,
    });
    let cors_origins = config.cors.allowed_origins.clone();

    let server = HttpServer::new(move || {
        let mut cors = Cors::default();
        for origin in cors_origins.split(',') {
            let origin = origin.trim();
            if origin == "*" {
                cors = cors.allow_any_origin();
            } else {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors.allow_any_method().allow_any_header().max_age(3600);

        App::new()
            .app_data(service_data.clone())
            .app_data(health_state.clone())
            .wrap(cors)
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/events", web::post().to(handlers::ingest_event))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .route("/health/live", web::get().to(liveness_check))
            .route("/health/ready", web::get().to(readiness_check))
    })
    .bind(&bind_address)?
    .workers(4)
    .run();

    let server_handle = server.handle();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut tasks: JoinSet<io::Result<()>> = JoinSet::new();

    tasks.spawn(async move {
        tracing::info!("HTTP server is running");
        server.await
    });

    let relay_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move {
        relay.run(relay_shutdown).await;
        Ok(())
    });

    let scheduler_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move {
        scheduler.run(scheduler_shutdown).await;
        Ok(())
    });

    let mut first_error: Option<io::Error> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = tasks.join_next() => {
                match result {
                    Some(Ok(Ok(_))) => {
                        tracing::info!("Background task completed");
                    }
                    Some(Ok(Err(e))) => {
                        tracing::error!("Task returned error: {e}");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        let _ = shutdown_tx.send(());
                        server_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Task join error: {e}");
                        if first_error.is_none() {
                            first_error = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                        }
                        let _ = shutdown_tx.send(());
                        server_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(());
                server_handle.stop(true).await;
                tasks.shutdown().await;
                break;
            }
        }
    }

    tracing::info!("Ingest-service shutting down");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

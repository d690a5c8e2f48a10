/// Configuration for the worker process, loaded from environment variables
/// with defaults suitable for local development.
use crate::consumer::WorkerConfig;
use resilience::BackoffConfig;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    /// Application environment (development, staging, production)
    pub app_env: String,
    /// PostgreSQL URL
    pub database_url: String,
    pub database_max_connections: u32,
    /// Redis URL for the stream broker
    pub redis_url: String,
    /// Event types the built-in audit handler registers for
    pub handled_event_types: Vec<String>,
    /// Consumer loop tuning
    pub worker: WorkerConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let worker = WorkerConfig {
            stream_name: env_or("WORKER_STREAM_NAME", "events:stream"),
            group_name: env_or("WORKER_GROUP_NAME", "event-workers"),
            consumer_name: std::env::var("WORKER_CONSUMER_NAME")
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            read_batch_size: env_parse("WORKER_READ_BATCH_SIZE", 10),
            empty_read_delay: Duration::from_millis(env_parse("WORKER_EMPTY_READ_DELAY_MS", 250)),
            error_delay: Duration::from_millis(env_parse("WORKER_ERROR_DELAY_MS", 1000)),
            claim_min_idle_ms: env_parse("WORKER_CLAIM_MIN_IDLE_MS", 30_000),
            claim_batch_size: env_parse("WORKER_CLAIM_BATCH_SIZE", 10),
            reclaim_interval: Duration::from_millis(env_parse("WORKER_RECLAIM_INTERVAL_MS", 30_000)),
            drain_max_batches: env_parse("WORKER_DRAIN_MAX_BATCHES", 10),
            drain_max_messages: env_parse("WORKER_DRAIN_MAX_MESSAGES", 500),
            bootstrap: BackoffConfig {
                initial_delay: Duration::from_millis(env_parse("WORKER_BOOTSTRAP_INITIAL_MS", 500)),
                max_delay: Duration::from_millis(env_parse("WORKER_BOOTSTRAP_MAX_MS", 30_000)),
                backoff_factor: env_parse("WORKER_BOOTSTRAP_FACTOR", 2.0),
                max_attempts: env_parse("WORKER_BOOTSTRAP_MAX_ATTEMPTS", 0),
            },
        };

        if worker.stream_name.trim().is_empty() {
            return Err("WORKER_STREAM_NAME must be non-blank".to_string());
        }
        if worker.group_name.trim().is_empty() {
            return Err("WORKER_GROUP_NAME must be non-blank".to_string());
        }
        if worker.read_batch_size == 0 {
            return Err("WORKER_READ_BATCH_SIZE must be positive".to_string());
        }

        Ok(Config {
            app_env: env_or("APP_ENV", "development"),
            database_url: env_or("DATABASE_URL", "postgresql://localhost/events"),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            handled_event_types: split_list(&env_or("WORKER_EVENT_TYPES", "")),
            worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_splitting_trims_and_drops_blanks() {
        assert_eq!(
            split_list("user.created, order.placed ,,"),
            vec!["user.created".to_string(), "order.placed".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}

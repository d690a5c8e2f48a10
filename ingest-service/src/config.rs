/// Configuration management for the ingestion service.
///
/// Loaded from environment variables with development defaults. Production
/// deployments must configure the event-type allow-list: startup fails when
/// `APP_ENV=production` and `ALLOWED_EVENT_TYPES` is empty.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub cors: CorsConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub ingestion: IngestionConfig,
    pub outbox: OutboxConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application environment (development, staging, production)
    pub env: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Comma-separated list of allowed origins
    pub allowed_origins: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Allow-list for event_type
    pub allowed_event_types: Vec<String>,
    /// Target broker stream for outbox rows
    pub stream_name: String,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub max_batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
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

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let config = Config {
            app: AppConfig {
                env: env_or("APP_ENV", "development"),
                host: env_or("INGEST_HOST", "0.0.0.0"),
                port: env_parse("INGEST_PORT", 8080),
            },
            cors: CorsConfig {
                allowed_origins: env_or("CORS_ALLOWED_ORIGINS", "*"),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "postgresql://localhost/events"),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 20),
            },
            redis: RedisConfig {
                url: env_or("REDIS_URL", "redis://localhost:6379"),
            },
            ingestion: IngestionConfig {
                allowed_event_types: env_or("ALLOWED_EVENT_TYPES", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                stream_name: env_or("INGEST_STREAM_NAME", "events:stream"),
            },
            outbox: OutboxConfig {
                poll_interval: Duration::from_millis(env_parse("OUTBOX_POLL_INTERVAL_MS", 1000)),
                max_batch_size: env_parse("OUTBOX_MAX_BATCH_SIZE", 100),
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(env_parse("SCHEDULER_POLL_INTERVAL_MS", 5000)),
                batch_size: env_parse("SCHEDULER_BATCH_SIZE", 50),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.app.env == "production"
    }

    fn validate(&self) -> Result<(), String> {
        if self.is_production() && self.ingestion.allowed_event_types.is_empty() {
            return Err(
                "ALLOWED_EVENT_TYPES must be non-empty when APP_ENV=production".to_string(),
            );
        }
        if self.ingestion.stream_name.trim().is_empty() {
            return Err("INGEST_STREAM_NAME must be non-blank".to_string());
        }
        if self.outbox.max_batch_size <= 0 {
            return Err("OUTBOX_MAX_BATCH_SIZE must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            app: AppConfig {
                env: "development".into(),
                host: "0.0.0.0".into(),
                port: 8080,
            },
            cors: CorsConfig {
                allowed_origins: "*".into(),
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/events".into(),
                max_connections: 20,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".into(),
            },
            ingestion: IngestionConfig {
                allowed_event_types: Vec::new(),
                stream_name: "events:stream".into(),
            },
            outbox: OutboxConfig {
                poll_interval: Duration::from_millis(1000),
                max_batch_size: 100,
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(5000),
                batch_size: 50,
            },
        }
    }

    #[test]
    fn development_tolerates_an_empty_allow_list() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn production_requires_an_allow_list() {
        let mut config = base_config();
        config.app.env = "production".into();
        assert!(config.validate().is_err());

        config.ingestion.allowed_event_types = vec!["user.created".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn blank_stream_name_is_rejected() {
        let mut config = base_config();
        config.ingestion.stream_name = " ".into();
        assert!(config.validate().is_err());
    }
}

pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;

pub use config::Config;
pub use consumer::{Worker, WorkerConfig};
pub use error::WorkerError;
pub use handlers::{AuditLogHandler, EventHandler, HandlerRegistry};

pub mod config;
pub mod connectors;
pub mod errors;
pub mod fallback;
pub mod models;
pub mod normalizer;
pub mod progress;
pub mod scheduler;
pub mod store;

pub use crate::config::EngineConfig;
pub use crate::connectors::{Connector, ConnectorFuture, ConnectorRegistry, RawResult, Row};
pub use crate::errors::{AppError, AppResult};
pub use crate::fallback::{FallbackResolver, LastKnownValueStore};
pub use crate::models::{
    BackendKind, ExecutionResult, MetricDefinition, RunAccepted, RunMode, RunState, RunStatus, StopAcknowledgement,
    ValueSource,
};
pub use crate::progress::{ProgressStore, Transition};
pub use crate::scheduler::{EngineOptions, MetricEngine};
pub use crate::store::SqliteValueStore;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "metric-engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

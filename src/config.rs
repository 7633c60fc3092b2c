use crate::connectors::file_table::{FileTableConnector, FileTableSettings};
use crate::connectors::relational::{RelationalConnector, RelationalSettings};
use crate::connectors::ConnectorRegistry;
use crate::errors::{AppError, AppResult};
use crate::models::MetricDefinition;
use crate::scheduler::EngineOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

const MIN_QUERY_TIMEOUT_MS: u64 = 10;
const MAX_QUERY_TIMEOUT_MS: u64 = 600_000;
const MAX_INTER_STEP_DELAY_MS: u64 = 60_000;
const MIN_HISTORY_RETENTION_DAYS: u32 = 1;
const MAX_HISTORY_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSection {
    pub query_timeout_ms: u64,
    pub inter_step_delay_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            query_timeout_ms: 30_000,
            inter_step_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSection {
    pub path: PathBuf,
    pub history_retention_days: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("metric-engine-state.sqlite"),
            history_retention_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub relational: Option<RelationalSettings>,
    pub file_table: Option<FileTableSettings>,
    pub store: StoreSection,
    pub log_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config = serde_yaml::from_str::<Self>(raw)?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        let timeout = self
            .engine
            .query_timeout_ms
            .clamp(MIN_QUERY_TIMEOUT_MS, MAX_QUERY_TIMEOUT_MS);
        if timeout != self.engine.query_timeout_ms {
            tracing::warn!(requested = self.engine.query_timeout_ms, applied = timeout, "query timeout clamped");
            self.engine.query_timeout_ms = timeout;
        }
        self.engine.inter_step_delay_ms = self.engine.inter_step_delay_ms.min(MAX_INTER_STEP_DELAY_MS);
        let retention = self
            .store
            .history_retention_days
            .clamp(MIN_HISTORY_RETENTION_DAYS, MAX_HISTORY_RETENTION_DAYS);
        if retention != self.store.history_retention_days {
            tracing::warn!(
                requested = self.store.history_retention_days,
                applied = retention,
                "history retention clamped"
            );
            self.store.history_retention_days = retention;
        }
        self
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            query_timeout: Duration::from_millis(self.engine.query_timeout_ms),
            inter_step_delay: Duration::from_millis(self.engine.inter_step_delay_ms),
        }
    }

    pub fn connectors(&self) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        if let Some(settings) = &self.relational {
            registry.register(Arc::new(RelationalConnector::new(settings.clone())));
        }
        if let Some(settings) = &self.file_table {
            registry.register(Arc::new(FileTableConnector::new(settings.clone())));
        }
        registry
    }
}

pub fn load_metric_batch(path: &Path) -> AppResult<Vec<MetricDefinition>> {
    let raw = fs::read_to_string(path)
        .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
    Ok(serde_yaml::from_str::<Vec<MetricDefinition>>(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::{load_metric_batch, EngineConfig};
    use crate::models::BackendKind;
    use tokio::time::Duration;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = EngineConfig::from_yaml("{}").expect("empty config");
        assert_eq!(config.engine.query_timeout_ms, 30_000);
        assert_eq!(config.engine.inter_step_delay_ms, 250);
        assert!(config.relational.is_none());
        assert!(!config.connectors().contains(BackendKind::Relational));
    }

    #[test]
    fn parses_connector_sections_and_clamps_limits() {
        let config = EngineConfig::from_yaml(
            r#"
engine:
  queryTimeoutMs: 1
  interStepDelayMs: 999999
relational:
  databasePath: /srv/warehouse.sqlite
fileTable:
  path: /srv/desktop.json
store:
  historyRetentionDays: 30
"#,
        )
        .expect("config");

        let options = config.engine_options();
        assert_eq!(options.query_timeout, Duration::from_millis(10));
        assert_eq!(options.inter_step_delay, Duration::from_millis(60_000));
        assert_eq!(config.store.history_retention_days, 30);
        assert_eq!(config.relational.as_ref().map(|r| r.max_rows), Some(1_000));

        let registry = config.connectors();
        assert!(registry.contains(BackendKind::Relational));
        assert!(registry.contains(BackendKind::FileTable));
    }

    #[test]
    fn clamps_history_retention_into_a_representable_window() {
        let config = EngineConfig::from_yaml("store:\n  historyRetentionDays: 4294967295\n").expect("config");
        assert_eq!(config.store.history_retention_days, 36_500);

        let config = EngineConfig::from_yaml("store:\n  historyRetentionDays: 0\n").expect("config");
        assert_eq!(config.store.history_retention_days, 1);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(EngineConfig::from_yaml("engine: [1, 2").is_err());
    }

    #[test]
    fn loads_metric_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.yaml");
        std::fs::write(
            &path,
            r#"
- id: open-tickets
  displayName: Open tickets
  backendKind: file-table
  query: SELECT COUNT(*) FROM Tickets WHERE Status = 'open'
- id: revenue
  displayName: Revenue
  backendKind: relational
  query: SELECT SUM(amount) AS value FROM orders
  degenerateIsInvalid: true
"#,
        )
        .expect("write batch");

        let batch = load_metric_batch(&path).expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].backend_kind, BackendKind::FileTable);
        assert!(!batch[0].degenerate_is_invalid);
        assert!(batch[1].degenerate_is_invalid);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Relational,
    FileTable,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::FileTable => "file-table",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Live,
    Rehearsal,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Rehearsal => "rehearsal",
        }
    }

    pub fn persists_values(self) -> bool {
        matches!(self, Self::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueSource {
    Live,
    Fallback,
    SyntheticDefault,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Fallback => "fallback",
            Self::SyntheticDefault => "synthetic-default",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub display_name: String,
    pub backend_kind: BackendKind,
    pub query: String,
    #[serde(default)]
    pub degenerate_is_invalid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub metric_id: String,
    pub value: f64,
    pub source: ValueSource,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub mode: RunMode,
    pub active_metric_id: Option<String>,
    pub results: Vec<ExecutionResult>,
    pub cancellation_requested: bool,
    pub total: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn result_for(&self, metric_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|result| result.metric_id == metric_id)
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub run_id: String,
    pub total: usize,
    pub mode: RunMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAcknowledgement {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuePoint {
    pub metric_id: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

use crate::errors::{AppError, AppResult};
use crate::models::{ExecutionResult, RunMode, RunState, RunStatus};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transition {
    #[serde(rename_all = "camelCase")]
    Started {
        run_id: String,
        mode: RunMode,
        total: usize,
        first_metric_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CancellationRequested { run_id: String },
    #[serde(rename_all = "camelCase")]
    MetricDispatched { run_id: String, index: usize, metric_id: String },
    #[serde(rename_all = "camelCase")]
    ResultRecorded { run_id: String, index: usize, result: ExecutionResult },
    #[serde(rename_all = "camelCase")]
    Cancelled { run_id: String },
    #[serde(rename_all = "camelCase")]
    Completed { run_id: String },
    #[serde(rename_all = "camelCase")]
    Failed { run_id: String, message: String },
}

#[derive(Clone)]
pub struct ProgressStore {
    state: Arc<RwLock<RunState>>,
    transitions: broadcast::Sender<Transition>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(RunState::default())),
            transitions,
        }
    }

    pub fn snapshot(&self) -> RunState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.read().map(|state| state.status).unwrap_or(RunStatus::Error)
    }

    pub fn cancellation_requested(&self) -> bool {
        self.read().map(|state| state.cancellation_requested).unwrap_or(false)
    }

    /// Single-flight entry: resets the state and marks it running, or refuses
    /// without touching anything when a run is already in progress.
    pub fn begin(&self, run_id: &str, mode: RunMode, total: usize, first_metric_id: &str) -> AppResult<()> {
        let transition = Transition::Started {
            run_id: run_id.to_string(),
            mode,
            total,
            first_metric_id: first_metric_id.to_string(),
        };
        {
            let mut state = self.write()?;
            if state.status == RunStatus::Running {
                return Err(AppError::AlreadyRunning(format!(
                    "run {} is still in progress",
                    state.run_id.as_deref().unwrap_or("unknown")
                )));
            }
            apply_to(&mut state, &transition);
        }
        let _ = self.transitions.send(transition);
        Ok(())
    }

    pub fn request_cancellation(&self) -> AppResult<bool> {
        let transition = {
            let mut state = self.write()?;
            if state.status != RunStatus::Running {
                return Ok(false);
            }
            let transition = Transition::CancellationRequested {
                run_id: state.run_id.clone().unwrap_or_default(),
            };
            apply_to(&mut state, &transition);
            transition
        };
        let _ = self.transitions.send(transition);
        Ok(true)
    }

    pub fn apply(&self, transition: Transition) -> AppResult<()> {
        {
            let mut state = self.write()?;
            if state.status != RunStatus::Running {
                tracing::debug!(?transition, status = state.status.as_str(), "ignoring transition outside a running run");
                return Ok(());
            }
            apply_to(&mut state, &transition);
        }
        let _ = self.transitions.send(transition);
        Ok(())
    }

    fn read(&self) -> AppResult<RwLockReadGuard<'_, RunState>> {
        self.state
            .read()
            .map_err(|_| AppError::Internal("progress state lock poisoned".to_string()))
    }

    fn write(&self) -> AppResult<RwLockWriteGuard<'_, RunState>> {
        self.state
            .write()
            .map_err(|_| AppError::Internal("progress state lock poisoned".to_string()))
    }
}

fn apply_to(state: &mut RunState, transition: &Transition) {
    match transition {
        Transition::Started {
            run_id,
            mode,
            total,
            first_metric_id,
        } => {
            *state = RunState {
                run_id: Some(run_id.clone()),
                status: RunStatus::Running,
                mode: *mode,
                active_metric_id: Some(first_metric_id.clone()),
                results: Vec::with_capacity(*total),
                cancellation_requested: false,
                total: *total,
                started_at: Some(Utc::now()),
                finished_at: None,
                last_error: None,
            };
        }
        Transition::CancellationRequested { .. } => {
            state.cancellation_requested = true;
        }
        Transition::MetricDispatched { metric_id, .. } => {
            state.active_metric_id = Some(metric_id.clone());
        }
        Transition::ResultRecorded { result, .. } => {
            state.results.push(result.clone());
        }
        Transition::Cancelled { .. } => {
            state.active_metric_id = None;
            state.status = RunStatus::Idle;
            state.finished_at = Some(Utc::now());
        }
        Transition::Completed { .. } => {
            state.active_metric_id = None;
            state.status = RunStatus::Complete;
            state.finished_at = Some(Utc::now());
        }
        Transition::Failed { message, .. } => {
            state.active_metric_id = None;
            state.status = RunStatus::Error;
            state.finished_at = Some(Utc::now());
            state.last_error = Some(message.clone());
        }
    }
}

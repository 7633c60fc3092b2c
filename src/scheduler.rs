use crate::connectors::ConnectorRegistry;
use crate::errors::{AppError, AppResult};
use crate::fallback::{FallbackResolver, LastKnownValueStore};
use crate::models::{ExecutionResult, MetricDefinition, RunAccepted, RunMode, RunState, StopAcknowledgement};
use crate::normalizer::{normalize, Normalized};
use crate::progress::{ProgressStore, Transition};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_INTER_STEP_DELAY_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub query_timeout: Duration,
    pub inter_step_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            inter_step_delay: Duration::from_millis(DEFAULT_INTER_STEP_DELAY_MS),
        }
    }
}

impl EngineOptions {
    fn query_timeout_ms(&self) -> u64 {
        u64::try_from(self.query_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Clone)]
pub struct MetricEngine {
    connectors: ConnectorRegistry,
    resolver: FallbackResolver,
    progress: ProgressStore,
    options: EngineOptions,
    loop_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MetricEngine {
    pub fn new(connectors: ConnectorRegistry, store: Arc<dyn LastKnownValueStore>, options: EngineOptions) -> Self {
        Self {
            connectors,
            resolver: FallbackResolver::new(store),
            progress: ProgressStore::new(),
            options,
            loop_task: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn run(&self, metrics: &[MetricDefinition], mode: RunMode) -> AppResult<RunAccepted> {
        self.validate_batch(metrics)?;

        let batch: Arc<[MetricDefinition]> = metrics.to_vec().into();
        let run_id = Uuid::new_v4().to_string();
        if let Err(error) = self.progress.begin(&run_id, mode, batch.len(), &batch[0].id) {
            tracing::warn!(error = %error, "run rejected");
            return Err(error);
        }
        tracing::info!(run_id = %run_id, total = batch.len(), mode = mode.as_str(), "metric run accepted");

        let engine = self.clone();
        let progress = self.progress.clone();
        let supervised_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let driver = tokio::spawn(engine.drive(supervised_run_id.clone(), batch, mode));
            if let Err(join_error) = driver.await {
                tracing::error!(run_id = %supervised_run_id, error = %join_error, "metric run loop aborted");
                let _ = progress.apply(Transition::Failed {
                    run_id: supervised_run_id,
                    message: AppError::Internal(format!("run loop aborted: {}", join_error)).to_string(),
                });
            }
        });

        // Any previous handle belongs to a loop that already ended.
        *self.loop_task.lock().await = Some(handle);

        Ok(RunAccepted {
            run_id,
            total: metrics.len(),
            mode,
        })
    }

    /// Asks the loop to stop at its next step boundary. An in-flight query is
    /// never interrupted.
    pub fn stop(&self) -> AppResult<StopAcknowledgement> {
        let accepted = self.progress.request_cancellation()?;
        if accepted {
            tracing::info!("metric run cancellation requested");
        }
        Ok(StopAcknowledgement { accepted })
    }

    pub fn get_state(&self) -> RunState {
        self.progress.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.progress.subscribe()
    }

    pub async fn wait(&self) -> RunState {
        let handle = self.loop_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(join_error) = handle.await {
                tracing::error!(error = %join_error, "metric run supervisor stopped unexpectedly");
            }
        }
        self.progress.snapshot()
    }

    pub fn shutdown(&self) {
        self.connectors.close_all();
    }

    fn validate_batch(&self, metrics: &[MetricDefinition]) -> AppResult<()> {
        if metrics.is_empty() {
            return Err(AppError::InvalidInput("metric batch is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for metric in metrics {
            if metric.id.trim().is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "metric '{}' has a blank id",
                    metric.display_name
                )));
            }
            if !seen.insert(metric.id.as_str()) {
                return Err(AppError::InvalidInput(format!("duplicate metric id: {}", metric.id)));
            }
            if !self.connectors.contains(metric.backend_kind) {
                return Err(AppError::InvalidInput(format!(
                    "no connector configured for backend '{}' (metric {})",
                    metric.backend_kind.as_str(),
                    metric.id
                )));
            }
        }
        Ok(())
    }

    async fn drive(self, run_id: String, metrics: Arc<[MetricDefinition]>, mode: RunMode) {
        if let Err(error) = self.resolver.probe_store().await {
            tracing::error!(run_id = %run_id, error = %error, "last-known value store unreachable");
            self.record(Transition::Failed {
                run_id,
                message: error.to_string(),
            });
            return;
        }

        let mut index = 0usize;
        loop {
            if self.progress.cancellation_requested() {
                tracing::info!(run_id = %run_id, recorded = index, "metric run cancelled");
                self.record(Transition::Cancelled { run_id });
                return;
            }

            let Some(metric) = metrics.get(index) else {
                tracing::info!(run_id = %run_id, total = metrics.len(), "metric run complete");
                self.record(Transition::Completed { run_id });
                return;
            };

            self.record(Transition::MetricDispatched {
                run_id: run_id.clone(),
                index,
                metric_id: metric.id.clone(),
            });
            tracing::debug!(run_id = %run_id, metric_id = %metric.id, index, "metric dispatched");

            let result = self.execute_metric(metric, mode).await;
            tracing::info!(
                run_id = %run_id,
                metric_id = %metric.id,
                source = result.source.as_str(),
                value = result.value,
                "metric result recorded"
            );
            self.record(Transition::ResultRecorded {
                run_id: run_id.clone(),
                index,
                result,
            });

            index += 1;
            if index < metrics.len() && !self.options.inter_step_delay.is_zero() {
                tokio::time::sleep(self.options.inter_step_delay).await;
            }
        }
    }

    async fn execute_metric(&self, metric: &MetricDefinition, mode: RunMode) -> ExecutionResult {
        let timeout_ms = self.options.query_timeout_ms();
        let fetched = match self.connectors.get(metric.backend_kind) {
            Some(connector) => {
                match timeout(self.options.query_timeout, connector.execute(&metric.query, timeout_ms)).await {
                    Ok(fetched) => fetched,
                    Err(_) => Err(AppError::Timeout(timeout_ms)),
                }
            }
            None => Err(AppError::Internal(format!(
                "no connector configured for backend '{}'",
                metric.backend_kind.as_str()
            ))),
        };

        let (outcome, error) = match fetched {
            Ok(raw) => (normalize(&raw), None),
            Err(error) => (Normalized::invalid("query did not produce a result"), Some(error)),
        };
        self.resolver.resolve(metric, &outcome, error.as_ref(), mode).await
    }

    fn record(&self, transition: Transition) {
        if let Err(error) = self.progress.apply(transition) {
            tracing::error!(error = %error, "failed to record run transition");
        }
    }
}

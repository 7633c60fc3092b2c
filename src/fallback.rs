use crate::errors::{AppError, AppResult};
use crate::models::{ExecutionResult, MetricDefinition, RunMode, ValueSource};
use crate::normalizer::Normalized;
use chrono::Utc;
use std::sync::Arc;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const PLACEHOLDER_FLOOR: u64 = 100;
const PLACEHOLDER_SPAN: u64 = 900;

pub trait LastKnownValueStore: Send + Sync {
    fn get(&self, metric_id: &str) -> AppResult<Option<f64>>;
    fn set(&self, metric_id: &str, value: f64) -> AppResult<()>;

    fn probe(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct FallbackResolver {
    store: Arc<dyn LastKnownValueStore>,
}

impl FallbackResolver {
    pub fn new(store: Arc<dyn LastKnownValueStore>) -> Self {
        Self { store }
    }

    /// Turns one metric's fetch outcome into its recorded result. Never fails.
    pub async fn resolve(
        &self,
        metric: &MetricDefinition,
        outcome: &Normalized,
        error: Option<&AppError>,
        mode: RunMode,
    ) -> ExecutionResult {
        if let Some(failure) = failure_message(metric, outcome, error) {
            return self.substitute(metric, failure).await;
        }

        if mode.persists_values() {
            self.persist_live_value(&metric.id, outcome.value).await;
        }

        ExecutionResult {
            metric_id: metric.id.clone(),
            value: outcome.value,
            source: ValueSource::Live,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub async fn probe_store(&self) -> AppResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.probe())
            .await
            .map_err(|join_error| AppError::Internal(format!("store probe stopped unexpectedly: {}", join_error)))?
    }

    async fn substitute(&self, metric: &MetricDefinition, failure: String) -> ExecutionResult {
        let store = self.store.clone();
        let id = metric.id.clone();
        let stored = match tokio::task::spawn_blocking(move || store.get(&id)).await {
            Ok(Ok(stored)) => stored,
            Ok(Err(error)) => {
                tracing::warn!(metric_id = %metric.id, error = %error, "last-known value lookup failed");
                None
            }
            Err(join_error) => {
                tracing::warn!(metric_id = %metric.id, error = %join_error, "last-known value reader stopped unexpectedly");
                None
            }
        };

        let (value, source) = match stored {
            Some(value) => {
                tracing::warn!(metric_id = %metric.id, failure = %failure, value, "using last-known value");
                (value, ValueSource::Fallback)
            }
            None => {
                let value = synthetic_placeholder(&metric.id);
                tracing::warn!(metric_id = %metric.id, failure = %failure, value, "no last-known value, using synthetic default");
                (value, ValueSource::SyntheticDefault)
            }
        };

        ExecutionResult {
            metric_id: metric.id.clone(),
            value,
            source,
            error: Some(failure),
            timestamp: Utc::now(),
        }
    }

    async fn persist_live_value(&self, metric_id: &str, value: f64) {
        let store = self.store.clone();
        let id = metric_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || store.set(&id, value)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(metric_id = %metric_id, error = %error, "failed to persist last-known value");
            }
            Err(join_error) => {
                tracing::warn!(metric_id = %metric_id, error = %join_error, "last-known value writer stopped unexpectedly");
            }
        }
    }
}

fn failure_message(metric: &MetricDefinition, outcome: &Normalized, error: Option<&AppError>) -> Option<String> {
    if let Some(error) = error {
        return Some(error.to_string());
    }
    if !outcome.valid {
        let reason = outcome.reason.as_deref().unwrap_or("result could not be normalized");
        return Some(AppError::Normalization(reason.to_string()).to_string());
    }
    if metric.degenerate_is_invalid && outcome.value == 0.0 {
        return Some(AppError::Normalization("zero is treated as a failed fetch for this metric".to_string()).to_string());
    }
    None
}

pub fn synthetic_placeholder(metric_id: &str) -> f64 {
    let hash = metric_id.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (PLACEHOLDER_FLOOR + hash % PLACEHOLDER_SPAN) as f64
}

#[cfg(test)]
mod tests {
    use super::{synthetic_placeholder, FallbackResolver, LastKnownValueStore};
    use crate::errors::{AppError, AppResult};
    use crate::models::{BackendKind, MetricDefinition, RunMode, ValueSource};
    use crate::normalizer::Normalized;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, ThreadId};

    #[derive(Default)]
    struct MemoryStore {
        values: Mutex<HashMap<String, f64>>,
        fail_writes: bool,
    }

    impl LastKnownValueStore for MemoryStore {
        fn get(&self, metric_id: &str) -> AppResult<Option<f64>> {
            Ok(self.values.lock().expect("store lock").get(metric_id).copied())
        }

        fn set(&self, metric_id: &str, value: f64) -> AppResult<()> {
            if self.fail_writes {
                return Err(AppError::Persistence("disk full".to_string()));
            }
            self.values.lock().expect("store lock").insert(metric_id.to_string(), value);
            Ok(())
        }
    }

    #[derive(Default)]
    struct ThreadTrackingStore {
        touched_on: Mutex<Vec<ThreadId>>,
    }

    impl ThreadTrackingStore {
        fn note_thread(&self) {
            self.touched_on.lock().expect("thread log").push(thread::current().id());
        }
    }

    impl LastKnownValueStore for ThreadTrackingStore {
        fn get(&self, _metric_id: &str) -> AppResult<Option<f64>> {
            self.note_thread();
            Ok(Some(7.0))
        }

        fn set(&self, _metric_id: &str, _value: f64) -> AppResult<()> {
            self.note_thread();
            Ok(())
        }

        fn probe(&self) -> AppResult<()> {
            self.note_thread();
            Ok(())
        }
    }

    fn metric(id: &str, degenerate_is_invalid: bool) -> MetricDefinition {
        MetricDefinition {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            backend_kind: BackendKind::Relational,
            query: "SELECT 1".to_string(),
            degenerate_is_invalid,
        }
    }

    #[tokio::test]
    async fn live_value_is_returned_and_persisted() {
        let store = Arc::new(MemoryStore::default());
        let resolver = FallbackResolver::new(store.clone());

        let result = resolver
            .resolve(&metric("revenue", false), &Normalized::valid(12.5), None, RunMode::Live)
            .await;
        assert_eq!(result.source, ValueSource::Live);
        assert_eq!(result.value, 12.5);
        assert!(result.error.is_none());
        assert_eq!(store.get("revenue").expect("get"), Some(12.5));
    }

    #[tokio::test]
    async fn rehearsal_does_not_persist() {
        let store = Arc::new(MemoryStore::default());
        let resolver = FallbackResolver::new(store.clone());

        let result = resolver
            .resolve(&metric("revenue", false), &Normalized::valid(3.0), None, RunMode::Rehearsal)
            .await;
        assert_eq!(result.source, ValueSource::Live);
        assert_eq!(store.get("revenue").expect("get"), None);
    }

    #[tokio::test]
    async fn execution_error_uses_stored_value() {
        let store = Arc::new(MemoryStore::default());
        store.set("revenue", 99.0).expect("seed");
        let resolver = FallbackResolver::new(store);

        let error = AppError::Timeout(10);
        let result = resolver
            .resolve(&metric("revenue", false), &Normalized::invalid("no result"), Some(&error), RunMode::Live)
            .await;
        assert_eq!(result.source, ValueSource::Fallback);
        assert_eq!(result.value, 99.0);
        assert!(result.error.as_deref().is_some_and(|message| message.starts_with("TIMEOUT")));
    }

    #[tokio::test]
    async fn degenerate_zero_without_history_is_synthesized() {
        let resolver = FallbackResolver::new(Arc::new(MemoryStore::default()));

        let result = resolver
            .resolve(&metric("signups", true), &Normalized::valid(0.0), None, RunMode::Live)
            .await;
        assert_eq!(result.source, ValueSource::SyntheticDefault);
        assert_eq!(result.value, synthetic_placeholder("signups"));

        let plain_zero = resolver
            .resolve(&metric("refunds", false), &Normalized::valid(0.0), None, RunMode::Live)
            .await;
        assert_eq!(plain_zero.source, ValueSource::Live);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_change_the_result() {
        let store = Arc::new(MemoryStore {
            fail_writes: true,
            ..Default::default()
        });
        let resolver = FallbackResolver::new(store);

        let result = resolver
            .resolve(&metric("revenue", false), &Normalized::valid(8.0), None, RunMode::Live)
            .await;
        assert_eq!(result.source, ValueSource::Live);
        assert_eq!(result.value, 8.0);
    }

    #[test]
    fn placeholder_is_deterministic_and_bounded() {
        assert_eq!(synthetic_placeholder("a"), synthetic_placeholder("a"));
        for id in ["a", "b", "revenue", "", "metric-with-a-long-identifier"] {
            let value = synthetic_placeholder(id);
            assert!((100.0..1000.0).contains(&value), "{id} -> {value}");
        }
    }

    #[tokio::test]
    async fn store_calls_stay_off_the_async_thread() {
        let store = Arc::new(ThreadTrackingStore::default());
        let resolver = FallbackResolver::new(store.clone());
        let runtime_thread = thread::current().id();

        resolver.probe_store().await.expect("probe");
        let fallback = resolver
            .resolve(
                &metric("revenue", false),
                &Normalized::invalid("no rows"),
                None,
                RunMode::Live,
            )
            .await;
        resolver
            .resolve(&metric("revenue", false), &Normalized::valid(2.0), None, RunMode::Live)
            .await;

        assert_eq!(fallback.source, ValueSource::Fallback);
        let touched = store.touched_on.lock().expect("thread log").clone();
        assert_eq!(touched.len(), 3);
        assert!(touched.iter().all(|thread| *thread != runtime_thread));
    }
}

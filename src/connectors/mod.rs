pub mod file_table;
pub mod relational;

use crate::errors::AppResult;
use crate::models::BackendKind;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub fields: Vec<(String, serde_json::Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.push((name.into(), value));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Rows(Vec<Row>),
    Scalar(serde_json::Value),
}

pub type ConnectorFuture<'a> = Pin<Box<dyn Future<Output = AppResult<RawResult>> + Send + 'a>>;

pub trait Connector: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs one query. Implementations must give up with `AppError::Timeout`
    /// once `timeout_ms` has elapsed.
    fn execute<'a>(&'a self, query: &'a str, timeout_ms: u64) -> ConnectorFuture<'a>;

    fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<BackendKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.kind(), connector);
    }

    pub fn with(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register(connector);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.connectors.contains_key(&kind)
    }

    pub fn close_all(&self) {
        for (kind, connector) in &self.connectors {
            if let Err(error) = connector.close() {
                tracing::warn!(backend = kind.as_str(), error = %error, "failed to close connector");
            }
        }
    }
}

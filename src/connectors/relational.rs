use super::{Connector, ConnectorFuture, RawResult, Row};
use crate::errors::{AppError, AppResult};
use crate::models::BackendKind;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

const DEFAULT_MAX_ROWS: usize = 1_000;
const ABANDON_CHECK_INTERVAL_OPS: i32 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationalSettings {
    pub database_path: PathBuf,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

impl RelationalSettings {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            busy_timeout_ms: None,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationalConnector {
    settings: RelationalSettings,
}

impl RelationalConnector {
    pub fn new(settings: RelationalSettings) -> Self {
        Self { settings }
    }

    async fn run(&self, query: &str, timeout_ms: u64) -> AppResult<RawResult> {
        let settings = self.settings.clone();
        let sql = query.to_string();
        let abandoned = Arc::new(AtomicBool::new(false));
        let worker_abandoned = abandoned.clone();
        let (handle_tx, mut handle_rx) = oneshot::channel::<InterruptHandle>();

        let worker = tokio::task::spawn_blocking(move || {
            execute_on_fresh_connection(&settings, &sql, timeout_ms, handle_tx, worker_abandoned)
        });

        match timeout(Duration::from_millis(timeout_ms), worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::Internal(format!(
                "relational worker stopped unexpectedly: {}",
                join_error
            ))),
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                if let Ok(handle) = handle_rx.try_recv() {
                    handle.interrupt();
                }
                tracing::debug!(timeout_ms, "relational query abandoned after timeout");
                Err(AppError::Timeout(timeout_ms))
            }
        }
    }
}

impl Connector for RelationalConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn execute<'a>(&'a self, query: &'a str, timeout_ms: u64) -> ConnectorFuture<'a> {
        Box::pin(self.run(query, timeout_ms))
    }
}

fn execute_on_fresh_connection(
    settings: &RelationalSettings,
    sql: &str,
    timeout_ms: u64,
    handle_tx: oneshot::Sender<InterruptHandle>,
    abandoned: Arc<AtomicBool>,
) -> AppResult<RawResult> {
    let conn = open_connection(settings, timeout_ms)?;
    watch_abandonment(&conn, abandoned.clone());
    let _ = handle_tx.send(conn.get_interrupt_handle());

    // The caller publishes `abandoned` before it looks for the interrupt handle.
    let outcome = if abandoned.load(Ordering::SeqCst) {
        Err(AppError::Timeout(timeout_ms))
    } else {
        collect_rows(&conn, sql, settings.max_rows, &abandoned, timeout_ms)
    };

    close_connection(conn);
    outcome.map(RawResult::Rows)
}

fn open_connection(settings: &RelationalSettings, timeout_ms: u64) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(&settings.database_path, flags).map_err(|error| {
        AppError::Connection(format!(
            "cannot open {}: {}",
            settings.database_path.display(),
            error
        ))
    })?;

    let busy = settings.busy_timeout_ms.unwrap_or(timeout_ms).min(timeout_ms);
    conn.busy_timeout(Duration::from_millis(busy))
        .map_err(|error| AppError::Connection(error.to_string()))?;
    Ok(conn)
}

// An interrupt sent before the statement starts stepping is lost, so the VM
// also polls the flag itself.
fn watch_abandonment(conn: &Connection, abandoned: Arc<AtomicBool>) {
    conn.progress_handler(
        ABANDON_CHECK_INTERVAL_OPS,
        Some(move || abandoned.load(Ordering::Relaxed)),
    );
}

fn close_connection(conn: Connection) {
    if let Err((_conn, error)) = conn.close() {
        // Dropping the returned handle still releases it.
        tracing::warn!(error = %error, "relational connection did not close cleanly");
    }
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
    abandoned: &AtomicBool,
    timeout_ms: u64,
) -> AppResult<Vec<Row>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|error| classify_query_error(error, timeout_ms))?;
    if !stmt.readonly() {
        return Err(AppError::Query("only read-only statements are accepted".to_string()));
    }

    let names = stmt
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = stmt
        .query([])
        .map_err(|error| classify_query_error(error, timeout_ms))?;
    let mut collected = Vec::new();
    while collected.len() < max_rows {
        if abandoned.load(Ordering::Relaxed) {
            return Err(AppError::Timeout(timeout_ms));
        }
        let Some(row) = rows.next().map_err(|error| classify_query_error(error, timeout_ms))? else {
            break;
        };

        let mut fields = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map_err(|error| classify_query_error(error, timeout_ms))?;
            fields.push((name.clone(), value_to_json(value)));
        }
        collected.push(Row { fields });
    }

    Ok(collected)
}

fn classify_query_error(error: rusqlite::Error, timeout_ms: u64) -> AppError {
    match error.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => AppError::Timeout(timeout_ms),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => AppError::Timeout(timeout_ms),
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => AppError::Connection(error.to_string()),
        _ => AppError::Query(error.to_string()),
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(number) => serde_json::Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).to_string()),
        ValueRef::Blob(_) => serde_json::Value::Null,
    }
}

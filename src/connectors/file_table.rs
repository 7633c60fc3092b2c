use super::{Connector, ConnectorFuture, RawResult};
use crate::errors::{AppError, AppResult};
use crate::models::BackendKind;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::{timeout, Duration};

const IDENT: &str = r#"\[[^\]]+\]|"[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_]*"#;
const LITERAL: &str = r#"'(?:[^']|'')*'|"[^"]*"|-?\d+(?:\.\d+)?|TRUE|FALSE"#;

static TABLE_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r"(?is)^\s*SELECT\s+(?:(?P<count>COUNT\s*\(\s*\*\s*\))|SUM\s*\(\s*(?P<sum>{ident})\s*\))(?:\s+AS\s+(?:{ident}))?\s+FROM\s+(?P<table>{ident})(?:\s+WHERE\s+(?P<column>{ident})\s*=\s*(?P<literal>{literal}))?\s*;?\s*$",
        ident = IDENT,
        literal = LITERAL,
    );
    Regex::new(&pattern).expect("valid table query regex")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTableSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub value: Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableQuery {
    Count { table: String, filter: Option<Predicate> },
    Sum { table: String, column: String, filter: Option<Predicate> },
}

impl TableQuery {
    pub fn parse(query: &str) -> AppResult<Self> {
        let caps = TABLE_QUERY_RE.captures(query).ok_or_else(|| {
            AppError::Query(format!(
                "unsupported file-table query (expected COUNT(*) or SUM(column) with an optional equality filter): {}",
                query.trim()
            ))
        })?;

        let table = unquote_ident(&caps["table"]);
        let filter = match (caps.name("column"), caps.name("literal")) {
            (Some(column), Some(literal)) => Some(Predicate {
                column: unquote_ident(column.as_str()),
                value: parse_literal(literal.as_str())?,
            }),
            _ => None,
        };

        if caps.name("count").is_some() {
            return Ok(Self::Count { table, filter });
        }
        let column = caps
            .name("sum")
            .map(|sum| unquote_ident(sum.as_str()))
            .ok_or_else(|| AppError::Query("aggregate column missing".to_string()))?;
        Ok(Self::Sum { table, column, filter })
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Count { table, .. } | Self::Sum { table, .. } => table,
        }
    }

    fn filter(&self) -> Option<&Predicate> {
        match self {
            Self::Count { filter, .. } | Self::Sum { filter, .. } => filter.as_ref(),
        }
    }

    pub fn evaluate(&self, rows: &[serde_json::Map<String, serde_json::Value>]) -> AppResult<serde_json::Value> {
        if let Some(filter) = self.filter() {
            ensure_column_known(rows, &filter.column)?;
        }
        let matching = rows
            .iter()
            .filter(|row| self.filter().map_or(true, |filter| filter.matches(row)));

        match self {
            Self::Count { .. } => Ok(serde_json::Value::from(matching.count() as u64)),
            Self::Sum { column, .. } => {
                ensure_column_known(rows, column)?;
                let mut total = None::<f64>;
                for row in matching {
                    if let Some(number) = field(row, column).and_then(numeric_cell) {
                        total = Some(total.unwrap_or(0.0) + number);
                    }
                }
                // SUM over no non-null cells is NULL, as in SQL.
                Ok(total
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null))
            }
        }
    }
}

impl Predicate {
    fn matches(&self, row: &serde_json::Map<String, serde_json::Value>) -> bool {
        let Some(cell) = field(row, &self.column) else {
            return false;
        };
        match (&self.value, cell) {
            (_, serde_json::Value::Null) => false,
            (Literal::Text(expected), serde_json::Value::String(actual)) => actual.eq_ignore_ascii_case(expected),
            (Literal::Text(expected), serde_json::Value::Number(actual)) => actual.to_string() == *expected,
            (Literal::Text(expected), serde_json::Value::Bool(actual)) => expected.eq_ignore_ascii_case(&actual.to_string()),
            (Literal::Number(expected), other) => numeric_cell(other).is_some_and(|actual| actual == *expected),
            (Literal::Bool(expected), serde_json::Value::Bool(actual)) => actual == expected,
            (Literal::Bool(expected), serde_json::Value::Number(actual)) => {
                actual.as_f64().is_some_and(|number| (number != 0.0) == *expected)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTableConnector {
    settings: FileTableSettings,
}

impl FileTableConnector {
    pub fn new(settings: FileTableSettings) -> Self {
        Self { settings }
    }

    async fn run(&self, query: &str, timeout_ms: u64) -> AppResult<RawResult> {
        let parsed = TableQuery::parse(query)?;
        let path = self.settings.path.clone();

        let worker = tokio::task::spawn_blocking(move || -> AppResult<serde_json::Value> {
            let rows = load_table(&path, parsed.table())?;
            tracing::debug!(table = parsed.table(), rows = rows.len(), "file table loaded");
            parsed.evaluate(&rows)
        });

        match timeout(Duration::from_millis(timeout_ms), worker).await {
            Ok(Ok(result)) => result.map(RawResult::Scalar),
            Ok(Err(join_error)) => Err(AppError::Internal(format!(
                "file-table worker stopped unexpectedly: {}",
                join_error
            ))),
            Err(_) => Err(AppError::Timeout(timeout_ms)),
        }
    }
}

impl Connector for FileTableConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::FileTable
    }

    fn execute<'a>(&'a self, query: &'a str, timeout_ms: u64) -> ConnectorFuture<'a> {
        Box::pin(self.run(query, timeout_ms))
    }
}

fn load_table(path: &Path, table: &str) -> AppResult<Vec<serde_json::Map<String, serde_json::Value>>> {
    let raw = fs::read_to_string(path)
        .map_err(|error| AppError::Connection(format!("cannot open {}: {}", path.display(), error)))?;
    let document = serde_json::from_str::<serde_json::Value>(&raw)
        .map_err(|error| AppError::Connection(format!("unreadable database file {}: {}", path.display(), error)))?;

    let tables = document
        .get("tables")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| AppError::Connection(format!("{} has no tables section", path.display())))?;

    let (_, rows) = tables
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(table))
        .ok_or_else(|| AppError::Query(format!("unknown table: {}", table)))?;

    let rows = rows
        .as_array()
        .ok_or_else(|| AppError::Connection(format!("table {} is not a list of rows", table)))?;
    rows.iter()
        .map(|row| {
            row.as_object()
                .cloned()
                .ok_or_else(|| AppError::Connection(format!("table {} holds a non-object row", table)))
        })
        .collect()
}

fn ensure_column_known(rows: &[serde_json::Map<String, serde_json::Value>], column: &str) -> AppResult<()> {
    if rows.is_empty() || rows.iter().any(|row| field(row, column).is_some()) {
        return Ok(());
    }
    Err(AppError::Query(format!("unknown column: {}", column)))
}

fn field<'a>(row: &'a serde_json::Map<String, serde_json::Value>, column: &str) -> Option<&'a serde_json::Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

fn numeric_cell(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

fn unquote_ident(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .or_else(|| trimmed.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')))
        .or_else(|| trimmed.strip_prefix('`').and_then(|rest| rest.strip_suffix('`')))
        .unwrap_or(trimmed);
    inner.to_string()
}

fn parse_literal(raw: &str) -> AppResult<Literal> {
    let trimmed = raw.trim();
    if let Some(inner) = trimmed.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Ok(Literal::Text(inner.replace("''", "'")));
    }
    if let Some(inner) = trimmed.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        return Ok(Literal::Text(inner.to_string()));
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Ok(Literal::Bool(true));
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Ok(Literal::Bool(false));
    }
    trimmed
        .parse::<f64>()
        .map(Literal::Number)
        .map_err(|_| AppError::Query(format!("unsupported literal: {}", trimmed)))
}

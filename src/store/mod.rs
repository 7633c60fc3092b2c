use crate::errors::{AppError, AppResult};
use crate::fallback::LastKnownValueStore;
use crate::models::ValuePoint;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug)]
pub struct SqliteValueStore {
    conn: Mutex<Connection>,
}

impl SqliteValueStore {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("value store mutex poisoned".to_string()))
    }

    pub fn last_known_value(&self, metric_id: &str) -> AppResult<Option<f64>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM last_known_values WHERE metric_id = ?1",
                [metric_id],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn record_live_value(&self, metric_id: &str, value: f64) -> AppResult<()> {
        if !value.is_finite() {
            return Err(AppError::Persistence(format!("refusing to store non-finite value for {}", metric_id)));
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO last_known_values (metric_id, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(metric_id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![metric_id, value, now],
        )?;
        tx.execute(
            "INSERT INTO metric_value_history (id, metric_id, value, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), metric_id, value, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_history(&self, metric_id: &str, limit: u32) -> AppResult<Vec<ValuePoint>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT metric_id, value, recorded_at FROM metric_value_history
             WHERE metric_id = ?1 ORDER BY recorded_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![metric_id, limit], parse_value_point_row)?;
        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }

    /// Drops history older than `retention_days`. Last-known values are kept.
    pub fn prune_history(&self, retention_days: u32) -> AppResult<u64> {
        let cutoff = Duration::try_days(i64::from(retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            // Cutoff predates every representable timestamp.
            return Ok(0);
        };
        let cutoff = cutoff.to_rfc3339();
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM metric_value_history WHERE recorded_at < ?1",
            [cutoff],
        )?;
        Ok(deleted as u64)
    }
}

impl LastKnownValueStore for SqliteValueStore {
    fn get(&self, metric_id: &str) -> AppResult<Option<f64>> {
        self.last_known_value(metric_id)
    }

    fn set(&self, metric_id: &str, value: f64) -> AppResult<()> {
        self.record_live_value(metric_id, value)
    }

    fn probe(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(1) FROM last_known_values", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn parse_value_point_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValuePoint> {
    Ok(ValuePoint {
        metric_id: row.get(0)?,
        value: row.get(1)?,
        recorded_at: parse_time(&row.get::<_, String>(2)?)?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::SqliteValueStore;
    use crate::fallback::LastKnownValueStore;
    use rusqlite::params;

    #[test]
    fn stores_and_overwrites_last_known_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteValueStore::new(&dir.path().join("state/values.sqlite")).expect("store");

        assert_eq!(store.get("revenue").expect("get"), None);
        store.set("revenue", 10.0).expect("first set");
        store.set("revenue", 12.5).expect("second set");
        assert_eq!(store.get("revenue").expect("get"), Some(12.5));
        store.probe().expect("probe");
    }

    #[test]
    fn history_keeps_every_live_observation_newest_first() {
        let store = SqliteValueStore::open_in_memory().expect("store");
        store.set("revenue", 1.0).expect("set");
        store.set("revenue", 2.0).expect("set");
        store.set("churn", 9.0).expect("set");

        let history = store.list_history("revenue", 10).expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, 2.0);
        assert_eq!(history[1].value, 1.0);
        assert_eq!(store.list_history("revenue", 1).expect("limited").len(), 1);
    }

    #[test]
    fn rejects_non_finite_values() {
        let store = SqliteValueStore::open_in_memory().expect("store");
        assert!(store.set("revenue", f64::NAN).is_err());
        assert_eq!(store.get("revenue").expect("get"), None);
    }

    #[test]
    fn prune_drops_only_old_history() {
        let store = SqliteValueStore::open_in_memory().expect("store");
        store.set("revenue", 5.0).expect("set");
        {
            let conn = store.lock().expect("lock");
            conn.execute(
                "INSERT INTO metric_value_history (id, metric_id, value, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params!["old", "revenue", 1.0, "2000-01-01T00:00:00+00:00"],
            )
            .expect("insert old point");
        }

        assert_eq!(store.prune_history(30).expect("prune"), 1);
        assert_eq!(store.list_history("revenue", 10).expect("history").len(), 1);
        assert_eq!(store.get("revenue").expect("get"), Some(5.0));
    }

    #[test]
    fn prune_with_unbounded_retention_keeps_everything() {
        let store = SqliteValueStore::open_in_memory().expect("store");
        store.set("revenue", 5.0).expect("set");
        {
            let conn = store.lock().expect("lock");
            conn.execute(
                "INSERT INTO metric_value_history (id, metric_id, value, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params!["old", "revenue", 1.0, "2000-01-01T00:00:00+00:00"],
            )
            .expect("insert old point");
        }

        assert_eq!(store.prune_history(u32::MAX).expect("prune"), 0);
        assert_eq!(store.list_history("revenue", 10).expect("history").len(), 2);
    }
}

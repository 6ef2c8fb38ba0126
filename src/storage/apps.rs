use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::db::{json_or_empty, new_id, parse_text, Database};
use crate::error::Result;
use crate::model::{from_millis, AppState, AppType, ErrorLog};

const APP_STATE_COLUMNS: &str = "id, app_type, instance_id, status, connection_count, last_seen, \
     last_error, metadata, created_at, updated_at";

const ERROR_LOG_COLUMNS: &str =
    "id, app_type, error_type, message, stack_trace, metadata, created_at";

impl Database {
    /// Creates the liveness row for an instance or refreshes it on re-registration.
    pub fn upsert_app_state(
        &self,
        app_type: AppType,
        instance_id: &str,
        metadata: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<AppState> {
        let metadata = serde_json::to_string(metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO app_states (id, app_type, instance_id, status, connection_count,
                 last_seen, last_error, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'online', 0, ?4, NULL, ?5, ?4, ?4)
             ON CONFLICT(instance_id) DO UPDATE SET
                 app_type = excluded.app_type,
                 status = 'online',
                 last_seen = excluded.last_seen,
                 last_error = NULL,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at",
            params![new_id(), app_type.as_str(), instance_id, at.timestamp_millis(), metadata],
        )?;

        let sql = format!("SELECT {APP_STATE_COLUMNS} FROM app_states WHERE instance_id = ?1");
        Ok(conn.query_row(&sql, params![instance_id], app_state_from_row)?)
    }

    pub fn get_app_state(&self, instance_id: &str) -> Result<Option<AppState>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {APP_STATE_COLUMNS} FROM app_states WHERE instance_id = ?1");
        Ok(conn
            .query_row(&sql, params![instance_id], app_state_from_row)
            .optional()?)
    }

    pub fn touch_app_state(
        &self,
        instance_id: &str,
        connection_count: u64,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE app_states SET status = 'online', last_seen = ?2, connection_count = ?3
             WHERE instance_id = ?1",
            params![instance_id, at.timestamp_millis(), connection_count as i64],
        )?)
    }

    pub fn set_app_error(&self, instance_id: &str, error: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE app_states SET status = 'error', last_error = ?2 WHERE instance_id = ?1",
            params![instance_id, error],
        )?)
    }

    pub fn list_app_states(&self) -> Result<Vec<AppState>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {APP_STATE_COLUMNS} FROM app_states ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], app_state_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_apps_seen_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AppState>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {APP_STATE_COLUMNS} FROM app_states WHERE last_seen < ?1 ORDER BY last_seen ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff.timestamp_millis()], app_state_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_error_log(&self, entry: &ErrorLog) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO error_logs (id, app_type, error_type, message, stack_trace, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.app_type.map(|t| t.as_str()),
                entry.error_type,
                entry.message,
                entry.stack_trace,
                metadata,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_error_logs(&self, limit: usize) -> Result<Vec<ErrorLog>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {ERROR_LOG_COLUMNS} FROM error_logs ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], error_log_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_errors_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM error_logs WHERE created_at >= ?1",
            params![since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn delete_error_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM error_logs WHERE created_at < ?1",
            params![cutoff.timestamp_millis()],
        )?)
    }
}

fn app_state_from_row(row: &Row<'_>) -> rusqlite::Result<AppState> {
    let app_type: String = row.get(1)?;
    let connection_count: i64 = row.get(4)?;
    Ok(AppState {
        id: row.get(0)?,
        app_type: parse_text(1, &app_type)?,
        instance_id: row.get(2)?,
        status: row.get(3)?,
        connection_count: connection_count.max(0) as u32,
        last_seen: from_millis(row.get(5)?),
        last_error: row.get(6)?,
        metadata: json_or_empty(row.get(7)?),
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
    })
}

fn error_log_from_row(row: &Row<'_>) -> rusqlite::Result<ErrorLog> {
    let app_type: Option<String> = row.get(1)?;
    Ok(ErrorLog {
        id: row.get(0)?,
        app_type: app_type.map(|raw| parse_text(1, &raw)).transpose()?,
        error_type: row.get(2)?,
        message: row.get(3)?,
        stack_trace: row.get(4)?,
        metadata: json_or_empty(row.get(5)?),
        created_at: from_millis(row.get(6)?),
    })
}

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::migrations;
use crate::error::{RelayError, Result};
use crate::model::{from_millis, now_millis, opt_from_millis, Connection, ConnectionStatus, SyncStatus};

pub const DB_FILE: &str = "relay.db";

const CONNECTION_COLUMNS: &str = "id, source_ref, target_ref, original_source_ref, active, sync_enabled, \
     status, retry_count, last_error, last_sync_time, created_at, metadata";

const SYNC_STATUS_COLUMNS: &str =
    "id, connection_id, status, retry_count, last_error, last_sync_time, created_at, updated_at";

/// Single-connection SQLite store. All writers serialize through the mutex;
/// WAL mode lets external readers proceed during a write.
pub struct Database {
    pub conn: Arc<Mutex<SqliteConnection>>,
}

impl Database {
    /// Open (or create) the store inside a relay directory.
    pub fn new(relay_path: &Path) -> Result<Self> {
        Self::open(relay_path.join(DB_FILE))
    }

    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = SqliteConnection::open(db_path)?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory()?;
        Self::configure(conn)
    }

    fn configure(conn: SqliteConnection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // In-memory stores answer "memory" here; only file stores switch to WAL.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bring the schema up to date. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        migrations::apply_migrations(&mut conn, migrations::MIGRATIONS)?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        migrations::current_version(&conn)
    }

    pub fn create_schema_if_absent(&self) -> Result<()> {
        let conn = self.conn.lock();
        create_schema_if_absent(&conn)?;
        Ok(())
    }

    // ---- connections -------------------------------------------------------

    pub fn insert_connection(&self, connection: &Connection) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connections (id, source_ref, target_ref, original_source_ref, active,
                 sync_enabled, status, retry_count, last_error, last_sync_time, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                connection.id,
                connection.source_ref,
                connection.target_ref,
                connection.original_source_ref,
                connection.active,
                connection.sync_enabled,
                connection.status.as_str(),
                connection.retry_count,
                connection.last_error,
                connection.last_sync_time.map(|t| t.timestamp_millis()),
                connection.created_at.timestamp_millis(),
                serde_json::to_string(&connection.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id], connection_from_row)
            .optional()?)
    }

    /// Look up a pairing by its stable identity, preferring a live row over a
    /// soft-deleted one.
    pub fn find_connection_by_identity(
        &self,
        original_source_ref: &str,
        target_ref: &str,
    ) -> Result<Option<Connection>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections
             WHERE original_source_ref = ?1 AND target_ref = ?2
             ORDER BY (status = 'deleted') ASC, created_at DESC
             LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![original_source_ref, target_ref], connection_from_row)
            .optional()?)
    }

    pub fn reactivate_connection(&self, id: &str, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE connections SET active = 1, status = 'active', last_sync_time = ?2 WHERE id = ?1",
            params![id, at.timestamp_millis()],
        )?)
    }

    pub fn set_connection_source_ref(&self, id: &str, source_ref: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE connections SET source_ref = ?2 WHERE id = ?1",
            params![id, source_ref],
        )?)
    }

    /// Sets status and last error; `retry_count` grows on `error` and resets otherwise.
    pub fn set_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE connections
             SET status = ?2,
                 last_error = ?3,
                 retry_count = CASE WHEN ?2 = 'error' THEN retry_count + 1 ELSE 0 END
             WHERE id = ?1",
            params![id, status.as_str(), error],
        )?)
    }

    pub fn set_connection_flags(
        &self,
        id: &str,
        active: Option<bool>,
        sync_enabled: Option<bool>,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE connections
             SET active = COALESCE(?2, active),
                 sync_enabled = COALESCE(?3, sync_enabled)
             WHERE id = ?1",
            params![id, active, sync_enabled],
        )?)
    }

    pub fn soft_delete_connection(&self, id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE connections SET active = 0, status = 'deleted' WHERE id = ?1",
            params![id],
        )?)
    }

    pub fn touch_connection_sync(&self, id: &str, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE connections SET last_sync_time = ?2 WHERE id = ?1",
            params![id, at.timestamp_millis()],
        )?)
    }

    pub fn list_connections(&self, active_only: bool) -> Result<Vec<Connection>> {
        let conn = self.conn.lock();
        let filter = if active_only {
            "WHERE active = 1 AND status != 'deleted'"
        } else {
            ""
        };
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections {filter} ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], connection_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active connections that have not synced since `cutoff`.
    pub fn list_connections_synced_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Connection>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections
             WHERE active = 1 AND status != 'deleted'
               AND (last_sync_time IS NULL OR last_sync_time < ?1)
             ORDER BY last_sync_time ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff.timestamp_millis()], connection_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_active_connections(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connections WHERE active = 1 AND status != 'deleted'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ---- sync status -------------------------------------------------------

    pub fn insert_sync_status(&self, status: &SyncStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_status (id, connection_id, status, retry_count, last_error,
                 last_sync_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                status.id,
                status.connection_id,
                status.status,
                status.retry_count,
                status.last_error,
                status.last_sync_time.map(|t| t.timestamp_millis()),
                status.created_at.timestamp_millis(),
                status.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn list_sync_status(&self, connection_id: &str) -> Result<Vec<SyncStatus>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SYNC_STATUS_COLUMNS} FROM sync_status
             WHERE connection_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![connection_id], sync_status_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Mean `last_sync_time - created_at` over sync rows created since `since`.
    pub fn mean_sync_latency_ms(&self, since: DateTime<Utc>) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT AVG(last_sync_time - created_at) FROM sync_status
             WHERE created_at >= ?1 AND last_sync_time IS NOT NULL",
            params![since.timestamp_millis()],
            |row| row.get(0),
        )?)
    }

    pub fn delete_sync_status_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM sync_status WHERE created_at < ?1",
            params![cutoff.timestamp_millis()],
        )?)
    }
}

/// Baseline tables in their current shape. Indexes and triggers are created by
/// later migrations so that upgrading an older store never references a
/// column that does not exist yet.
pub(crate) fn create_schema_if_absent(conn: &SqliteConnection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            source_ref TEXT NOT NULL,
            target_ref TEXT NOT NULL,
            original_source_ref TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            sync_enabled INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'error', 'deleted')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_sync_time INTEGER,
            created_at INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS updates (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL CHECK (type IN ('selection', 'value', 'connection')),
            source_type TEXT NOT NULL,
            target_type TEXT NOT NULL,
            content TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            processed_at INTEGER,
            acknowledged INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_states (
            id TEXT PRIMARY KEY,
            app_type TEXT NOT NULL,
            instance_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'online',
            connection_count INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER NOT NULL,
            last_error TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS error_logs (
            id TEXT PRIMARY KEY,
            app_type TEXT,
            error_type TEXT NOT NULL,
            message TEXT NOT NULL,
            stack_trace TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_status (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL REFERENCES connections(id),
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_sync_time INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    )
}

pub(crate) fn parse_text<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = RelayError>,
{
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub(crate) fn json_or_empty(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<Connection> {
    let status: String = row.get(6)?;
    let retry_count: i64 = row.get(7)?;
    Ok(Connection {
        id: row.get(0)?,
        source_ref: row.get(1)?,
        target_ref: row.get(2)?,
        original_source_ref: row.get(3)?,
        active: row.get(4)?,
        sync_enabled: row.get(5)?,
        status: parse_text(6, &status)?,
        retry_count: retry_count.max(0) as u32,
        last_error: row.get(8)?,
        last_sync_time: opt_from_millis(row.get(9)?),
        created_at: from_millis(row.get(10)?),
        metadata: json_or_empty(row.get(11)?),
    })
}

fn sync_status_from_row(row: &Row<'_>) -> rusqlite::Result<SyncStatus> {
    let retry_count: i64 = row.get(3)?;
    Ok(SyncStatus {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        status: row.get(2)?,
        retry_count: retry_count.max(0) as u32,
        last_error: row.get(4)?,
        last_sync_time: opt_from_millis(row.get(5)?),
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn now() -> DateTime<Utc> {
    from_millis(now_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn connection_roundtrips_through_store() {
        let db = db();
        let connection = Connection::new("Sheet1!A1", "element-1");
        db.insert_connection(&connection).unwrap();

        let loaded = db.get_connection(&connection.id).unwrap().unwrap();
        assert_eq!(loaded.source_ref, "Sheet1!A1");
        assert_eq!(loaded.original_source_ref, "Sheet1!A1");
        assert_eq!(loaded.status, ConnectionStatus::Active);
        assert!(loaded.active && loaded.sync_enabled);
        assert!(db.get_connection("missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_live_pairing_is_a_constraint_violation() {
        let db = db();
        db.insert_connection(&Connection::new("A1", "el")).unwrap();
        let err = db.insert_connection(&Connection::new("A1", "el")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[test]
    fn deleted_pairing_does_not_block_a_new_row() {
        let db = db();
        let first = Connection::new("A1", "el");
        db.insert_connection(&first).unwrap();
        db.soft_delete_connection(&first.id).unwrap();
        db.insert_connection(&Connection::new("A1", "el")).unwrap();

        let found = db.find_connection_by_identity("A1", "el").unwrap().unwrap();
        assert_ne!(found.id, first.id);
        assert!(!found.is_deleted());
    }

    #[test]
    fn sync_status_requires_known_connection() {
        let db = db();
        let status = SyncStatus {
            id: new_id(),
            connection_id: "nope".into(),
            status: "synced".into(),
            retry_count: 0,
            last_error: None,
            last_sync_time: None,
            created_at: now(),
            updated_at: now(),
        };
        let err = db.insert_sync_status(&status).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }
}

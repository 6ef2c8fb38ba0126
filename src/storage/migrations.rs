//! Versioned schema migrations
//!
//! The schema version lives in `PRAGMA user_version`, which is readable before
//! any table exists. Each migration runs in its own transaction. A migration
//! that detects its change is already present returns
//! [`MigrationError::AlreadyApplied`]; the engine rolls back its (empty)
//! transaction, records the version and moves on. Any other failure rolls back
//! and aborts with the stored version untouched.

use rusqlite::{Connection, Transaction};
use thiserror::Error;

use super::db::create_schema_if_absent;
use crate::error::{RelayError, Result};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("already applied: {0}")]
    AlreadyApplied(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type UpgradeFn = fn(&Transaction<'_>) -> std::result::Result<(), MigrationError>;

#[derive(Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub upgrade: UpgradeFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "baseline tables",
        upgrade: baseline,
    },
    Migration {
        version: 2,
        description: "updates.acknowledged",
        upgrade: add_update_acknowledged,
    },
    Migration {
        version: 3,
        description: "updates.error_count and updates.last_error",
        upgrade: add_update_error_tracking,
    },
    Migration {
        version: 4,
        description: "connections.original_source_ref",
        upgrade: add_original_source_ref,
    },
    Migration {
        version: 5,
        description: "connections.sync_enabled and connections.metadata",
        upgrade: add_connection_flags,
    },
    Migration {
        version: 6,
        description: "indexes and updated_at triggers",
        upgrade: indexes_and_triggers,
    },
];

pub fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Apply every migration newer than the stored version, in order.
/// Returns the resulting schema version.
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<i64> {
    let mut current = current_version(conn)?;

    let mut pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        let tx = conn.transaction()?;
        match (migration.upgrade)(&tx) {
            Ok(()) => {
                tx.pragma_update(None, "user_version", migration.version)?;
                tx.commit()?;
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applied migration"
                );
            }
            Err(MigrationError::AlreadyApplied(reason)) => {
                tx.rollback()?;
                conn.pragma_update(None, "user_version", migration.version)?;
                tracing::debug!(
                    version = migration.version,
                    %reason,
                    "migration already applied, skipping"
                );
            }
            Err(MigrationError::Sqlite(err)) => {
                tx.rollback()?;
                tracing::error!(
                    version = migration.version,
                    description = migration.description,
                    error = %err,
                    "migration failed"
                );
                return Err(RelayError::fatal(format!(
                    "migration {} ({}) failed: {}",
                    migration.version, migration.description, err
                )));
            }
        }
        current = migration.version;
    }

    Ok(current)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Adds each missing column; reports `AlreadyApplied` only when all exist.
fn add_columns(
    tx: &Transaction<'_>,
    table: &str,
    columns: &[(&str, &str)],
) -> std::result::Result<(), MigrationError> {
    let mut added = 0;
    for (column, definition) in columns {
        if !column_exists(tx, table, column)? {
            tx.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {column} {definition};"
            ))?;
            added += 1;
        }
    }

    if added == 0 {
        let names: Vec<&str> = columns.iter().map(|(c, _)| *c).collect();
        return Err(MigrationError::AlreadyApplied(format!(
            "{table} already has {}",
            names.join(", ")
        )));
    }
    Ok(())
}

fn baseline(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
    create_schema_if_absent(tx)?;
    Ok(())
}

fn add_update_acknowledged(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
    add_columns(tx, "updates", &[("acknowledged", "INTEGER NOT NULL DEFAULT 0")])
}

fn add_update_error_tracking(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
    add_columns(
        tx,
        "updates",
        &[
            ("error_count", "INTEGER NOT NULL DEFAULT 0"),
            ("last_error", "TEXT"),
        ],
    )
}

fn add_original_source_ref(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
    add_columns(
        tx,
        "connections",
        &[("original_source_ref", "TEXT NOT NULL DEFAULT ''")],
    )?;
    tx.execute(
        "UPDATE connections SET original_source_ref = source_ref WHERE original_source_ref = ''",
        [],
    )?;
    Ok(())
}

fn add_connection_flags(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
    add_columns(
        tx,
        "connections",
        &[
            ("sync_enabled", "INTEGER NOT NULL DEFAULT 1"),
            ("metadata", "TEXT NOT NULL DEFAULT '{}'"),
        ],
    )
}

fn indexes_and_triggers(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_identity
             ON connections(original_source_ref, target_ref)
             WHERE status != 'deleted';

         CREATE INDEX IF NOT EXISTS idx_connections_active_sync
             ON connections(active, last_sync_time);

         CREATE INDEX IF NOT EXISTS idx_updates_pending
             ON updates(target_type, processed, priority DESC, created_at ASC);

         CREATE INDEX IF NOT EXISTS idx_updates_processed_at
             ON updates(processed, processed_at);

         CREATE INDEX IF NOT EXISTS idx_sync_status_connection
             ON sync_status(connection_id, created_at);

         CREATE INDEX IF NOT EXISTS idx_error_logs_created
             ON error_logs(created_at);

         CREATE TRIGGER IF NOT EXISTS trg_app_states_updated_at
         AFTER UPDATE ON app_states
         FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
         BEGIN
             UPDATE app_states
             SET updated_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)
             WHERE id = NEW.id;
         END;

         CREATE TRIGGER IF NOT EXISTS trg_sync_status_updated_at
         AFTER UPDATE ON sync_status
         FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
         BEGIN
             UPDATE sync_status
             SET updated_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)
             WHERE id = NEW.id;
         END;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE connections (
                id TEXT PRIMARY KEY,
                source_ref TEXT NOT NULL,
                target_ref TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_sync_time INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE updates (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                source_type TEXT NOT NULL,
                target_type TEXT NOT NULL,
                content TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER,
                created_at INTEGER NOT NULL
            );
            INSERT INTO connections (id, source_ref, target_ref, created_at)
                VALUES ('c1', 'Sheet1!B2', 'shape-9', 0);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn fresh_store_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);

        let version = apply_migrations(&mut conn, MIGRATIONS).unwrap();
        assert_eq!(version, 6);
        assert_eq!(current_version(&conn).unwrap(), 6);
        assert!(column_exists(&conn, "updates", "acknowledged").unwrap());
    }

    #[test]
    fn migrations_are_rerunnable() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        let version = apply_migrations(&mut conn, MIGRATIONS).unwrap();
        assert_eq!(version, 6);
    }

    #[test]
    fn legacy_store_is_upgraded_and_backfilled() {
        let mut conn = legacy_store();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();

        for (table, column) in [
            ("updates", "acknowledged"),
            ("updates", "error_count"),
            ("updates", "last_error"),
            ("connections", "original_source_ref"),
            ("connections", "sync_enabled"),
            ("connections", "metadata"),
        ] {
            assert!(column_exists(&conn, table, column).unwrap(), "{table}.{column}");
        }

        let original: String = conn
            .query_row(
                "SELECT original_source_ref FROM connections WHERE id = 'c1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(original, "Sheet1!B2");
    }

    #[test]
    fn failed_migration_leaves_version_unchanged() {
        fn broken(tx: &Transaction<'_>) -> std::result::Result<(), MigrationError> {
            tx.execute_batch("CREATE TABLE half_done (id TEXT); SELECT * FROM no_such_table;")?;
            Ok(())
        }

        let mut conn = Connection::open_in_memory().unwrap();
        let mut migrations = MIGRATIONS.to_vec();
        migrations.push(Migration {
            version: 7,
            description: "broken",
            upgrade: broken,
        });

        let err = apply_migrations(&mut conn, &migrations).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
        assert_eq!(current_version(&conn).unwrap(), 6);
        assert!(!column_exists(&conn, "half_done", "id").unwrap());
    }
}

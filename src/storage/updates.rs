use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::db::{parse_text, Database};
use crate::error::Result;
use crate::model::{from_millis, opt_from_millis, AppType, Update};

const UPDATE_COLUMNS: &str = "id, type, source_type, target_type, content, priority, processed, \
     processed_at, acknowledged, error_count, last_error, created_at";

/// An update row as read from the store. `decode_error` is set when the stored
/// content is not valid JSON; `update.content` is then `Null`.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub update: Update,
    pub decode_error: Option<String>,
}

impl Database {
    pub fn insert_update(&self, update: &Update) -> Result<()> {
        let content = serde_json::to_string(&update.content)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO updates (id, type, source_type, target_type, content, priority, processed,
                 processed_at, acknowledged, error_count, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                update.id,
                update.update_type.as_str(),
                update.source_type.as_str(),
                update.target_type.as_str(),
                content,
                update.priority,
                update.processed,
                update.processed_at.map(|t| t.timestamp_millis()),
                update.acknowledged,
                update.error_count,
                update.last_error,
                update.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn get_update(&self, id: &str) -> Result<Option<UpdateRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {UPDATE_COLUMNS} FROM updates WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], update_from_row).optional()?)
    }

    /// Unprocessed rows for an audience: priority descending, then oldest first.
    pub fn pending_updates(&self, target: AppType, limit: usize) -> Result<Vec<UpdateRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {UPDATE_COLUMNS} FROM updates
             WHERE target_type = ?1 AND processed = 0
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![target.as_str(), limit as i64], update_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn unacknowledged_updates(&self, target: AppType) -> Result<Vec<UpdateRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {UPDATE_COLUMNS} FROM updates
             WHERE target_type = ?1 AND processed = 1 AND acknowledged = 0
             ORDER BY processed_at ASC, created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![target.as_str()], update_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Marks unprocessed rows as processed. Unknown or already processed ids
    /// are skipped; returns the number of rows changed.
    pub fn mark_updates_processed(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE updates SET processed = 1, processed_at = ?2
                 WHERE id = ?1 AND processed = 0",
            )?;
            for id in ids {
                changed += stmt.execute(params![id, at.timestamp_millis()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Sets `acknowledged`, processing the row first if the relay has not yet.
    pub fn acknowledge_updates(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE updates
                 SET acknowledged = 1,
                     processed = 1,
                     processed_at = COALESCE(processed_at, ?2)
                 WHERE id = ?1 AND acknowledged = 0",
            )?;
            for id in ids {
                changed += stmt.execute(params![id, at.timestamp_millis()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Counts a delivery failure against an unprocessed row.
    pub fn record_update_failure(&self, id: &str, error: &str) -> Result<u32> {
        let conn = self.conn.lock();
        let count: Option<i64> = conn
            .query_row(
                "UPDATE updates SET error_count = error_count + 1, last_error = ?2
                 WHERE id = ?1 AND processed = 0
                 RETURNING error_count",
                params![id, error],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    /// Retires an undeliverable row so it no longer blocks its audience.
    pub fn dead_letter_update(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE updates SET processed = 1, processed_at = ?3, last_error = ?2
             WHERE id = ?1 AND processed = 0",
            params![id, error, at.timestamp_millis()],
        )?)
    }

    pub fn count_pending_updates(&self, target: Option<AppType>) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = match target {
            Some(target) => conn.query_row(
                "SELECT COUNT(*) FROM updates WHERE processed = 0 AND target_type = ?1",
                params![target.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM updates WHERE processed = 0",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    pub fn delete_processed_updates_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM updates WHERE processed = 1 AND processed_at < ?1",
            params![cutoff.timestamp_millis()],
        )?)
    }
}

fn update_from_row(row: &Row<'_>) -> rusqlite::Result<UpdateRecord> {
    let update_type: String = row.get(1)?;
    let source_type: String = row.get(2)?;
    let target_type: String = row.get(3)?;
    let raw_content: String = row.get(4)?;
    let error_count: i64 = row.get(9)?;

    let (content, decode_error) = match serde_json::from_str(&raw_content) {
        Ok(value) => (value, None),
        Err(err) => (serde_json::Value::Null, Some(err.to_string())),
    };

    Ok(UpdateRecord {
        update: Update {
            id: row.get(0)?,
            update_type: parse_text(1, &update_type)?,
            source_type: parse_text(2, &source_type)?,
            target_type: parse_text(3, &target_type)?,
            content,
            priority: row.get(5)?,
            processed: row.get(6)?,
            processed_at: opt_from_millis(row.get(7)?),
            acknowledged: row.get(8)?,
            error_count: error_count.max(0) as u32,
            last_error: row.get(10)?,
            created_at: from_millis(row.get(11)?),
        },
        decode_error,
    })
}

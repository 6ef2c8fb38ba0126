//! Connection registry
//!
//! Pairings are keyed by (`original_source_ref`, `target_ref`). Creation is
//! idempotent so an unreliable client can retry it freely; deletion is soft.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::error::{ErrorKind, RelayError, Result};
use crate::model::{Connection, ConnectionStatus, SyncStatus};
use crate::storage::db::{new_id, now};
use crate::storage::Database;

/// How [`ConnectionRegistry::pair`] resolved a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    Created,
    Reactivated,
    /// Already live; nothing was written
    Existing,
}

impl Pairing {
    pub fn changed(self) -> bool {
        self != Pairing::Existing
    }
}

pub struct ConnectionRegistry {
    db: Arc<Database>,
}

impl ConnectionRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Return the live pairing for (`source_ref`, `target_ref`), reactivating a
    /// retired one or inserting a new row when none exists.
    pub fn create_or_reactivate(&self, source_ref: &str, target_ref: &str) -> Result<Connection> {
        self.pair(source_ref, target_ref).map(|(connection, _)| connection)
    }

    /// [`create_or_reactivate`](Self::create_or_reactivate), also saying
    /// whether the call changed anything.
    pub fn pair(&self, source_ref: &str, target_ref: &str) -> Result<(Connection, Pairing)> {
        let source_ref = source_ref.trim();
        let target_ref = target_ref.trim();
        if source_ref.is_empty() || target_ref.is_empty() {
            return Err(RelayError::validation(
                "both a source locator and a target locator are required",
            ));
        }

        if let Some(existing) = self.db.find_connection_by_identity(source_ref, target_ref)? {
            if existing.is_live() {
                return Ok((existing, Pairing::Existing));
            }
            self.db.reactivate_connection(&existing.id, now())?;
            tracing::info!(connection = %existing.id, source_ref, target_ref, "reactivated connection");
            return Ok((self.get(&existing.id)?, Pairing::Reactivated));
        }

        let connection = Connection::new(source_ref, target_ref);
        match self.db.insert_connection(&connection) {
            Ok(()) => {
                tracing::info!(connection = %connection.id, source_ref, target_ref, "created connection");
                Ok((connection, Pairing::Created))
            }
            // Lost a race with a concurrent create: the winner's row is the answer.
            Err(err) if err.kind() == ErrorKind::ConstraintViolation => self
                .db
                .find_connection_by_identity(source_ref, target_ref)?
                .map(|winner| (winner, Pairing::Existing))
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    pub fn get(&self, id: &str) -> Result<Connection> {
        self.db
            .get_connection(id)?
            .ok_or_else(|| RelayError::not_found("connection", id))
    }

    /// Move the source side of a pairing. `original_source_ref` is untouched.
    pub fn relocate(&self, id: &str, new_source_ref: &str) -> Result<Connection> {
        let new_source_ref = new_source_ref.trim();
        if new_source_ref.is_empty() {
            return Err(RelayError::validation("source locator must not be empty"));
        }
        self.expect_changed(id, self.db.set_connection_source_ref(id, new_source_ref)?)?;
        tracing::debug!(connection = %id, new_source_ref, "relocated connection");
        self.get(id)
    }

    pub fn update_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<Connection> {
        self.expect_changed(id, self.db.set_connection_status(id, status, error)?)?;
        if status == ConnectionStatus::Error {
            tracing::warn!(connection = %id, error = error.unwrap_or(""), "connection entered error state");
        }
        self.get(id)
    }

    /// Toggle `active` and `sync_enabled`. Turning a retired pairing back on
    /// goes through reactivation, so the row leaves the `deleted` status too.
    pub fn set_flags(
        &self,
        id: &str,
        active: Option<bool>,
        sync_enabled: Option<bool>,
    ) -> Result<Connection> {
        let current = self.get(id)?;
        let mut active = active;
        if active == Some(true) && !current.is_live() {
            self.expect_changed(id, self.db.reactivate_connection(id, now())?)?;
            tracing::info!(connection = %id, "reactivated connection");
            active = None;
        }
        if active.is_some() || sync_enabled.is_some() {
            self.expect_changed(id, self.db.set_connection_flags(id, active, sync_enabled)?)?;
        }
        self.get(id)
    }

    pub fn soft_delete(&self, id: &str) -> Result<()> {
        self.expect_changed(id, self.db.soft_delete_connection(id)?)?;
        tracing::info!(connection = %id, "retired connection");
        Ok(())
    }

    /// Refresh `last_sync_time` after a successful relay through this pairing.
    pub fn touch_sync(&self, id: &str) -> Result<()> {
        self.expect_changed(id, self.db.touch_connection_sync(id, now())?)
    }

    pub fn list_active(&self) -> Result<Vec<Connection>> {
        self.db.list_connections(true)
    }

    pub fn list_all(&self) -> Result<Vec<Connection>> {
        self.db.list_connections(false)
    }

    /// Active connections whose last sync is older than `threshold_minutes`.
    pub fn list_stale(&self, threshold_minutes: i64) -> Result<Vec<Connection>> {
        self.list_stale_at(threshold_minutes, Utc::now())
    }

    pub fn list_stale_at(&self, threshold_minutes: i64, at: DateTime<Utc>) -> Result<Vec<Connection>> {
        let cutoff = at - Duration::minutes(threshold_minutes.max(0));
        self.db.list_connections_synced_before(cutoff)
    }

    /// Append an audit row for a sync attempt. `started_at` is when the change
    /// originated; the gap to now is the sync latency.
    pub fn record_sync_status(
        &self,
        connection_id: &str,
        status: &str,
        error: Option<&str>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<SyncStatus> {
        let connection = self.get(connection_id)?;
        let completed = now();
        let row = SyncStatus {
            id: new_id(),
            connection_id: connection.id,
            status: status.to_string(),
            retry_count: connection.retry_count,
            last_error: error.map(str::to_string),
            last_sync_time: Some(completed),
            created_at: started_at.filter(|t| *t <= completed).unwrap_or(completed),
            updated_at: completed,
        };
        self.db.insert_sync_status(&row)?;
        Ok(row)
    }

    pub fn sync_history(&self, connection_id: &str) -> Result<Vec<SyncStatus>> {
        self.db.list_sync_status(connection_id)
    }

    fn expect_changed(&self, id: &str, changed: usize) -> Result<()> {
        if changed == 0 {
            return Err(RelayError::not_found("connection", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<Database>, ConnectionRegistry) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        (db.clone(), ConnectionRegistry::new(db))
    }

    #[test]
    fn create_is_idempotent() {
        let (db, registry) = registry();
        let first = registry.create_or_reactivate("Sheet1!A1", "element-7").unwrap();
        let second = registry.create_or_reactivate("Sheet1!A1", "element-7").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.list_connections(true).unwrap().len(), 1);
    }

    #[test]
    fn missing_locator_is_rejected() {
        let (_, registry) = registry();
        let err = registry.create_or_reactivate("  ", "element-7").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn recreate_after_delete_reactivates_same_row() {
        let (db, registry) = registry();
        let created = registry.create_or_reactivate("A1", "el").unwrap();
        registry.soft_delete(&created.id).unwrap();
        assert!(registry.list_active().unwrap().is_empty());

        let again = registry.create_or_reactivate("A1", "el").unwrap();
        assert_eq!(again.id, created.id);
        assert!(again.active);
        assert_eq!(again.status, ConnectionStatus::Active);
        assert_eq!(db.list_connections(false).unwrap().len(), 1);
    }

    #[test]
    fn pairing_reports_what_changed() {
        let (_, registry) = registry();
        let (created, pairing) = registry.pair("A1", "el").unwrap();
        assert_eq!(pairing, Pairing::Created);
        assert_eq!(registry.pair("A1", "el").unwrap().1, Pairing::Existing);

        registry.soft_delete(&created.id).unwrap();
        let (again, pairing) = registry.pair("A1", "el").unwrap();
        assert_eq!(pairing, Pairing::Reactivated);
        assert_eq!(again.id, created.id);
    }

    #[test]
    fn switching_a_retired_pairing_on_reactivates_it() {
        let (_, registry) = registry();
        let created = registry.create_or_reactivate("A1", "el").unwrap();
        registry.soft_delete(&created.id).unwrap();

        let revived = registry.set_flags(&created.id, Some(true), None).unwrap();
        assert!(revived.active);
        assert_eq!(revived.status, ConnectionStatus::Active);
        assert!(revived.last_sync_time.is_some());
        assert_eq!(registry.list_active().unwrap().len(), 1);

        let paused = registry.set_flags(&created.id, Some(false), Some(false)).unwrap();
        assert!(!paused.active);
        assert!(!paused.sync_enabled);
        assert_eq!(paused.status, ConnectionStatus::Active);
    }

    #[test]
    fn relocation_keeps_identity() {
        let (_, registry) = registry();
        let created = registry.create_or_reactivate("A1", "el").unwrap();
        let moved = registry.relocate(&created.id, "B7").unwrap();

        assert_eq!(moved.source_ref, "B7");
        assert_eq!(moved.original_source_ref, "A1");

        // The original locator still identifies the pairing.
        let again = registry.create_or_reactivate("A1", "el").unwrap();
        assert_eq!(again.id, created.id);
    }

    #[test]
    fn status_updates_drive_retry_count() {
        let (_, registry) = registry();
        let created = registry.create_or_reactivate("A1", "el").unwrap();

        registry
            .update_status(&created.id, ConnectionStatus::Error, Some("timeout"))
            .unwrap();
        let failed = registry
            .update_status(&created.id, ConnectionStatus::Error, Some("timeout"))
            .unwrap();
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        let healed = registry
            .update_status(&created.id, ConnectionStatus::Active, None)
            .unwrap();
        assert_eq!(healed.retry_count, 0);
        assert!(healed.last_error.is_none());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_, registry) = registry();
        assert_eq!(
            registry.soft_delete("nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            registry.relocate("nope", "A1").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn stale_connections_are_listed() {
        let (db, registry) = registry();
        let old = registry.create_or_reactivate("A1", "el-1").unwrap();
        let fresh = registry.create_or_reactivate("A2", "el-2").unwrap();
        db.touch_connection_sync(&old.id, Utc::now() - Duration::minutes(90))
            .unwrap();

        let stale = registry.list_stale(30).unwrap();
        let ids: Vec<_> = stale.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![old.id.as_str()]);
        assert!(!ids.contains(&fresh.id.as_str()));
    }

    #[test]
    fn sync_history_is_append_only() {
        let (_, registry) = registry();
        let created = registry.create_or_reactivate("A1", "el").unwrap();
        registry
            .record_sync_status(&created.id, "synced", None, None)
            .unwrap();
        registry
            .record_sync_status(&created.id, "failed", Some("offline"), None)
            .unwrap();

        let history = registry.sync_history(&created.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].last_error.as_deref(), Some("offline"));
    }
}

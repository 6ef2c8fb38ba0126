//! Relay façade
//!
//! One method per external operation. The HTTP adapter and the in-process
//! transport both go through here so they cannot drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::config::{HealthConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::model::{
    AppState, AppType, Connection, ConnectionStatus, ErrorLog, NewErrorLog, Update, UpdateType,
};
use crate::presence::Presence;
use crate::queue::{UpdateQueue, DEFAULT_BATCH_SIZE};
use crate::registry::ConnectionRegistry;
use crate::storage::Database;

/// What a freshly registered client needs to catch up.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub connections: Vec<Connection>,
    /// Pending updates for the registering audience. Not marked processed;
    /// the next poll or an acknowledgement consumes them.
    pub updates: Vec<Update>,
}

/// Partial update of a connection. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub active: Option<bool>,
    pub sync_enabled: Option<bool>,
    pub source_ref: Option<String>,
}

pub struct Relay {
    db: Arc<Database>,
    registry: ConnectionRegistry,
    queue: UpdateQueue,
    presence: Presence,
    health: Arc<HealthMonitor>,
}

impl Relay {
    pub fn new(db: Arc<Database>, health: HealthConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(db.clone()),
            queue: UpdateQueue::new(db.clone()),
            presence: Presence::new(db.clone()),
            health: Arc::new(HealthMonitor::new(db.clone(), health)),
            db,
        }
    }

    /// Open and migrate the store for a relay rooted at `relay_path`.
    pub fn open(relay_path: &Path, config: &RelayConfig) -> Result<Self> {
        let db = Database::open(config.db_path(relay_path))?;
        db.initialize()?;
        Ok(Self::new(Arc::new(db), config.health.clone()))
    }

    pub fn in_memory(health: HealthConfig) -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.initialize()?;
        Ok(Self::new(Arc::new(db), health))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn register(
        &self,
        app_type: AppType,
        instance_id: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<InitialState> {
        self.presence.register(app_type, instance_id, metadata)?;
        Ok(InitialState {
            connections: self.registry.list_active()?,
            updates: self.queue.fetch_pending(app_type, DEFAULT_BATCH_SIZE)?,
        })
    }

    /// Queue a selection change for the other audience, ahead of value traffic.
    pub fn broadcast_selection(
        &self,
        from: AppType,
        selection: serde_json::Value,
        timestamp: Option<i64>,
    ) -> Result<Update> {
        if selection.is_null() {
            return Err(RelayError::validation("selection is required"));
        }
        self.queue.enqueue(
            UpdateType::Selection,
            from,
            from.opposite(),
            json!({ "selection": selection, "timestamp": timestamp }),
            UpdateType::Selection.default_priority(),
        )
    }

    /// Hand out the next batch for `target` and mark it processed.
    ///
    /// `last_update` is accepted for compatibility but does not filter. The
    /// processed flag is the delivery cursor; a time filter would strand older
    /// low-priority rows skipped by an earlier bounded batch.
    pub fn updates_for(
        &self,
        target: AppType,
        last_update: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Update>> {
        let updates = self
            .queue
            .deliver(target, limit.unwrap_or(DEFAULT_BATCH_SIZE))?;
        tracing::debug!(audience = %target, last_update, count = updates.len(), "poll served");
        Ok(updates)
    }

    /// Create or reactivate a pairing. The target audience hears about it
    /// only when something changed; a retried create is silent.
    pub fn create_connection(&self, source_ref: &str, target_ref: &str) -> Result<Connection> {
        let (connection, pairing) = self.registry.pair(source_ref, target_ref)?;
        if pairing.changed() {
            self.announce_connected(&connection)?;
        }
        Ok(connection)
    }

    /// Apply a patch. Switching a retired pairing back on reactivates it and
    /// announces it like a fresh create.
    pub fn update_connection(&self, id: &str, patch: ConnectionPatch) -> Result<Connection> {
        let mut connection = self.registry.get(id)?;
        let was_live = connection.is_live();
        if let Some(source_ref) = patch.source_ref.as_deref() {
            connection = self.registry.relocate(id, source_ref)?;
        }
        if patch.active.is_some() || patch.sync_enabled.is_some() {
            connection = self
                .registry
                .set_flags(id, patch.active, patch.sync_enabled)?;
        }
        if !was_live && connection.is_live() {
            self.announce_connected(&connection)?;
        }
        Ok(connection)
    }

    fn announce_connected(&self, connection: &Connection) -> Result<Update> {
        self.queue.enqueue(
            UpdateType::Connection,
            AppType::SourceApp,
            AppType::TargetApp,
            json!({ "action": "connected", "connection": connection }),
            UpdateType::Connection.default_priority(),
        )
    }

    pub fn delete_connection(&self, id: &str) -> Result<()> {
        let connection = self.registry.get(id)?;
        self.registry.soft_delete(id)?;
        self.queue.enqueue(
            UpdateType::Connection,
            AppType::SourceApp,
            AppType::TargetApp,
            json!({ "action": "disconnected", "connectionId": connection.id, "targetRef": connection.target_ref }),
            UpdateType::Connection.default_priority(),
        )?;
        Ok(())
    }

    /// Returns how many ids were newly acknowledged; repeats count zero.
    pub fn acknowledge(&self, ids: &[String]) -> Result<usize> {
        self.queue.acknowledge(ids)
    }

    /// Relay a source value through an active connection. `timestamp` is when
    /// the change happened on the source side and feeds the latency figures.
    pub fn post_cell_value(
        &self,
        connection_id: &str,
        value: serde_json::Value,
        timestamp: Option<i64>,
    ) -> Result<Update> {
        let connection = self.registry.get(connection_id)?;
        if !connection.active || connection.is_deleted() {
            return Err(RelayError::validation(format!(
                "connection {connection_id} is not active"
            )));
        }
        if !connection.sync_enabled {
            return Err(RelayError::validation(format!(
                "sync is disabled for connection {connection_id}"
            )));
        }

        let update = self.queue.enqueue(
            UpdateType::Value,
            AppType::SourceApp,
            AppType::TargetApp,
            json!({
                "connectionId": connection.id,
                "sourceRef": connection.source_ref,
                "targetRef": connection.target_ref,
                "value": value,
                "timestamp": timestamp,
            }),
            UpdateType::Value.default_priority(),
        )?;

        self.registry.touch_sync(&connection.id)?;
        if connection.status == ConnectionStatus::Error {
            self.registry
                .update_status(&connection.id, ConnectionStatus::Active, None)?;
        }
        let started_at = timestamp.and_then(DateTime::from_timestamp_millis);
        self.registry
            .record_sync_status(&connection.id, "synced", None, started_at)?;
        Ok(update)
    }

    /// Active connections not synced within the configured threshold.
    pub fn connection_health(&self) -> Result<(Vec<Connection>, DateTime<Utc>)> {
        let at = Utc::now();
        Ok((self.health.stale_connections_at(at)?, at))
    }

    pub fn heartbeat(&self, app_type: AppType, instance_id: Option<&str>) -> Result<AppState> {
        self.presence.heartbeat(app_type, instance_id)
    }

    pub fn report_error(
        &self,
        app_type: AppType,
        instance_id: Option<&str>,
        entry: NewErrorLog,
    ) -> Result<Option<ErrorLog>> {
        if entry.message.trim().is_empty() {
            return Err(RelayError::validation("error message is required"));
        }
        let connection_id = entry
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("connectionId"))
            .and_then(|id| id.as_str())
            .map(str::to_string);
        if let Some(connection_id) = connection_id {
            self.mark_connection_failed(&connection_id, &entry.message);
        }
        Ok(self.presence.report_app_error(app_type, instance_id, entry))
    }

    /// Best-effort: a report naming a retired or unknown pairing is still logged.
    fn mark_connection_failed(&self, connection_id: &str, message: &str) {
        let result = self.registry.get(connection_id).and_then(|connection| {
            if connection.is_deleted() {
                return Ok(());
            }
            self.registry
                .update_status(connection_id, ConnectionStatus::Error, Some(message))
                .map(|_| ())
        });
        if let Err(err) = result {
            tracing::debug!(connection = %connection_id, error = %err, "failed to flag connection error");
        }
    }

    pub fn snapshot(&self) -> Result<HealthSnapshot> {
        self.health.snapshot()
    }

    pub fn unacknowledged(&self, target: AppType) -> Result<Vec<Update>> {
        self.queue.fetch_unacknowledged(target)
    }

    /// Best-effort record of a failed relay operation.
    pub fn record_failure(&self, context: &str, err: &RelayError) {
        self.presence.record_error(NewErrorLog {
            app_type: None,
            error_type: context.to_string(),
            message: err.to_string(),
            stack_trace: None,
            metadata: Some(json!({ "kind": err.kind().as_str() })),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn relay() -> Relay {
        Relay::in_memory(HealthConfig::default()).unwrap()
    }

    #[test]
    fn selection_reaches_the_other_side_once() {
        let relay = relay();
        relay.register(AppType::SourceApp, None, None).unwrap();
        relay.register(AppType::TargetApp, None, None).unwrap();

        relay
            .broadcast_selection(AppType::SourceApp, json!("Sheet1!B2"), Some(0))
            .unwrap();

        assert!(relay.updates_for(AppType::SourceApp, Some(0), None).unwrap().is_empty());
        let updates = relay.updates_for(AppType::TargetApp, Some(0), None).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_type, UpdateType::Selection);
        assert_eq!(updates[0].content["selection"], "Sheet1!B2");

        let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
        assert_eq!(relay.unacknowledged(AppType::TargetApp).unwrap().len(), 1);
        assert_eq!(relay.acknowledge(&ids).unwrap(), 1);
        assert!(relay.unacknowledged(AppType::TargetApp).unwrap().is_empty());
    }

    #[test]
    fn register_returns_catch_up_state() {
        let relay = relay();
        relay.create_connection("A1", "el-1").unwrap();

        let state = relay.register(AppType::TargetApp, None, None).unwrap();
        assert_eq!(state.connections.len(), 1);
        assert_eq!(state.updates.len(), 1);
        assert_eq!(state.updates[0].update_type, UpdateType::Connection);

        // Registration does not consume the backlog.
        assert_eq!(relay.updates_for(AppType::TargetApp, None, None).unwrap().len(), 1);
    }

    #[test]
    fn cell_values_require_an_enabled_connection() {
        let relay = relay();
        let connection = relay.create_connection("A1", "el-1").unwrap();

        let update = relay
            .post_cell_value(&connection.id, json!(42), Some(Utc::now().timestamp_millis()))
            .unwrap();
        assert_eq!(update.update_type, UpdateType::Value);
        assert_eq!(update.content["targetRef"], "el-1");
        assert_eq!(relay.registry().sync_history(&connection.id).unwrap().len(), 1);

        relay
            .update_connection(
                &connection.id,
                ConnectionPatch {
                    sync_enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = relay
            .post_cell_value(&connection.id, json!(43), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = relay.post_cell_value("missing", json!(1), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn patch_relocates_and_toggles() {
        let relay = relay();
        let connection = relay.create_connection("A1", "el-1").unwrap();
        let patched = relay
            .update_connection(
                &connection.id,
                ConnectionPatch {
                    active: Some(false),
                    source_ref: Some("C3".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(patched.source_ref, "C3");
        assert_eq!(patched.original_source_ref, "A1");
        assert!(!patched.active);
    }

    #[test]
    fn switching_a_deleted_connection_on_reactivates_and_announces_it() {
        let relay = relay();
        let connection = relay.create_connection("A1", "el-1").unwrap();
        relay.delete_connection(&connection.id).unwrap();
        relay.updates_for(AppType::TargetApp, None, None).unwrap();

        let revived = relay
            .update_connection(
                &connection.id,
                ConnectionPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(revived.active);
        assert_eq!(revived.status, ConnectionStatus::Active);
        assert_eq!(relay.registry().list_active().unwrap().len(), 1);

        let notices = relay.updates_for(AppType::TargetApp, None, None).unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].content["action"], "connected");
        relay
            .post_cell_value(&connection.id, json!("back"), None)
            .unwrap();
    }

    #[test]
    fn retried_create_does_not_repeat_the_notice() {
        let relay = relay();
        let first = relay.create_connection("A1", "el-1").unwrap();
        let second = relay.create_connection("A1", "el-1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(relay.queue().pending_count(Some(AppType::TargetApp)).unwrap(), 1);

        relay.delete_connection(&first.id).unwrap();
        relay.create_connection("A1", "el-1").unwrap();
        // connected, disconnected, connected again
        assert_eq!(relay.queue().pending_count(Some(AppType::TargetApp)).unwrap(), 3);
    }

    #[test]
    fn last_update_does_not_hide_pending_rows() {
        let relay = relay();
        relay
            .broadcast_selection(AppType::SourceApp, json!("A1"), None)
            .unwrap();
        let future = Utc::now().timestamp_millis() + 60_000;

        let updates = relay
            .updates_for(AppType::TargetApp, Some(future), None)
            .unwrap();
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn apply_reports_flag_the_connection_until_the_next_value() {
        let relay = relay();
        let connection = relay.create_connection("A1", "el-1").unwrap();
        let report = |message: &str| NewErrorLog {
            app_type: None,
            error_type: "apply".into(),
            message: message.into(),
            stack_trace: None,
            metadata: Some(json!({ "connectionId": connection.id, "type": "value" })),
        };

        relay
            .report_error(AppType::TargetApp, None, report("element locked"))
            .unwrap();
        relay
            .report_error(AppType::TargetApp, None, report("element locked"))
            .unwrap();
        let failed = relay.registry().get(&connection.id).unwrap();
        assert_eq!(failed.status, ConnectionStatus::Error);
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.last_error.as_deref(), Some("element locked"));

        relay.post_cell_value(&connection.id, json!(7), None).unwrap();
        let healed = relay.registry().get(&connection.id).unwrap();
        assert_eq!(healed.status, ConnectionStatus::Active);
        assert_eq!(healed.retry_count, 0);
    }

    #[test]
    fn failures_are_recorded() {
        let relay = relay();
        let err = relay.delete_connection("missing").unwrap_err();
        relay.record_failure("delete_connection", &err);

        let logs = relay.presence().recent_errors(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error_type, "delete_connection");
        assert_eq!(logs[0].metadata["kind"], "not_found");
    }
}

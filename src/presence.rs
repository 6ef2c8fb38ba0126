//! App liveness and error reporting.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::model::{AppState, AppType, ErrorLog, NewErrorLog};
use crate::storage::db::{new_id, now};
use crate::storage::Database;

pub struct Presence {
    db: Arc<Database>,
}

impl Presence {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create or refresh the liveness row for a client instance. Instances
    /// that do not name themselves share one row per app type.
    pub fn register(
        &self,
        app_type: AppType,
        instance_id: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<AppState> {
        let instance_id = instance_key(app_type, instance_id);
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        let state = self
            .db
            .upsert_app_state(app_type, &instance_id, &metadata, now())?;
        tracing::info!(app = %app_type, instance = %instance_id, "registered app");
        Ok(state)
    }

    /// Record that an instance is alive. An unknown instance is registered.
    pub fn heartbeat(&self, app_type: AppType, instance_id: Option<&str>) -> Result<AppState> {
        let key = instance_key(app_type, instance_id);
        let connections = self.db.count_active_connections()?;
        if self.db.touch_app_state(&key, connections, now())? == 0 {
            self.register(app_type, Some(&key), None)?;
            self.db.touch_app_state(&key, connections, now())?;
        }
        self.get(&key)
    }

    pub fn get(&self, instance_id: &str) -> Result<AppState> {
        self.db
            .get_app_state(instance_id)?
            .ok_or_else(|| RelayError::not_found("app", instance_id))
    }

    pub fn list(&self) -> Result<Vec<AppState>> {
        self.db.list_app_states()
    }

    /// Apps not seen within `threshold_minutes` of `at`.
    pub fn list_stale_at(&self, threshold_minutes: i64, at: DateTime<Utc>) -> Result<Vec<AppState>> {
        let cutoff = at - Duration::minutes(threshold_minutes.max(0));
        self.db.list_apps_seen_before(cutoff)
    }

    /// Best-effort write to the error log. Never fails; a failure to record is
    /// itself only logged.
    pub fn record_error(&self, entry: NewErrorLog) -> Option<ErrorLog> {
        let row = ErrorLog {
            id: new_id(),
            app_type: entry.app_type,
            error_type: entry.error_type,
            message: entry.message,
            stack_trace: entry.stack_trace,
            metadata: entry.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now(),
        };

        match self.db.insert_error_log(&row) {
            Ok(()) => Some(row),
            Err(err) => {
                tracing::warn!(error = %err, error_type = %row.error_type, "failed to record error log");
                None
            }
        }
    }

    /// Record a failure reported by a client and flag its liveness row.
    pub fn report_app_error(
        &self,
        app_type: AppType,
        instance_id: Option<&str>,
        entry: NewErrorLog,
    ) -> Option<ErrorLog> {
        let key = instance_key(app_type, instance_id);
        if let Err(err) = self.db.set_app_error(&key, &entry.message) {
            tracing::warn!(error = %err, instance = %key, "failed to flag app error");
        }
        self.record_error(NewErrorLog {
            app_type: Some(app_type),
            ..entry
        })
    }

    pub fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLog>> {
        self.db.recent_error_logs(limit)
    }
}

fn instance_key(app_type: AppType, instance_id: Option<&str>) -> String {
    match instance_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => app_type.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence() -> (Arc<Database>, Presence) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        (db.clone(), Presence::new(db))
    }

    #[test]
    fn register_is_an_upsert() {
        let (_, presence) = presence();
        let first = presence.register(AppType::SourceApp, None, None).unwrap();
        let second = presence
            .register(AppType::SourceApp, None, Some(serde_json::json!({"v": 2})))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.metadata["v"], 2);
        assert_eq!(presence.list().unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_registers_unknown_instances() {
        let (_, presence) = presence();
        let state = presence
            .heartbeat(AppType::TargetApp, Some("deck-42"))
            .unwrap();
        assert_eq!(state.instance_id, "deck-42");
        assert_eq!(state.status, "online");
    }

    #[test]
    fn stale_apps_are_detected() {
        let (db, presence) = presence();
        presence.register(AppType::SourceApp, None, None).unwrap();
        db.touch_app_state("source-app", 0, Utc::now() - Duration::minutes(20))
            .unwrap();
        presence.register(AppType::TargetApp, None, None).unwrap();

        let stale = presence.list_stale_at(5, Utc::now()).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].app_type, AppType::SourceApp);
    }

    #[test]
    fn reported_errors_flag_the_app() {
        let (_, presence) = presence();
        presence.register(AppType::SourceApp, None, None).unwrap();
        let logged = presence.report_app_error(
            AppType::SourceApp,
            None,
            NewErrorLog {
                error_type: "poll".into(),
                message: "server unreachable".into(),
                ..Default::default()
            },
        );

        assert!(logged.is_some());
        let state = presence.get("source-app").unwrap();
        assert_eq!(state.status, "error");
        assert_eq!(state.last_error.as_deref(), Some("server unreachable"));
        assert_eq!(presence.recent_errors(10).unwrap().len(), 1);
    }
}

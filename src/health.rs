//! Health monitor and reaper
//!
//! Threshold breaches are reported as warnings only; nothing here changes
//! relay state except `reap`, which deletes rows that are already terminal.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HealthConfig;
use crate::error::Result;
use crate::model::{AppState, Connection};
use crate::storage::Database;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub active_connections: u64,
    pub pending_updates: u64,
    pub errors_last_hour: u64,
    pub mean_sync_latency_ms: Option<f64>,
    pub stale_connections: usize,
    pub stale_apps: Vec<AppState>,
    pub warnings: Vec<HealthWarning>,
    pub taken_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HealthWarning {
    PendingBacklog { pending: u64, ceiling: u64 },
    ErrorRate { errors: u64, ceiling: u64 },
    StaleApps { count: usize },
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub updates: usize,
    pub sync_statuses: usize,
    pub error_logs: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.updates + self.sync_statuses + self.error_logs
    }
}

pub struct HealthMonitor {
    db: Arc<Database>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(db: Arc<Database>, config: HealthConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Result<HealthSnapshot> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, at: DateTime<Utc>) -> Result<HealthSnapshot> {
        let hour_ago = at - Duration::hours(1);

        let active_connections = self.db.count_active_connections()?;
        let pending_updates = self.db.count_pending_updates(None)?;
        let errors_last_hour = self.db.count_errors_since(hour_ago)?;
        let mean_sync_latency_ms = self.db.mean_sync_latency_ms(hour_ago)?;
        let stale_connections = self.stale_connections_at(at)?.len();
        let stale_apps = self
            .db
            .list_apps_seen_before(at - Duration::minutes(self.config.stale_app_minutes.max(0)))?;

        let mut warnings = Vec::new();
        if pending_updates > self.config.max_pending_updates {
            warnings.push(HealthWarning::PendingBacklog {
                pending: pending_updates,
                ceiling: self.config.max_pending_updates,
            });
        }
        if errors_last_hour > self.config.max_errors_per_hour {
            warnings.push(HealthWarning::ErrorRate {
                errors: errors_last_hour,
                ceiling: self.config.max_errors_per_hour,
            });
        }
        if !stale_apps.is_empty() {
            warnings.push(HealthWarning::StaleApps {
                count: stale_apps.len(),
            });
        }

        for warning in &warnings {
            tracing::warn!(?warning, "health threshold breached");
        }

        Ok(HealthSnapshot {
            active_connections,
            pending_updates,
            errors_last_hour,
            mean_sync_latency_ms,
            stale_connections,
            stale_apps,
            warnings,
            taken_at: at,
        })
    }

    pub fn stale_connections_at(&self, at: DateTime<Utc>) -> Result<Vec<Connection>> {
        let cutoff = at - Duration::minutes(self.config.stale_connection_minutes.max(0));
        self.db.list_connections_synced_before(cutoff)
    }

    /// Delete processed updates and sync rows older than `retention_minutes`,
    /// and error logs older than that window times the error retention factor.
    /// The three deletes are independent; one failing does not stop the others.
    pub fn reap(&self, retention_minutes: i64) -> ReapReport {
        self.reap_at(retention_minutes, Utc::now())
    }

    pub fn reap_at(&self, retention_minutes: i64, at: DateTime<Utc>) -> ReapReport {
        let window = Duration::minutes(retention_minutes.max(0));
        let error_window = window * self.config.error_retention_factor.max(1) as i32;

        let report = ReapReport {
            updates: log_reap("updates", self.db.delete_processed_updates_before(at - window)),
            sync_statuses: log_reap("sync_status", self.db.delete_sync_status_before(at - window)),
            error_logs: log_reap("error_logs", self.db.delete_error_logs_before(at - error_window)),
        };

        if report.total() > 0 {
            tracing::info!(
                updates = report.updates,
                sync_statuses = report.sync_statuses,
                error_logs = report.error_logs,
                "reaped expired rows"
            );
        }
        report
    }
}

fn log_reap(table: &str, result: Result<usize>) -> usize {
    result.unwrap_or_else(|err| {
        tracing::warn!(table, error = %err, "reap failed");
        0
    })
}

/// Run `reap` every `config.reap_interval()` until `shutdown` turns true or
/// its sender is dropped.
pub fn spawn_reaper(monitor: Arc<HealthMonitor>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.config().reap_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let monitor = monitor.clone();
                    let retention = monitor.config().retention_minutes;
                    if let Err(err) = tokio::task::spawn_blocking(move || monitor.reap(retention)).await {
                        tracing::warn!(error = %err, "reaper task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("reaper stopped");
                        break;
                    }
                }
            }
        }
    })
}

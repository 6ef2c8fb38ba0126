//! Relay data model: connections, updates, app liveness and audit rows.

pub mod connection;
pub mod presence;
pub mod update;

pub use connection::{Connection, ConnectionStatus, SyncStatus};
pub use presence::{AppState, AppType, ErrorLog, NewErrorLog};
pub use update::{Update, UpdateType};

use chrono::{DateTime, Utc};

/// Current wall-clock time in epoch milliseconds, the storage resolution.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

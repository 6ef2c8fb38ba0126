use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::RelayError;

/// Pairing between a locator in the source app and one in the target app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    /// Identity key for de-duplication; survives relocation of `source_ref`
    pub original_source_ref: String,
    pub active: bool,
    pub sync_enabled: bool,
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Connection {
    pub fn new(source_ref: impl Into<String>, target_ref: impl Into<String>) -> Self {
        let source_ref = source_ref.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            original_source_ref: source_ref.clone(),
            source_ref,
            target_ref: target_ref.into(),
            active: true,
            sync_enabled: true,
            status: ConnectionStatus::Active,
            retry_count: 0,
            last_error: None,
            last_sync_time: Some(now),
            created_at: now,
            metadata: serde_json::json!({}),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ConnectionStatus::Deleted
    }

    /// Active and not retired: the rows `list_active` returns.
    pub fn is_live(&self) -> bool {
        self.active && !self.is_deleted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Error,
    Deleted,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "error" => Ok(ConnectionStatus::Error),
            "deleted" => Ok(ConnectionStatus::Deleted),
            other => Err(RelayError::validation(format!(
                "unknown connection status: {other}"
            ))),
        }
    }
}

/// Append-only audit row for one sync attempt on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub id: String,
    pub connection_id: String,
    pub status: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::AppType;
use crate::error::RelayError;

/// One unit of relay traffic.
///
/// `content` is opaque to the relay. Once `processed` is set the row only
/// ever changes its `acknowledged` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub id: String,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub source_type: AppType,
    pub target_type: AppType,
    pub content: serde_json::Value,
    pub priority: i64,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Selection,
    Value,
    Connection,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Selection => "selection",
            UpdateType::Value => "value",
            UpdateType::Connection => "connection",
        }
    }

    /// Default queue priority; selections overtake bulk value traffic.
    pub fn default_priority(&self) -> i64 {
        match self {
            UpdateType::Selection => 1,
            UpdateType::Value | UpdateType::Connection => 0,
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selection" => Ok(UpdateType::Selection),
            "value" => Ok(UpdateType::Value),
            "connection" => Ok(UpdateType::Connection),
            other => Err(RelayError::validation(format!("unknown update type: {other}"))),
        }
    }
}

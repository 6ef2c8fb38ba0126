use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// The two audiences partitioning the update log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppType {
    #[serde(rename = "source-app", alias = "source", alias = "sheets")]
    SourceApp,
    #[serde(rename = "target-app", alias = "target", alias = "slides")]
    TargetApp,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::SourceApp => "source-app",
            AppType::TargetApp => "target-app",
        }
    }

    /// The audience on the other side of the relay.
    pub fn opposite(&self) -> AppType {
        match self {
            AppType::SourceApp => AppType::TargetApp,
            AppType::TargetApp => AppType::SourceApp,
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source-app" | "source" | "sheets" => Ok(AppType::SourceApp),
            "target-app" | "target" | "slides" => Ok(AppType::TargetApp),
            other => Err(RelayError::validation(format!("unknown app type: {other}"))),
        }
    }
}

/// Liveness record for a registered client instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub id: String,
    pub app_type: AppType,
    pub instance_id: String,
    pub status: String,
    pub connection_count: u32,
    pub last_seen: DateTime<Utc>,
    pub last_error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Diagnostic record reported by a participating app or the relay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLog {
    pub id: String,
    pub app_type: Option<AppType>,
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewErrorLog {
    pub app_type: Option<AppType>,
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_type_accepts_legacy_names() {
        assert_eq!("sheets".parse::<AppType>().unwrap(), AppType::SourceApp);
        assert_eq!("Target".parse::<AppType>().unwrap(), AppType::TargetApp);
        assert!("printer".parse::<AppType>().is_err());

        let parsed: AppType = serde_json::from_str("\"slides\"").unwrap();
        assert_eq!(parsed, AppType::TargetApp);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"target-app\"");
    }

    #[test]
    fn opposite_audience() {
        assert_eq!(AppType::SourceApp.opposite(), AppType::TargetApp);
        assert_eq!(AppType::TargetApp.opposite(), AppType::SourceApp);
    }
}

//! Seam between the poll client and the application it runs inside.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::error::Result;

/// Host-application operations the poll client drives. Implementations must
/// be idempotent: the relay delivers at least once, so the same value or
/// highlight can arrive twice.
#[async_trait]
pub trait HostAdapter: Send + Sync {
    /// The locator currently selected by the local user, if any.
    async fn local_selection(&self) -> Result<Option<String>>;

    async fn apply_remote_value(&self, target_ref: &str, value: &serde_json::Value) -> Result<()>;

    async fn highlight_remote(&self, reference: &str) -> Result<()>;

    /// Mark a local object as driven by the other side.
    async fn protect_local_ref(&self, reference: &str) -> Result<()>;
}

/// Keeps host state in memory and logs every call. Backs `dx-relay poll`.
#[derive(Debug, Default)]
pub struct RecordingHost {
    state: Mutex<RecordedState>,
}

#[derive(Debug, Default, Clone)]
struct RecordedState {
    selection: Option<String>,
    values: HashMap<String, serde_json::Value>,
    writes: usize,
    highlighted: Option<String>,
    protected: HashSet<String>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, reference: impl Into<String>) {
        self.state.lock().selection = Some(reference.into());
    }

    pub fn value(&self, target_ref: &str) -> Option<serde_json::Value> {
        self.state.lock().values.get(target_ref).cloned()
    }

    /// Number of calls that changed a stored value.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    pub fn highlighted(&self) -> Option<String> {
        self.state.lock().highlighted.clone()
    }

    pub fn is_protected(&self, reference: &str) -> bool {
        self.state.lock().protected.contains(reference)
    }
}

#[async_trait]
impl HostAdapter for RecordingHost {
    async fn local_selection(&self) -> Result<Option<String>> {
        Ok(self.state.lock().selection.clone())
    }

    async fn apply_remote_value(&self, target_ref: &str, value: &serde_json::Value) -> Result<()> {
        let mut state = self.state.lock();
        if state.values.get(target_ref) == Some(value) {
            return Ok(());
        }
        state.values.insert(target_ref.to_string(), value.clone());
        state.writes += 1;
        tracing::info!(target_ref, %value, "applied remote value");
        Ok(())
    }

    async fn highlight_remote(&self, reference: &str) -> Result<()> {
        self.state.lock().highlighted = Some(reference.to_string());
        tracing::info!(reference, "remote selection");
        Ok(())
    }

    async fn protect_local_ref(&self, reference: &str) -> Result<()> {
        if self.state.lock().protected.insert(reference.to_string()) {
            tracing::info!(reference, "protected linked object");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn repeated_values_write_once() {
        let host = RecordingHost::new();
        host.apply_remote_value("el-1", &json!(42)).await.unwrap();
        host.apply_remote_value("el-1", &json!(42)).await.unwrap();

        assert_eq!(host.value("el-1"), Some(json!(42)));
        assert_eq!(host.writes(), 1);
    }
}

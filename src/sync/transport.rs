//! How a poll client reaches the relay.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::protocol::{
    AcknowledgeRequest, AcknowledgeResponse, AppStateResponse, BroadcastRequest, CellValueRequest,
    ErrorReportRequest, ErrorResponse, HeartbeatRequest, RegisterRequest, RegisterResponse,
    SuccessResponse, UpdateResponse, UpdatesQuery, UpdatesResponse,
};
use crate::error::{RelayError, Result};
use crate::model::{AppState, AppType, NewErrorLog, Update};
use crate::relay::{InitialState, Relay};

const MAX_LOG_BODY_CHARS: usize = 512;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn register(&self, app_type: AppType, instance_id: Option<&str>) -> Result<InitialState>;

    async fn poll(
        &self,
        app_type: AppType,
        last_update: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Update>>;

    async fn acknowledge(&self, ids: &[String]) -> Result<usize>;

    async fn broadcast_selection(
        &self,
        from: AppType,
        selection: serde_json::Value,
        timestamp: i64,
    ) -> Result<()>;

    async fn post_cell_value(
        &self,
        connection_id: &str,
        value: serde_json::Value,
        timestamp: i64,
    ) -> Result<Update>;

    async fn heartbeat(&self, app_type: AppType, instance_id: Option<&str>) -> Result<AppState>;

    async fn report_error(&self, app_type: AppType, report: ErrorReportRequest) -> Result<()>;
}

/// Talks to a relay server over its JSON API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// `base_url` is the API root including the prefix, e.g.
    /// `http://127.0.0.1:3000/api`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| RelayError::validation(format!("invalid relay url {base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(RelayError::validation(format!(
                "relay url must be http or https: {base_url}"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| RelayError::validation(format!("invalid endpoint {path}: {e}")))
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
            tracing::debug!(%status, body = %preview, "relay returned an error");
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|error| error.error)
                .unwrap_or(preview);
            return Err(RelayError::api(status.as_u16(), message));
        }

        serde_json::from_str(&body).map_err(|e| {
            RelayError::api(status.as_u16(), format!("failed to parse response: {e}"))
        })
    }

    async fn post<B: serde::Serialize + Sync + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.client.post(self.endpoint(path)?).json(body).send().await?;
        Self::parse_response(response).await
    }
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn register(&self, app_type: AppType, instance_id: Option<&str>) -> Result<InitialState> {
        let request = RegisterRequest {
            app_type,
            instance_id: instance_id.map(str::to_string),
            metadata: None,
        };
        let response: RegisterResponse = self.post("register", &request).await?;
        Ok(response.initial_state)
    }

    async fn poll(
        &self,
        app_type: AppType,
        last_update: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Update>> {
        let query = UpdatesQuery {
            last_update,
            limit: Some(limit),
        };
        let response = self
            .client
            .get(self.endpoint(&format!("updates/{app_type}"))?)
            .query(&query)
            .send()
            .await?;
        let response: UpdatesResponse = Self::parse_response(response).await?;
        Ok(response.updates)
    }

    async fn acknowledge(&self, ids: &[String]) -> Result<usize> {
        let request = AcknowledgeRequest {
            update_ids: ids.to_vec(),
        };
        let response: AcknowledgeResponse = self.post("updates/acknowledge", &request).await?;
        Ok(response.processed)
    }

    async fn broadcast_selection(
        &self,
        from: AppType,
        selection: serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        let request = BroadcastRequest {
            selection,
            timestamp: Some(timestamp),
        };
        let _: SuccessResponse = self
            .post(&format!("selection/{from}/broadcast"), &request)
            .await?;
        Ok(())
    }

    async fn post_cell_value(
        &self,
        connection_id: &str,
        value: serde_json::Value,
        timestamp: i64,
    ) -> Result<Update> {
        let request = CellValueRequest {
            connection_id: connection_id.to_string(),
            value,
            timestamp: Some(timestamp),
        };
        let response: UpdateResponse = self.post("updates/cell", &request).await?;
        Ok(response.update)
    }

    async fn heartbeat(&self, app_type: AppType, instance_id: Option<&str>) -> Result<AppState> {
        let request = HeartbeatRequest {
            instance_id: instance_id.map(str::to_string),
        };
        let response: AppStateResponse = self
            .post(&format!("heartbeat/{app_type}"), &request)
            .await?;
        Ok(response.app_state)
    }

    async fn report_error(&self, app_type: AppType, report: ErrorReportRequest) -> Result<()> {
        let _: SuccessResponse = self.post(&format!("errors/{app_type}"), &report).await?;
        Ok(())
    }
}

/// Calls a relay in the same process, skipping HTTP.
#[derive(Clone)]
pub struct LocalTransport {
    relay: Arc<Relay>,
}

impl LocalTransport {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Relay) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let relay = self.relay.clone();
        tokio::task::spawn_blocking(move || op(&relay))
            .await
            .map_err(|e| RelayError::fatal(format!("relay task failed: {e}")))?
    }
}

#[async_trait]
impl RelayTransport for LocalTransport {
    async fn register(&self, app_type: AppType, instance_id: Option<&str>) -> Result<InitialState> {
        let instance_id = instance_id.map(str::to_string);
        self.call(move |relay| relay.register(app_type, instance_id.as_deref(), None))
            .await
    }

    async fn poll(
        &self,
        app_type: AppType,
        last_update: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Update>> {
        self.call(move |relay| relay.updates_for(app_type, last_update, Some(limit)))
            .await
    }

    async fn acknowledge(&self, ids: &[String]) -> Result<usize> {
        let ids = ids.to_vec();
        self.call(move |relay| relay.acknowledge(&ids)).await
    }

    async fn broadcast_selection(
        &self,
        from: AppType,
        selection: serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        self.call(move |relay| relay.broadcast_selection(from, selection, Some(timestamp)))
            .await
            .map(|_| ())
    }

    async fn post_cell_value(
        &self,
        connection_id: &str,
        value: serde_json::Value,
        timestamp: i64,
    ) -> Result<Update> {
        let connection_id = connection_id.to_string();
        self.call(move |relay| relay.post_cell_value(&connection_id, value, Some(timestamp)))
            .await
    }

    async fn heartbeat(&self, app_type: AppType, instance_id: Option<&str>) -> Result<AppState> {
        let instance_id = instance_id.map(str::to_string);
        self.call(move |relay| relay.heartbeat(app_type, instance_id.as_deref()))
            .await
    }

    async fn report_error(&self, app_type: AppType, report: ErrorReportRequest) -> Result<()> {
        self.call(move |relay| {
            let entry = NewErrorLog {
                app_type: Some(app_type),
                error_type: report.error_type,
                message: report.message,
                stack_trace: report.stack_trace,
                metadata: report.metadata,
            };
            relay
                .report_error(app_type, report.instance_id.as_deref(), entry)
                .map(|_| ())
        })
        .await
    }
}

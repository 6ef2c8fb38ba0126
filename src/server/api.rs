use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::{RelayError, Result};
use crate::model::{AppType, NewErrorLog};
use crate::relay::{ConnectionPatch, Relay};
use crate::sync::protocol::{
    AcknowledgeRequest, AcknowledgeResponse, AppStateResponse, BroadcastRequest, CellValueRequest,
    ConnectionHealthResponse, ConnectionResponse, CreateConnectionRequest, ErrorReportRequest,
    ErrorResponse, HeartbeatRequest, RegisterRequest, RegisterResponse, SnapshotResponse,
    SuccessResponse, UpdateConnectionRequest, UpdateResponse, UpdatesQuery, UpdatesResponse,
};

#[derive(Clone)]
pub struct ApiState {
    pub relay: Arc<Relay>,
}

/// All relay routes under `prefix`, plus `/` and `/healthz` at the root.
pub fn router(relay: Arc<Relay>, prefix: &str) -> Router {
    let api = Router::new()
        .route("/register", post(register))
        .route("/selection/{type}/broadcast", post(broadcast_selection))
        .route("/updates/acknowledge", post(acknowledge))
        .route("/updates/cell", post(post_cell_value))
        .route("/updates/{type}", get(get_updates))
        .route("/updates/{type}/unacknowledged", get(get_unacknowledged))
        .route("/connections", post(create_connection))
        .route("/connections/health", get(connection_health))
        .route(
            "/connections/{id}",
            put(update_connection).delete(delete_connection),
        )
        .route("/heartbeat/{type}", post(heartbeat))
        .route("/errors/{type}", post(report_error))
        .route("/health", get(health_snapshot));

    let root = Router::new()
        .route("/", get(|| async { "DX Relay Server" }))
        .route("/healthz", get(|| async { Json("OK") }));

    let prefix = prefix.trim_end_matches('/');
    let app = if prefix.is_empty() {
        root.merge(api)
    } else {
        root.nest(prefix, api)
    };

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ApiState { relay })
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            kind: self.kind().as_str().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Run an engine call off the async workers. Failures are recorded to the
/// error log before being returned.
async fn run<T, F>(state: &ApiState, context: &'static str, op: F) -> Result<T>
where
    F: FnOnce(&Relay) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let relay = state.relay.clone();
    tokio::task::spawn_blocking(move || {
        let result = op(&relay);
        if let Err(err) = &result {
            tracing::debug!(context, error = %err, "request failed");
            relay.record_failure(context, err);
        }
        result
    })
    .await
    .map_err(|err| RelayError::fatal(format!("{context} task failed: {err}")))?
}

async fn body<T>(
    state: &ApiState,
    context: &'static str,
    payload: std::result::Result<Json<T>, JsonRejection>,
) -> Result<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(rejected(state, context, rejection.body_text()).await),
    }
}

/// Extractor rejections go to the error log like engine failures do.
async fn rejected(state: &ApiState, context: &'static str, reason: String) -> RelayError {
    tracing::debug!(context, %reason, "request rejected");
    let relay = state.relay.clone();
    let message = reason.clone();
    let recorded = tokio::task::spawn_blocking(move || {
        relay.record_failure(context, &RelayError::validation(message));
    })
    .await;
    if let Err(err) = recorded {
        tracing::warn!(context, error = %err, "failed to record rejected request");
    }
    RelayError::validation(reason)
}

fn app_type(raw: &str) -> Result<AppType> {
    raw.parse()
}

async fn register(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>> {
    let request = body(&state, "register", payload).await?;
    let app_type = request.app_type;
    let initial_state = run(&state, "register", move |relay| {
        relay.register(app_type, request.instance_id.as_deref(), request.metadata)
    })
    .await?;

    Ok(Json(RegisterResponse {
        success: true,
        app_type,
        initial_state,
    }))
}

async fn broadcast_selection(
    State(state): State<ApiState>,
    Path(raw_type): Path<String>,
    payload: std::result::Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>> {
    let request = body(&state, "broadcast_selection", payload).await?;
    run(&state, "broadcast_selection", move |relay| {
        relay.broadcast_selection(app_type(&raw_type)?, request.selection, request.timestamp)
    })
    .await?;
    Ok(Json(SuccessResponse::ok()))
}

async fn get_updates(
    State(state): State<ApiState>,
    Path(raw_type): Path<String>,
    query: std::result::Result<Query<UpdatesQuery>, QueryRejection>,
) -> Result<Json<UpdatesResponse>> {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return Err(rejected(&state, "get_updates", rejection.body_text()).await),
    };
    let updates = run(&state, "get_updates", move |relay| {
        relay.updates_for(app_type(&raw_type)?, query.last_update, query.limit)
    })
    .await?;
    Ok(Json(UpdatesResponse {
        success: true,
        updates,
    }))
}

async fn get_unacknowledged(
    State(state): State<ApiState>,
    Path(raw_type): Path<String>,
) -> Result<Json<UpdatesResponse>> {
    let updates = run(&state, "get_unacknowledged", move |relay| {
        relay.unacknowledged(app_type(&raw_type)?)
    })
    .await?;
    Ok(Json(UpdatesResponse {
        success: true,
        updates,
    }))
}

async fn create_connection(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<CreateConnectionRequest>, JsonRejection>,
) -> Result<Json<ConnectionResponse>> {
    let request = body(&state, "create_connection", payload).await?;
    let connection = run(&state, "create_connection", move |relay| {
        relay.create_connection(
            request.source_ref.as_deref().unwrap_or_default(),
            request.target_ref.as_deref().unwrap_or_default(),
        )
    })
    .await?;
    Ok(Json(ConnectionResponse {
        success: true,
        connection,
    }))
}

async fn update_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<UpdateConnectionRequest>, JsonRejection>,
) -> Result<Json<ConnectionResponse>> {
    let request = body(&state, "update_connection", payload).await?;
    let patch = ConnectionPatch {
        active: request.active,
        sync_enabled: request.sync_enabled,
        source_ref: request.source_ref,
    };
    let connection = run(&state, "update_connection", move |relay| {
        relay.update_connection(&id, patch)
    })
    .await?;
    Ok(Json(ConnectionResponse {
        success: true,
        connection,
    }))
}

async fn delete_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    run(&state, "delete_connection", move |relay| relay.delete_connection(&id)).await?;
    Ok(Json(SuccessResponse::ok()))
}

async fn acknowledge(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<AcknowledgeRequest>, JsonRejection>,
) -> Result<Json<AcknowledgeResponse>> {
    let request = body(&state, "acknowledge", payload).await?;
    let processed = run(&state, "acknowledge", move |relay| {
        relay.acknowledge(&request.update_ids)
    })
    .await?;
    Ok(Json(AcknowledgeResponse {
        success: true,
        processed,
    }))
}

async fn post_cell_value(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<CellValueRequest>, JsonRejection>,
) -> Result<Json<UpdateResponse>> {
    let request = body(&state, "post_cell_value", payload).await?;
    let update = run(&state, "post_cell_value", move |relay| {
        relay.post_cell_value(&request.connection_id, request.value, request.timestamp)
    })
    .await?;
    Ok(Json(UpdateResponse {
        success: true,
        update,
    }))
}

async fn connection_health(State(state): State<ApiState>) -> Result<Json<ConnectionHealthResponse>> {
    let (stale_connections, timestamp) =
        run(&state, "connection_health", |relay| relay.connection_health()).await?;
    Ok(Json(ConnectionHealthResponse {
        success: true,
        stale_connections,
        timestamp,
    }))
}

async fn heartbeat(
    State(state): State<ApiState>,
    Path(raw_type): Path<String>,
    payload: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<AppStateResponse>> {
    // The body is optional; an absent or unreadable one means "default instance".
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let app_state = run(&state, "heartbeat", move |relay| {
        relay.heartbeat(app_type(&raw_type)?, request.instance_id.as_deref())
    })
    .await?;
    Ok(Json(AppStateResponse {
        success: true,
        app_state,
    }))
}

async fn report_error(
    State(state): State<ApiState>,
    Path(raw_type): Path<String>,
    payload: std::result::Result<Json<ErrorReportRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>> {
    let request = body(&state, "report_error", payload).await?;
    run(&state, "report_error", move |relay| {
        let entry = NewErrorLog {
            app_type: None,
            error_type: if request.error_type.is_empty() {
                "client".to_string()
            } else {
                request.error_type
            },
            message: request.message,
            stack_trace: request.stack_trace,
            metadata: request.metadata,
        };
        relay.report_error(app_type(&raw_type)?, request.instance_id.as_deref(), entry)
    })
    .await?;
    Ok(Json(SuccessResponse::ok()))
}

async fn health_snapshot(State(state): State<ApiState>) -> Result<Json<SnapshotResponse>> {
    let snapshot = run(&state, "health", |relay| relay.snapshot()).await?;
    Ok(Json(SnapshotResponse {
        success: true,
        snapshot,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let relay = Arc::new(Relay::in_memory(HealthConfig::default()).unwrap());
        router(relay, "/api")
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn register_broadcast_poll_acknowledge() {
        let app = app();
        let (status, registered) =
            call(&app, "POST", "/api/register", Some(json!({"type": "source"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(registered["type"], "source-app");
        call(&app, "POST", "/api/register", Some(json!({"type": "target"}))).await;

        let (status, _) = call(
            &app,
            "POST",
            "/api/selection/source/broadcast",
            Some(json!({"selection": "Sheet1!A1", "timestamp": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, polled) = call(&app, "GET", "/api/updates/target?lastUpdate=0", None).await;
        let updates = polled["updates"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["type"], "selection");

        let id = updates[0]["id"].clone();
        let (_, acked) = call(
            &app,
            "POST",
            "/api/updates/acknowledge",
            Some(json!({"updateIds": [id]})),
        )
        .await;
        assert_eq!(acked["processed"], 1);

        let (_, waiting) = call(&app, "GET", "/api/updates/target/unacknowledged", None).await;
        assert!(waiting["updates"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let app = app();

        let (status, body) =
            call(&app, "POST", "/api/connections", Some(json!({"cellId": "A1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "validation");

        let (status, body) = call(&app, "DELETE", "/api/connections/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = call(&app, "GET", "/api/updates/printer", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Rejected before reaching the relay
        for (uri, body) in [
            ("/api/register", json!({"type": "printer"})),
            ("/api/updates/acknowledge", json!({"updateIds": 5})),
            ("/api/updates/cell", json!({"value": 1})),
        ] {
            let (status, body) = call(&app, "POST", uri, Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["kind"], "validation");
        }
        let (status, _) = call(&app, "GET", "/api/updates/target?limit=lots", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, health) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(health["snapshot"]["errorsLastHour"], 7);
    }

    #[tokio::test]
    async fn connection_lifecycle() {
        let app = app();
        let (_, created) = call(
            &app,
            "POST",
            "/api/connections",
            Some(json!({"cellId": "A1", "slideElementId": "el-1"})),
        )
        .await;
        let id = created["connection"]["id"].as_str().unwrap().to_string();

        let (_, again) = call(
            &app,
            "POST",
            "/api/connections",
            Some(json!({"sourceRef": "A1", "targetRef": "el-1"})),
        )
        .await;
        assert_eq!(again["connection"]["id"], id.as_str());

        let (status, updated) = call(
            &app,
            "PUT",
            &format!("/api/connections/{id}"),
            Some(json!({"cellId": "B2", "syncEnabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["connection"]["sourceRef"], "B2");
        assert_eq!(updated["connection"]["syncEnabled"], false);

        let (_, health) = call(&app, "GET", "/api/connections/health", None).await;
        assert!(health["staleConnections"].as_array().unwrap().is_empty());

        let (status, _) = call(&app, "DELETE", &format!("/api/connections/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unsynced_connections_show_up_as_stale() {
        let relay = Arc::new(Relay::in_memory(HealthConfig::default()).unwrap());
        let app = router(relay.clone(), "/api");
        let old = relay.create_connection("A1", "el-1").unwrap();
        relay.create_connection("A2", "el-2").unwrap();
        relay
            .database()
            .touch_connection_sync(&old.id, chrono::Utc::now() - chrono::Duration::hours(2))
            .unwrap();

        let (status, health) = call(&app, "GET", "/api/connections/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let stale = health["staleConnections"].as_array().unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0]["id"], old.id.as_str());
        assert!(health["timestamp"].is_string());
    }

    #[tokio::test]
    async fn liveness_routes_answer_at_the_root() {
        let app = app();
        let (status, body) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("OK"));
    }
}

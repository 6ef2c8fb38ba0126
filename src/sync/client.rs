//! Adaptive poll client
//!
//! One cooperative loop per participating application:
//! `Disconnected → Registering → Polling ⇄ Backoff → Error`. Polling,
//! applying and acknowledging are sequential inside the loop. The only
//! suspension points are the poll sleep and broadcast retry sleeps.

use chrono::Utc;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::host::HostAdapter;
use super::protocol::ErrorReportRequest;
use super::schedule::PollSchedule;
use super::transport::RelayTransport;
use crate::config::PollConfig;
use crate::error::{with_retry, RelayError, Result, RetryPolicy};
use crate::model::{AppType, Connection, Update, UpdateType};

/// Applied ids remembered for replay suppression.
const APPLIED_MEMORY: usize = 1_024;
const HEARTBEAT_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Registering,
    Polling,
    Backoff,
    /// Terminal: reconnect attempts exhausted
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Applied(usize),
    Idle,
}

#[derive(Debug, Default)]
struct AppliedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl AppliedIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
            if self.order.len() > APPLIED_MEMORY {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }
}

/// Everything one client instance knows about its session.
#[derive(Debug)]
pub struct ClientContext {
    pub app_type: AppType,
    pub instance_id: Option<String>,
    pub state: ClientState,
    /// Newest `createdAt` (epoch ms) seen so far
    pub last_update: Option<i64>,
    pub reconnect_attempts: u32,
    pub schedule: PollSchedule,
    applied: AppliedIds,
    last_heartbeat: Option<Instant>,
}

impl ClientContext {
    pub fn new(app_type: AppType, instance_id: Option<String>, config: &PollConfig) -> Self {
        Self {
            app_type,
            instance_id,
            state: ClientState::Disconnected,
            last_update: None,
            reconnect_attempts: 0,
            schedule: PollSchedule::from_config(config),
            applied: AppliedIds::default(),
            last_heartbeat: None,
        }
    }

    pub fn has_applied(&self, update_id: &str) -> bool {
        self.applied.contains(update_id)
    }
}

pub struct PollClient {
    transport: Arc<dyn RelayTransport>,
    host: Arc<dyn HostAdapter>,
    config: PollConfig,
    ctx: ClientContext,
}

impl PollClient {
    pub fn new(
        app_type: AppType,
        instance_id: Option<String>,
        transport: Arc<dyn RelayTransport>,
        host: Arc<dyn HostAdapter>,
        config: PollConfig,
    ) -> Self {
        Self {
            ctx: ClientContext::new(app_type, instance_id, &config),
            transport,
            host,
            config,
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    pub fn state(&self) -> ClientState {
        self.ctx.state
    }

    /// Sends local changes independently of the poll loop.
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            transport: self.transport.clone(),
            host: self.host.clone(),
            app_type: self.ctx.app_type,
            policy: self.config.broadcast_policy(),
        }
    }

    /// Register with the relay and apply the catch-up state it returns.
    pub async fn register(&mut self) -> Result<usize> {
        self.ctx.state = ClientState::Registering;
        let initial = match self
            .transport
            .register(self.ctx.app_type, self.ctx.instance_id.as_deref())
            .await
        {
            Ok(initial) => initial,
            Err(err) => {
                self.ctx.state = ClientState::Disconnected;
                return Err(err);
            }
        };

        self.ctx.state = ClientState::Polling;
        self.ctx.schedule.reset();
        self.ctx.last_heartbeat = Some(Instant::now());
        tracing::info!(
            app = %self.ctx.app_type,
            connections = initial.connections.len(),
            pending = initial.updates.len(),
            "registered with relay"
        );

        for connection in &initial.connections {
            self.protect(connection).await;
        }
        self.apply_and_acknowledge(initial.updates).await
    }

    /// Fetch, apply and acknowledge one batch, then adjust the cadence.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let updates = self
            .transport
            .poll(self.ctx.app_type, self.ctx.last_update, self.config.batch_size)
            .await?;

        if updates.is_empty() {
            self.ctx.schedule.on_idle();
            return Ok(PollOutcome::Idle);
        }

        let newest = updates.iter().map(|u| u.created_at.timestamp_millis()).max();
        let applied = self.apply_and_acknowledge(updates).await?;
        self.ctx.last_update = self.ctx.last_update.max(newest);
        self.ctx.schedule.on_activity();
        Ok(PollOutcome::Applied(applied))
    }

    /// Run one cycle of the state machine and return how long to wait before
    /// the next. Only the terminal transition is an error.
    pub async fn step(&mut self) -> Result<Duration> {
        let result = match self.ctx.state {
            ClientState::Error => {
                return Err(RelayError::fatal("poll client is in the error state"));
            }
            ClientState::Disconnected | ClientState::Registering => self.connect().await,
            ClientState::Polling | ClientState::Backoff => self.poll_once().await.map(|_| ()),
        };

        match result {
            Ok(()) => {
                self.ctx.state = ClientState::Polling;
                self.ctx.reconnect_attempts = 0;
                self.maybe_heartbeat().await;
                Ok(self.ctx.schedule.interval())
            }
            Err(err) => self.on_failure(err),
        }
    }

    /// Poll until `auto_update` turns false, its sender goes away, or the
    /// client reaches the error state.
    pub async fn run(mut self, mut auto_update: watch::Receiver<bool>) -> Result<ClientContext> {
        if *auto_update.borrow_and_update() {
            loop {
                let delay = self.step().await?;
                if !wait_enabled(&mut auto_update, delay).await {
                    break;
                }
            }
        }

        self.ctx.state = ClientState::Disconnected;
        tracing::info!(app = %self.ctx.app_type, "poll client stopped");
        Ok(self.ctx)
    }

    /// Move the client onto its own task.
    pub fn spawn(self) -> PollHandle {
        let (auto_update, receiver) = watch::channel(true);
        let broadcaster = self.broadcaster();
        let task = tokio::spawn(self.run(receiver));
        PollHandle {
            auto_update,
            broadcaster,
            task,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        self.register().await?;
        self.poll_once().await.map(|_| ())
    }

    fn on_failure(&mut self, err: RelayError) -> Result<Duration> {
        let failures = self.ctx.schedule.on_failure();
        if self.ctx.state != ClientState::Disconnected {
            self.ctx.state = ClientState::Backoff;
        }
        tracing::warn!(app = %self.ctx.app_type, failures, error = %err, "relay call failed");

        if failures > self.config.failure_threshold {
            if self.ctx.reconnect_attempts >= self.config.max_reconnect_attempts {
                self.ctx.state = ClientState::Error;
                tracing::error!(
                    app = %self.ctx.app_type,
                    attempts = self.ctx.reconnect_attempts,
                    "giving up on relay"
                );
                return Err(RelayError::fatal(format!(
                    "relay unreachable after {} reconnect attempts: {err}",
                    self.ctx.reconnect_attempts
                )));
            }
            self.ctx.reconnect_attempts += 1;
            self.ctx.state = ClientState::Disconnected;
            tracing::info!(
                app = %self.ctx.app_type,
                attempt = self.ctx.reconnect_attempts,
                "will re-register with relay"
            );
        }

        Ok(self.ctx.schedule.interval())
    }

    /// Apply each update not seen before and acknowledge everything that was
    /// applied now or earlier. Updates that fail to apply stay
    /// unacknowledged for reconciliation.
    async fn apply_and_acknowledge(&mut self, updates: Vec<Update>) -> Result<usize> {
        let mut acknowledged = Vec::with_capacity(updates.len());
        let mut applied = 0;

        for update in &updates {
            if self.ctx.applied.contains(&update.id) {
                tracing::debug!(id = %update.id, "skipping replayed update");
                acknowledged.push(update.id.clone());
                continue;
            }

            match self.apply(update).await {
                Ok(()) => {
                    self.ctx.applied.insert(&update.id);
                    acknowledged.push(update.id.clone());
                    applied += 1;
                }
                Err(err) => {
                    tracing::warn!(id = %update.id, kind = %update.update_type, error = %err, "failed to apply update");
                    self.report(update, &err).await;
                }
            }
        }

        if !acknowledged.is_empty() {
            self.transport.acknowledge(&acknowledged).await?;
        }
        Ok(applied)
    }

    async fn apply(&self, update: &Update) -> Result<()> {
        let content = &update.content;
        match update.update_type {
            UpdateType::Selection => {
                let reference = match content.get("selection") {
                    Some(serde_json::Value::String(reference)) => reference.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => return Err(RelayError::validation("selection update without a selection")),
                };
                self.host.highlight_remote(&reference).await
            }
            UpdateType::Value => {
                let target_ref = content
                    .get("targetRef")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RelayError::validation("value update without a targetRef"))?;
                let value = content.get("value").unwrap_or(&serde_json::Value::Null);
                self.host.apply_remote_value(target_ref, value).await
            }
            UpdateType::Connection => match content.get("connection") {
                Some(raw) => {
                    let connection: Connection = serde_json::from_value(raw.clone())?;
                    self.host.protect_local_ref(self.local_ref(&connection)).await
                }
                None => {
                    tracing::debug!(id = %update.id, "connection removed on the other side");
                    Ok(())
                }
            },
        }
    }

    fn local_ref<'a>(&self, connection: &'a Connection) -> &'a str {
        match self.ctx.app_type {
            AppType::SourceApp => &connection.source_ref,
            AppType::TargetApp => &connection.target_ref,
        }
    }

    async fn protect(&self, connection: &Connection) {
        if let Err(err) = self.host.protect_local_ref(self.local_ref(connection)).await {
            tracing::warn!(connection = %connection.id, error = %err, "failed to protect linked object");
        }
    }

    async fn report(&self, update: &Update, err: &RelayError) {
        let report = ErrorReportRequest {
            error_type: "apply".to_string(),
            message: err.to_string(),
            stack_trace: None,
            metadata: Some(json!({
                "updateId": update.id,
                "type": update.update_type,
                "connectionId": update.content.get("connectionId"),
            })),
            instance_id: self.ctx.instance_id.clone(),
        };
        if let Err(report_err) = self.transport.report_error(self.ctx.app_type, report).await {
            tracing::debug!(error = %report_err, "failed to report apply error");
        }
    }

    async fn maybe_heartbeat(&mut self) {
        let due = self
            .ctx
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= HEARTBEAT_EVERY);
        if !due {
            return;
        }
        match self
            .transport
            .heartbeat(self.ctx.app_type, self.ctx.instance_id.as_deref())
            .await
        {
            Ok(_) => self.ctx.last_heartbeat = Some(Instant::now()),
            Err(err) => tracing::debug!(error = %err, "heartbeat failed"),
        }
    }
}

/// Sleep out `delay`. Returns false as soon as auto-update turns off or its
/// sender goes away; re-sending `true` keeps the remaining delay.
async fn wait_enabled(auto_update: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = auto_update.changed() => {
                if changed.is_err() || !*auto_update.borrow_and_update() {
                    return false;
                }
            }
        }
    }
}

/// Retried, fire-and-forget broadcasts of local changes. A broadcast that
/// exhausts its retries is logged and dropped.
#[derive(Clone)]
pub struct Broadcaster {
    transport: Arc<dyn RelayTransport>,
    host: Arc<dyn HostAdapter>,
    app_type: AppType,
    policy: RetryPolicy,
}

impl Broadcaster {
    pub async fn broadcast_selection(&self, selection: serde_json::Value) -> bool {
        let timestamp = Utc::now().timestamp_millis();
        let transport = &self.transport;
        let result = with_retry(&self.policy, || {
            transport.broadcast_selection(self.app_type, selection.clone(), timestamp)
        })
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(app = %self.app_type, error = %err, "dropping selection broadcast");
                false
            }
        }
    }

    /// Broadcast whatever the host reports as selected.
    pub async fn broadcast_local_selection(&self) -> bool {
        match self.host.local_selection().await {
            Ok(Some(selection)) => self.broadcast_selection(json!(selection)).await,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read local selection");
                false
            }
        }
    }

    pub async fn push_value(&self, connection_id: &str, value: serde_json::Value) -> bool {
        let timestamp = Utc::now().timestamp_millis();
        let transport = &self.transport;
        let result = with_retry(&self.policy, || {
            transport.post_cell_value(connection_id, value.clone(), timestamp)
        })
        .await;

        match result {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(connection = connection_id, error = %err, "dropping value update");
                false
            }
        }
    }
}

/// Control surface for a spawned poll client.
pub struct PollHandle {
    auto_update: watch::Sender<bool>,
    broadcaster: Broadcaster,
    task: JoinHandle<Result<ClientContext>>,
}

impl PollHandle {
    /// Disabling takes effect before the next scheduled wake-up.
    pub fn set_auto_update(&self, enabled: bool) {
        self.auto_update.send_replace(enabled);
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<ClientContext> {
        self.task
            .await
            .map_err(|e| RelayError::fatal(format!("poll task failed: {e}")))?
    }
}

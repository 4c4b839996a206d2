//! Upstream connector (C2): one adapter per enabled [`ServerConfig`], owning
//! its transport, status, tool list, retry timer, and keep-alive.
//!
//! The four kinds (`stdio`, `sse`, `streamable-http`, `openapi`) share one
//! state machine and error-handling contract; only the transport-specific
//! handshake in `initialize()` and the call path differ, which is why they
//! live in their own submodules but are driven from here.

mod openapi;
mod sse;
mod stdio;
mod streamable_http;

use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff as _, ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        ProgressNotificationParam, ReadResourceRequestParam, ReadResourceResult,
    },
    service::{NotificationContext, RunningService},
    ClientHandler, RoleClient,
};
use serde_json::Map;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

pub use openapi::synthesize_openapi_tools;

use crate::{
    error::{HubError, HubResult},
    settings::{ServerConfig, ServerKind, ToolOverride},
};

/// The deadline knobs in effect for one `callTool`, already merged with the
/// target connector's `options` by the caller (§4.6, §5).
#[derive(Debug, Clone, Copy)]
pub struct EffectiveDeadline {
    pub timeout: Duration,
    pub max_total_timeout: Option<Duration>,
    pub reset_on_progress: bool,
}

/// Tracks the instant of the most recently observed MCP progress
/// notification from this connector's upstream, so `resetTimeoutOnProgress`
/// can extend an in-flight call's deadline (§4.6, §5). Shared across all
/// concurrently in-flight calls on a connector; a progress event on any one
/// of them resets the clock for all of them, which is a deliberate
/// simplification since MCP progress tokens aren't threaded back to a
/// specific `callTool` caller here.
#[derive(Clone, Default)]
struct ProgressTracker(Arc<RwLock<Option<std::time::Instant>>>);

impl ProgressTracker {
    fn touch(&self) {
        *self.0.write() = Some(std::time::Instant::now());
    }

    fn last(&self) -> Option<std::time::Instant> {
        *self.0.read()
    }
}

#[derive(Clone, Default)]
struct ConnectorClientHandler {
    progress: ProgressTracker,
}

impl ClientHandler for ConnectorClientHandler {
    async fn on_progress(
        &self,
        _params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        self.progress.touch();
    }
}

type McpClient = RunningService<RoleClient, ConnectorClientHandler>;

/// One entry in the merged tool view (§3 `ToolInfo`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolInfo {
    pub server: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Map<String, serde_json::Value>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Runtime twin of [`ServerConfig`] (§3 `ConnectorState`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectorState {
    pub status: ConnectorStatus,
    pub last_error: Option<String>,
    pub tools: Vec<ToolInfo>,
    pub create_time: DateTime<Utc>,
    pub retry_attempt: u32,
}

impl ConnectorState {
    fn new() -> Self {
        Self {
            status: ConnectorStatus::Disconnected,
            last_error: None,
            tools: Vec::new(),
            create_time: Utc::now(),
            retry_attempt: 0,
        }
    }
}

/// The live transport, if any. OpenAPI connectors never populate this —
/// they are a stateless HTTP adapter (§4.2 "No persistent transport").
enum Transport {
    None,
    Client(Arc<McpClient>),
    OpenApi(openapi::OpenApiAdapter),
}

/// Adapter over one upstream MCP server.
///
/// State transitions (`disconnected -> connecting -> connected ->
/// disconnected`) are serialized by `lifecycle`, a per-connector async
/// mutex (§4.2 "Transitions are atomic against concurrent
/// initialize()/disconnect()"); `state` is a separate `parking_lot::RwLock`
/// so readers (the pool, the registry) never block behind an in-flight
/// initialize.
pub struct Connector {
    pub name: String,
    config: RwLock<ServerConfig>,
    state: RwLock<ConnectorState>,
    transport: AsyncMutex<Transport>,
    lifecycle: AsyncMutex<()>,
    keep_alive: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    openapi_resynth: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    retry_backoff: AsyncMutex<ExponentialBackoff>,
    progress: ProgressTracker,
}

/// base=1s, factor=2, cap=60s, unbounded retries (§4.2). No jitter, so the
/// schedule is deterministic and testable.
fn new_retry_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(Duration::from_secs(60))
        .with_max_elapsed_time(None)
        .build()
}

impl Connector {
    pub fn new(name: String, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config: RwLock::new(config),
            state: RwLock::new(ConnectorState::new()),
            transport: AsyncMutex::new(Transport::None),
            lifecycle: AsyncMutex::new(()),
            keep_alive: AsyncMutex::new(None),
            openapi_resynth: AsyncMutex::new(None),
            retry_backoff: AsyncMutex::new(new_retry_backoff()),
            progress: ProgressTracker::default(),
        })
    }

    pub fn snapshot(&self) -> ConnectorState {
        self.state.read().clone()
    }

    pub fn config_snapshot(&self) -> ServerConfig {
        self.config.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().status == ConnectorStatus::Connected
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Replace the config used on the next initialize/reconcile pass.
    pub fn update_config(&self, config: ServerConfig) {
        *self.config.write() = config;
    }

    /// Performs the kind-specific handshake (§4.2). A second call while
    /// already `connecting` is a no-op; `connected -> connected` is also a
    /// no-op unless `force` is set (protocol error or settings diff).
    #[instrument(skip(self), fields(server = %self.name))]
    pub async fn initialize(self: &Arc<Self>, force: bool) {
        let _guard = self.lifecycle.lock().await;
        {
            let state = self.state.read();
            if state.status == ConnectorStatus::Connecting {
                return;
            }
            if state.status == ConnectorStatus::Connected && !force {
                return;
            }
        }
        self.set_status(ConnectorStatus::Connecting, None);

        let config = self.config.read().clone();
        let result = self.connect_kind(&config).await;

        match result {
            Ok((transport, tools)) => {
                *self.transport.lock().await = transport;
                {
                    let mut state = self.state.write();
                    state.status = ConnectorStatus::Connected;
                    state.last_error = None;
                    state.tools = apply_overrides(&self.name, tools, &config.tools);
                    state.retry_attempt = 0;
                }
                self.retry_backoff.lock().await.reset();
                info!(tools = self.state.read().tools.len(), "connector connected");
                self.spawn_keep_alive(config.keep_alive_interval_secs);
                self.spawn_openapi_resynth();
            }
            Err(err) => {
                self.set_status(ConnectorStatus::Disconnected, Some(err.to_string()));
                warn!(error = %err, "initialize failed, scheduling retry");
                self.schedule_retry();
            }
        }
    }

    async fn connect_kind(
        &self,
        config: &ServerConfig,
    ) -> HubResult<(Transport, Vec<rmcp::model::Tool>)> {
        let handler = ConnectorClientHandler {
            progress: self.progress.clone(),
        };
        match config.kind {
            ServerKind::Stdio => {
                let client = stdio::connect(config, handler).await?;
                let tools = list_all_tools(&self.name, &client).await?;
                Ok((Transport::Client(Arc::new(client)), tools))
            }
            ServerKind::Sse => {
                let client = sse::connect(config, handler).await?;
                let tools = list_all_tools(&self.name, &client).await?;
                Ok((Transport::Client(Arc::new(client)), tools))
            }
            ServerKind::StreamableHttp => {
                let client = streamable_http::connect(config, handler).await?;
                let tools = list_all_tools(&self.name, &client).await?;
                Ok((Transport::Client(Arc::new(client)), tools))
            }
            ServerKind::Openapi => {
                let adapter = openapi::OpenApiAdapter::build(&self.name, config).await?;
                let tools = adapter.synthesized_tools();
                Ok((Transport::OpenApi(adapter), tools))
            }
        }
    }

    /// Exponential backoff retry (base 1s, factor 2, cap 60s) until success
    /// or the connector is disabled (§4.2).
    fn schedule_retry(self: &Arc<Self>) {
        let this = Arc::clone(self);
        {
            let mut state = self.state.write();
            state.retry_attempt += 1;
        }
        tokio::spawn(async move {
            let delay = this
                .retry_backoff
                .lock()
                .await
                .next_backoff()
                .unwrap_or(Duration::from_secs(60));
            tokio::time::sleep(delay).await;
            if !this.is_enabled() {
                return;
            }
            this.initialize(false).await;
        });
    }

    fn set_status(&self, status: ConnectorStatus, error: Option<String>) {
        let mut state = self.state.write();
        state.status = status;
        if error.is_some() {
            state.last_error = error;
        }
    }

    /// SSE keep-alive: empty ping on an interval, marking the connector
    /// disconnected after three consecutive failures (§4.2). Streamable-HTTP
    /// relies on the transport's own keep-alive; stdio relies on process
    /// liveness, so only the SSE kind schedules a timer here. Called with
    /// `self.lifecycle` already held by `initialize()`, so the swap below
    /// never races a concurrent `disconnect()`.
    fn spawn_keep_alive(self: &Arc<Self>, interval_secs: Option<u64>) {
        if self.config.read().kind != ServerKind::Sse {
            return;
        }

        let this = Arc::clone(self);
        let interval = Duration::from_secs(interval_secs.unwrap_or(60));
        let handle = tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !this.is_connected() {
                    return;
                }
                match this.ping().await {
                    Ok(()) => consecutive_failures = 0,
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(error = %err, consecutive_failures, "keep-alive ping failed");
                        if consecutive_failures >= 3 {
                            this.set_status(
                                ConnectorStatus::Disconnected,
                                Some("keep-alive: 3 consecutive failures".to_string()),
                            );
                            this.schedule_retry();
                            return;
                        }
                    }
                }
            }
        });
        if let Some(mut old) = self.keep_alive.try_lock().ok() {
            if let Some(previous) = old.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Polls the openapi adapter on a fixed cadence; the adapter itself
    /// decides whether its TTL (§4.2.4) is actually due. Called with
    /// `self.lifecycle` already held by `initialize()`, same as
    /// `spawn_keep_alive`.
    fn spawn_openapi_resynth(self: &Arc<Self>) {
        if self.config.read().kind != ServerKind::Openapi {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if !this.is_connected() {
                    return;
                }
                let transport = this.transport.lock().await;
                let Transport::OpenApi(adapter) = &*transport else {
                    return;
                };
                if let Some(tools) = adapter.maybe_resynthesize().await {
                    let config = this.config.read().clone();
                    let mut state = this.state.write();
                    state.tools = apply_overrides(&this.name, tools, &config.tools);
                    info!(server = %this.name, "openapi tools re-synthesized");
                }
            }
        });
        if let Some(mut old) = self.openapi_resynth.try_lock().ok() {
            if let Some(previous) = old.replace(handle) {
                previous.abort();
            }
        }
    }

    async fn ping(&self) -> HubResult<()> {
        let transport = self.transport.lock().await;
        match &*transport {
            Transport::Client(client) => client
                .peer()
                .list_tools(Default::default())
                .await
                .map(|_| ())
                .map_err(|e| HubError::Transport {
                    server: self.name.clone(),
                    message: e.to_string(),
                }),
            _ => Ok(()),
        }
    }

    pub async fn list_tools(&self) -> Vec<ToolInfo> {
        self.state.read().tools.clone()
    }

    /// Live (uncached) prompt/resource listing, forwarded straight to the
    /// upstream (§4.6 "aggregated from all in-view connectors"). OpenAPI
    /// connectors expose neither concept and always answer empty.
    pub async fn list_prompts(&self) -> HubResult<Vec<rmcp::model::Prompt>> {
        let transport = self.transport.lock().await;
        match &*transport {
            Transport::Client(client) => {
                client
                    .peer()
                    .list_all_prompts()
                    .await
                    .map_err(|e| HubError::Transport {
                        server: self.name.clone(),
                        message: e.to_string(),
                    })
            }
            _ => Ok(Vec::new()),
        }
    }

    pub async fn list_resources(&self) -> HubResult<Vec<rmcp::model::Resource>> {
        let transport = self.transport.lock().await;
        match &*transport {
            Transport::Client(client) => {
                client
                    .peer()
                    .list_all_resources()
                    .await
                    .map_err(|e| HubError::Transport {
                        server: self.name.clone(),
                        message: e.to_string(),
                    })
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Enforces `deadline` end-to-end (§4.6, §5): the base timeout, extended
    /// on each observed upstream progress notification when
    /// `reset_on_progress` is set, but never past `max_total_timeout`.
    #[instrument(skip(self, args, deadline), fields(server = %self.name, tool = %tool_name))]
    pub async fn call_tool(
        &self,
        tool_name: &str,
        args: Map<String, serde_json::Value>,
        deadline: EffectiveDeadline,
    ) -> HubResult<CallToolResult> {
        if !self.is_connected() {
            return Err(HubError::Transport {
                server: self.name.clone(),
                message: "not connected".to_string(),
            });
        }
        let fut = self.call_tool_inner(tool_name, args);
        tokio::pin!(fut);

        let start = std::time::Instant::now();
        let hard_ceiling = deadline.max_total_timeout.map(|d| start + d);
        let mut current_deadline = start + deadline.timeout;
        if let Some(ceiling) = hard_ceiling {
            current_deadline = current_deadline.min(ceiling);
        }

        loop {
            let now = std::time::Instant::now();
            let Some(remaining) = current_deadline.checked_duration_since(now) else {
                return Err(HubError::Timeout {
                    server: self.name.clone(),
                });
            };
            // Poll in short ticks so a progress reset mid-wait is picked up
            // promptly instead of only after the whole remaining span.
            let tick = remaining.min(Duration::from_millis(250));
            match tokio::time::timeout(tick, &mut fut).await {
                Ok(result) => return result,
                Err(_) => {
                    if now + tick < current_deadline {
                        // Just a polling tick, not a real expiry yet.
                        continue;
                    }
                    if !deadline.reset_on_progress {
                        return Err(HubError::Timeout {
                            server: self.name.clone(),
                        });
                    }
                    match self.progress.last() {
                        Some(last) if last > start => {
                            let mut extended = last + deadline.timeout;
                            if let Some(ceiling) = hard_ceiling {
                                extended = extended.min(ceiling);
                            }
                            if extended <= current_deadline {
                                return Err(HubError::Timeout {
                                    server: self.name.clone(),
                                });
                            }
                            current_deadline = extended;
                        }
                        _ => {
                            return Err(HubError::Timeout {
                                server: self.name.clone(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn call_tool_inner(
        &self,
        tool_name: &str,
        args: Map<String, serde_json::Value>,
    ) -> HubResult<CallToolResult> {
        let transport = self.transport.lock().await;
        match &*transport {
            Transport::Client(client) => {
                let request = CallToolRequestParam {
                    name: std::borrow::Cow::Owned(tool_name.to_string()),
                    arguments: Some(args),
                };
                client
                    .call_tool(request)
                    .await
                    .map_err(|e| HubError::Upstream {
                        server: self.name.clone(),
                        message: e.to_string(),
                    })
            }
            Transport::OpenApi(adapter) => adapter.call(tool_name, args).await,
            Transport::None => Err(HubError::Transport {
                server: self.name.clone(),
                message: "no transport".to_string(),
            }),
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        args: Option<Map<String, serde_json::Value>>,
    ) -> HubResult<GetPromptResult> {
        let transport = self.transport.lock().await;
        match &*transport {
            Transport::Client(client) => client
                .get_prompt(GetPromptRequestParam {
                    name: name.to_string(),
                    arguments: args,
                })
                .await
                .map_err(|e| HubError::Upstream {
                    server: self.name.clone(),
                    message: e.to_string(),
                }),
            _ => Err(HubError::NotFound(format!("prompt {name}"))),
        }
    }

    pub async fn read_resource(&self, uri: &str) -> HubResult<ReadResourceResult> {
        let transport = self.transport.lock().await;
        match &*transport {
            Transport::Client(client) => client
                .read_resource(ReadResourceRequestParam {
                    uri: uri.to_string(),
                })
                .await
                .map_err(|e| HubError::Upstream {
                    server: self.name.clone(),
                    message: e.to_string(),
                }),
            _ => Err(HubError::NotFound(format!("resource {uri}"))),
        }
    }

    /// Tears down the transport, clears the keep-alive timer, and cancels
    /// in-flight requests (§4.2). Non-fatal: always leaves the connector in
    /// `Disconnected`.
    #[instrument(skip(self), fields(server = %self.name))]
    pub async fn disconnect(self: &Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        if let Some(handle) = self.keep_alive.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.openapi_resynth.lock().await.take() {
            handle.abort();
        }
        let mut transport = self.transport.lock().await;
        if let Transport::Client(client) = std::mem::replace(&mut *transport, Transport::None) {
            if let Ok(client) = Arc::try_unwrap(client) {
                let _ = client.cancel().await;
            }
        }
        let mut state = self.state.write();
        state.status = ConnectorStatus::Disconnected;
        state.tools.clear();
    }
}

async fn list_all_tools(server: &str, client: &McpClient) -> HubResult<Vec<rmcp::model::Tool>> {
    client
        .peer()
        .list_all_tools()
        .await
        .map_err(|e| HubError::Transport {
            server: server.to_string(),
            message: e.to_string(),
        })
}

/// Apply per-tool overrides after the raw list is received: disabled tools
/// filtered, descriptions replaced, `$schema` stripped (§4.2).
fn apply_overrides(
    server: &str,
    tools: Vec<rmcp::model::Tool>,
    overrides: &std::collections::HashMap<String, ToolOverride>,
) -> Vec<ToolInfo> {
    tools
        .into_iter()
        .filter_map(|tool| {
            let name = tool.name.to_string();
            let over = overrides.get(&name);
            let enabled = over.map(|o| o.enabled).unwrap_or(true);
            if !enabled {
                return None;
            }
            let description = over
                .and_then(|o| o.description.clone())
                .or_else(|| tool.description.clone().map(|d| d.to_string()))
                .unwrap_or_default();
            let mut schema = (*tool.input_schema).clone();
            schema.remove("$schema");
            Some(ToolInfo {
                server: server.to_string(),
                name,
                description,
                input_schema: schema,
                enabled: true,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_60s() {
        let mut b = new_retry_backoff();
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(4)));
        for _ in 0..10 {
            b.next_backoff();
        }
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn apply_overrides_strips_schema_and_filters_disabled() {
        use std::collections::HashMap;
        let tool = rmcp::model::Tool {
            name: std::borrow::Cow::Owned("search".to_string()),
            title: None,
            description: Some(std::borrow::Cow::Owned("raw".to_string())),
            input_schema: Arc::new({
                let mut m = Map::new();
                m.insert("$schema".into(), serde_json::json!("http://json-schema.org"));
                m.insert("type".into(), serde_json::json!("object"));
                m
            }),
            output_schema: None,
            annotations: None,
            icons: None,
        };
        let mut overrides = HashMap::new();
        overrides.insert(
            "search".to_string(),
            ToolOverride {
                enabled: true,
                description: Some("overridden".to_string()),
            },
        );
        let infos = apply_overrides("srv", vec![tool], &overrides);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].description, "overridden");
        assert!(!infos[0].input_schema.contains_key("$schema"));
    }
}

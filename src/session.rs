//! Downstream session (C7): one per connected client, carrying its resolved
//! scope, capability negotiation, and a bounded outbound queue for
//! server-to-client notifications over SSE. The RPC handling itself is
//! shared between the SSE and streamable-HTTP ingress paths (§4.7).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rmcp::model::{
    CallToolRequestParam, ClientRequest, ErrorData, Implementation, InitializeResult,
    ProtocolVersion, ServerCapabilities, ServerResult,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    dispatcher::{Dispatcher, RequestOptions},
    registry::{AuthContext, Scope},
    settings::SettingsDocument,
};

/// Bounded outbound queue size; past this, new notifications are dropped
/// rather than buffered unboundedly for a slow consumer (§4.7).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Resolves a URL scope segment against the current settings document.
/// `absent` → global; `$smart` → smart; a name matching both a group and a
/// server resolves to the group (§4.7).
pub fn resolve_scope(segment: Option<&str>, document: &SettingsDocument) -> Scope {
    let Some(segment) = segment.filter(|s| !s.is_empty()) else {
        return Scope::Global;
    };
    if segment == "$smart" {
        return Scope::Smart;
    }
    if let Some(group) = document
        .groups
        .iter()
        .find(|g| g.id == segment || g.name == segment)
    {
        return Scope::Group(group.id.clone());
    }
    if document.mcp_servers.contains_key(segment) {
        return Scope::Server(segment.to_string());
    }
    // Neither a known group nor server: treated as an (empty) group scope
    // so the caller sees "no tools" rather than silently falling back to
    // global, which would widen access beyond what the URL asked for.
    Scope::Group(segment.to_string())
}

pub struct Session {
    pub id: String,
    pub scope: Scope,
    pub auth: AuthContext,
    pub created_at: DateTime<Utc>,
    outbound_tx: mpsc::Sender<serde_json::Value>,
    outbound_rx: AsyncMutex<Option<mpsc::Receiver<serde_json::Value>>>,
    cancellation: CancellationToken,
}

impl Session {
    fn new(id: String, scope: Scope, auth: AuthContext) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Arc::new(Self {
            id,
            scope,
            auth,
            created_at: Utc::now(),
            outbound_tx: tx,
            outbound_rx: AsyncMutex::new(Some(rx)),
            cancellation: CancellationToken::new(),
        })
    }

    /// Enqueues an outbound message; on a full queue the message is dropped
    /// and logged rather than applying backpressure to the sender (§4.7
    /// "slow consumer").
    pub fn try_send(&self, message: serde_json::Value) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.outbound_tx.try_send(message) {
            warn!(session = %self.id, "outbound queue full, dropping message for slow consumer");
        }
    }

    /// Takes ownership of the receiving half; only the task driving this
    /// session's SSE stream should call this, and only once.
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<serde_json::Value>> {
        self.outbound_rx.lock().await.take()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
}

/// All live sessions, keyed by hub-assigned session id (the SSE
/// `sessionId` / streamable-HTTP `mcp-session-id`).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, scope: Scope, auth: AuthContext) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), scope, auth);
        self.sessions.insert(id, Arc::clone(&session));
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Unregisters the session and cancels its in-flight calls (§4.7 "On
    /// transport close").
    pub fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.cancel();
        }
    }
}

/// Advertises `tools`/`prompts`/`resources` only if the corresponding view
/// is non-empty; smart sessions always advertise tools, since `smart.search`
/// is itself a pseudo-tool (§4.7).
pub fn capabilities_for(
    scope: &Scope,
    has_tools: bool,
    has_prompts: bool,
    has_resources: bool,
) -> ServerCapabilities {
    let mut builder = ServerCapabilities::builder().enable_logging();
    if has_tools || matches!(scope, Scope::Smart) {
        builder = builder.enable_tools().enable_tool_list_changed();
    }
    if has_prompts {
        builder = builder.enable_prompts().enable_prompt_list_changed();
    }
    if has_resources {
        builder = builder.enable_resources().enable_resource_list_changed();
    }
    builder.build()
}

/// The smart-routing pseudo-tool advertised in addition to any real tools
/// when `scope` is `Smart` (§4.7).
pub fn smart_search_tool() -> rmcp::model::Tool {
    let mut schema = serde_json::Map::new();
    schema.insert("type".to_string(), serde_json::json!("object"));
    schema.insert(
        "properties".to_string(),
        serde_json::json!({
            "query": { "type": "string" },
            "k": { "type": "integer" },
            "threshold": { "type": "number" },
        }),
    );
    schema.insert(
        "required".to_string(),
        serde_json::json!(["query"]),
    );
    rmcp::model::Tool {
        name: std::borrow::Cow::Borrowed("smart.search"),
        title: None,
        description: Some(std::borrow::Cow::Borrowed(
            "Search the aggregate tool catalog by natural-language query and rank results by relevance.",
        )),
        input_schema: Arc::new(schema),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

/// Answers one request against `dispatcher`, honoring §4.6's explicit
/// operations, the `smart.search` pseudo-tool, and the single-server
/// pass-through rule.
pub async fn handle_request(
    dispatcher: &Dispatcher,
    session: &Session,
    document: &SettingsDocument,
    request: ClientRequest,
) -> Result<ServerResult, ErrorData> {
    match request {
        ClientRequest::InitializeRequest(_) => {
            let tools = dispatcher
                .list_tools(&session.scope, &session.auth, document)
                .await;
            let prompts = dispatcher
                .list_prompts(&session.scope, &session.auth, document)
                .await
                .unwrap_or_default();
            let resources = dispatcher
                .list_resources(&session.scope, &session.auth, document)
                .await
                .unwrap_or_default();
            let capabilities = capabilities_for(
                &session.scope,
                !tools.is_empty(),
                !prompts.is_empty(),
                !resources.is_empty(),
            );
            Ok(ServerResult::InitializeResult(InitializeResult {
                protocol_version: ProtocolVersion::V_2025_03_26,
                capabilities,
                server_info: Implementation {
                    name: "mcphub".into(),
                    title: Some("MCPHub".into()),
                    version: env!("CARGO_PKG_VERSION").into(),
                    icons: None,
                    website_url: None,
                },
                instructions: None,
            }))
        }
        ClientRequest::ListToolsRequest(_) => {
            let mut tools = dispatcher
                .list_tools(&session.scope, &session.auth, document)
                .await;
            if matches!(session.scope, Scope::Smart) {
                tools.push(smart_search_tool());
            }
            Ok(ServerResult::ListToolsResult(rmcp::model::ListToolsResult {
                tools,
                next_cursor: None,
            }))
        }
        ClientRequest::ListPromptsRequest(_) => {
            let prompts = dispatcher
                .list_prompts(&session.scope, &session.auth, document)
                .await
                .map_err(to_error_data)?;
            Ok(ServerResult::ListPromptsResult(
                rmcp::model::ListPromptsResult {
                    prompts,
                    next_cursor: None,
                },
            ))
        }
        ClientRequest::ListResourcesRequest(_) => {
            let resources = dispatcher
                .list_resources(&session.scope, &session.auth, document)
                .await
                .map_err(to_error_data)?;
            Ok(ServerResult::ListResourcesResult(
                rmcp::model::ListResourcesResult {
                    resources,
                    next_cursor: None,
                },
            ))
        }
        ClientRequest::CallToolRequest(req) => {
            let CallToolRequestParam { name, arguments } = req.params;
            if name == "smart.search" && matches!(session.scope, Scope::Smart) {
                return handle_smart_search(dispatcher, session, document, arguments)
                    .await
                    .map_err(to_error_data);
            }
            let result = dispatcher
                .call_tool(
                    &session.scope,
                    &session.auth,
                    document,
                    &name,
                    arguments.unwrap_or_default(),
                    RequestOptions::default(),
                )
                .await
                .map_err(to_error_data)?;
            Ok(ServerResult::CallToolResult(result))
        }
        ClientRequest::GetPromptRequest(req) => {
            let result = dispatcher
                .get_prompt_passthrough(&session.scope, &req.params.name, req.params.arguments)
                .await
                .map_err(to_error_data)?;
            Ok(ServerResult::GetPromptResult(result))
        }
        ClientRequest::ReadResourceRequest(req) => {
            let result = dispatcher
                .read_resource_passthrough(&session.scope, &req.params.uri)
                .await
                .map_err(to_error_data)?;
            Ok(ServerResult::ReadResourceResult(result))
        }
        _ => Err(ErrorData::invalid_params(
            "method-not-found",
            Some(serde_json::json!({ "kind": "not-found" })),
        )),
    }
}

async fn handle_smart_search(
    dispatcher: &Dispatcher,
    session: &Session,
    document: &SettingsDocument,
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
) -> crate::error::HubResult<rmcp::model::CallToolResult> {
    let arguments = arguments.unwrap_or_default();
    let query = arguments
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::error::HubError::Schema {
            server: "smart-routing".to_string(),
            message: "smart.search requires a `query` string argument".to_string(),
        })?;
    let k = arguments
        .get("k")
        .and_then(|v| v.as_u64())
        .unwrap_or(10) as usize;
    let threshold = arguments
        .get("threshold")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.7) as f32;

    match dispatcher
        .smart_call(
            &session.scope,
            &session.auth,
            document,
            query,
            serde_json::Map::new(),
            k,
            threshold,
            RequestOptions::default(),
        )
        .await?
    {
        crate::dispatcher::SmartCallOutcome::Called(result) => Ok(result),
        crate::dispatcher::SmartCallOutcome::Ranked(hits) => {
            let payload = serde_json::to_string(&serde_json::json!({
                "ranked": hits.iter().map(|h| serde_json::json!({
                    "server": h.server,
                    "tool": h.tool_name,
                    "score": h.score,
                })).collect::<Vec<_>>(),
            }))
            .unwrap_or_default();
            Ok(rmcp::model::CallToolResult::success(vec![
                rmcp::model::Content::text(payload),
            ]))
        }
    }
}

fn to_error_data(err: crate::error::HubError) -> ErrorData {
    use crate::error::ErrorKind;

    let data = Some(err.to_mcp_error_data());
    let message = err.to_string();
    match err.kind() {
        ErrorKind::NotFound => ErrorData::invalid_params(message, data),
        ErrorKind::Schema => ErrorData::invalid_params(message, data),
        _ => ErrorData::internal_error(message, data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Group, GroupMember};

    fn document_with_group_and_server() -> SettingsDocument {
        let mut document = SettingsDocument::empty();
        document.groups.push(Group {
            id: "g1".to_string(),
            name: "shared-name".to_string(),
            owner: "root".to_string(),
            members: vec![GroupMember::Bare("srv".to_string())],
        });
        document.mcp_servers.insert(
            "shared-name".to_string(),
            crate::settings::ServerConfig {
                kind: crate::settings::ServerKind::Stdio,
                enabled: true,
                owner: None,
                keep_alive_interval_secs: None,
                options: Default::default(),
                tools: Default::default(),
                command: Some("echo".to_string()),
                args: Vec::new(),
                env: Default::default(),
                url: None,
                headers: Default::default(),
                openapi: None,
            },
        );
        document
    }

    #[test]
    fn absent_segment_is_global() {
        let document = SettingsDocument::empty();
        assert!(matches!(resolve_scope(None, &document), Scope::Global));
    }

    #[test]
    fn dollar_smart_is_smart_scope() {
        let document = SettingsDocument::empty();
        assert!(matches!(
            resolve_scope(Some("$smart"), &document),
            Scope::Smart
        ));
    }

    #[test]
    fn group_name_takes_precedence_over_server_name_collision() {
        let document = document_with_group_and_server();
        assert!(matches!(
            resolve_scope(Some("shared-name"), &document),
            Scope::Group(id) if id == "g1"
        ));
    }

    #[test]
    fn plain_server_name_resolves_to_server_scope() {
        let mut document = SettingsDocument::empty();
        document.mcp_servers.insert(
            "only-server".to_string(),
            document_with_group_and_server().mcp_servers["shared-name"].clone(),
        );
        assert!(matches!(
            resolve_scope(Some("only-server"), &document),
            Scope::Server(name) if name == "only-server"
        ));
    }
}

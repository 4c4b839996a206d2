//! Ingress (C8): the hub's downstream-facing HTTP surface. Mounts the SSE
//! transport, the streamable-HTTP transport, and the admin API under one
//! `axum::Router`, all bound to the same connector pool / dispatcher /
//! session registry (§4.7, §4.8, §6).

pub mod admin;
pub mod auth;

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    dispatcher::Dispatcher,
    error::HubError,
    metrics::HubMetrics,
    pool::ConnectorPool,
    session::{self, Session, SessionRegistry},
    settings::SettingsStore,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SettingsStore>,
    pub pool: Arc<ConnectorPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<HubMetrics>,
    pub jwt_secret: String,
    pub readonly: bool,
}

/// Mounts the full ingress surface under `base_path` (default `""`).
pub fn router(state: AppState, base_path: &str) -> Router {
    let base_path = normalize_base_path(base_path);

    let mcp_routes = Router::new()
        .route("/sse", get(sse_global))
        .route("/sse/{scope}", get(sse_scoped))
        .route("/messages", post(messages_global))
        .route("/{scope}/messages", post(messages_scoped))
        .route(
            "/mcp",
            post(streamable_post_global)
                .get(streamable_get_global)
                .delete(streamable_delete_global),
        )
        .route(
            "/mcp/{scope}",
            post(streamable_post_scoped)
                .get(streamable_get_scoped)
                .delete(streamable_delete_scoped),
        );

    let admin_routes = admin::router();

    Router::new()
        .nest(&base_path, mcp_routes)
        .nest(&format!("{base_path}/api"), admin_routes)
        .with_state(state)
}

fn normalize_base_path(base_path: &str) -> String {
    if base_path.is_empty() || base_path == "/" {
        String::new()
    } else if let Some(stripped) = base_path.strip_suffix('/') {
        stripped.to_string()
    } else {
        base_path.to_string()
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind().as_str(),
        });
        (status, Json(body)).into_response()
    }
}

/// The subset of a JSON-RPC request this hub needs: `rmcp`'s `ClientRequest`
/// already captures `method`/`params`, so only `jsonrpc`/`id` are handled
/// separately here for envelope round-tripping.
#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Option<serde_json::Value>,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

fn envelope_ok(id: Option<serde_json::Value>, result: rmcp::model::ServerResult) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn envelope_err(id: Option<serde_json::Value>, err: rmcp::model::ErrorData) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": err })
}

fn parse_client_request(raw: &RawRequest) -> Result<rmcp::model::ClientRequest, rmcp::model::ErrorData> {
    let wire = serde_json::json!({ "method": raw.method, "params": raw.params });
    serde_json::from_value(wire).map_err(|e| {
        rmcp::model::ErrorData::parse_error(format!("unrecognized request: {e}"), None)
    })
}

async fn authenticated_scope(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    scope_segment: Option<&str>,
    method: &Method,
    is_tool_call: bool,
) -> Result<(crate::registry::Scope, crate::registry::AuthContext, Arc<crate::settings::SettingsDocument>), HubError> {
    let document = state.store.load().await;
    auth::check_global_route(&document, scope_segment)?;
    auth::check_readonly(state.readonly, method, is_tool_call)?;
    let auth_ctx = auth::authenticate(&document, headers, query, &state.jwt_secret)?;
    let scope = session::resolve_scope(scope_segment, &document);
    Ok((scope, auth_ctx, document))
}

// ---- SSE transport -------------------------------------------------------

async fn sse_global(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, HubError> {
    sse_stream(state, None, headers, query).await
}

async fn sse_scoped(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, HubError> {
    sse_stream(state, Some(scope), headers, query).await
}

async fn sse_stream(
    state: AppState,
    scope_segment: Option<String>,
    headers: HeaderMap,
    query: HashMap<String, String>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, HubError> {
    let (scope, auth_ctx, _document) = authenticated_scope(
        &state,
        &headers,
        &query,
        scope_segment.as_deref(),
        &Method::GET,
        false,
    )
    .await?;

    let session = state.sessions.create(scope, auth_ctx);
    state.metrics.record_session_opened();
    let receiver = session
        .take_receiver()
        .await
        .expect("freshly created session always has a receiver");

    let endpoint = match &scope_segment {
        Some(segment) => format!("messages?sessionId={}&scope={}", session.id, segment),
        None => format!("messages?sessionId={}", session.id),
    };
    let endpoint_event = futures::stream::once(async move {
        Ok(Event::default().event("endpoint").data(endpoint))
    });

    let metrics = Arc::clone(&state.metrics);
    let sessions = Arc::clone(&state.sessions);
    let session_id = session.id.clone();
    let message_events = ReceiverStream::new(receiver).map(move |message| {
        Ok(Event::default()
            .event("message")
            .data(serde_json::to_string(&message).unwrap_or_default()))
    });
    let cancellation = session.cancellation_token();
    let guarded = message_events.take_until(async move {
        cancellation.cancelled().await;
        metrics.record_session_closed();
        sessions.remove(&session_id);
    });

    Ok(Sse::new(endpoint_event.chain(guarded)).keep_alive(KeepAlive::default()))
}

// ---- SSE message ingestion ------------------------------------------------

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn messages_global(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    Json(raw): Json<RawRequest>,
) -> Result<StatusCode, HubError> {
    dispatch_over_session(&state, &query.session_id, raw).await
}

async fn messages_scoped(
    State(state): State<AppState>,
    Path(_scope): Path<String>,
    Query(query): Query<MessagesQuery>,
    Json(raw): Json<RawRequest>,
) -> Result<StatusCode, HubError> {
    dispatch_over_session(&state, &query.session_id, raw).await
}

/// Processes one JSON-RPC call against an existing SSE session and pushes
/// the response onto that session's outbound queue; the HTTP response here
/// is just an acknowledgement (§4.7 SSE transport convention).
async fn dispatch_over_session(
    state: &AppState,
    session_id: &str,
    raw: RawRequest,
) -> Result<StatusCode, HubError> {
    let session = state
        .sessions
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
    let document = state.store.load().await;
    let id = raw.id.clone();
    let outcome = match parse_client_request(&raw) {
        Ok(request) => session::handle_request(&state.dispatcher, &session, &document, request)
            .await
            .map(|result| envelope_ok(id.clone(), result))
            .unwrap_or_else(|e| envelope_err(id, e)),
        Err(e) => envelope_err(id, e),
    };
    session.try_send(outcome);
    Ok(StatusCode::ACCEPTED)
}

// ---- Streamable-HTTP transport -------------------------------------------

const SESSION_HEADER: &str = "mcp-session-id";

async fn streamable_post_global(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Response, HubError> {
    streamable_post(state, None, headers, query, body).await
}

async fn streamable_post_scoped(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Response, HubError> {
    streamable_post(state, Some(scope), headers, query, body).await
}

async fn streamable_post(
    state: AppState,
    scope_segment: Option<String>,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: axum::body::Bytes,
) -> Result<Response, HubError> {
    let raw: RawRequest = serde_json::from_slice(&body).map_err(HubError::from)?;
    let is_init = raw.method == "initialize";

    let session_id_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let (session, document) = if is_init {
        let (scope, auth_ctx, document) = authenticated_scope(
            &state,
            &headers,
            &query,
            scope_segment.as_deref(),
            &Method::POST,
            false,
        )
        .await?;
        let session = state.sessions.create(scope, auth_ctx);
        state.metrics.record_session_opened();
        (session, document)
    } else {
        let session_id = session_id_header
            .ok_or_else(|| HubError::SessionNotFound("missing mcp-session-id header".to_string()))?;
        let session = state
            .sessions
            .get(&session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id))?;
        let document = state.store.load().await;
        auth::check_readonly(state.readonly, &Method::POST, raw.method == "tools/call")?;
        (session, document)
    };

    let id = raw.id.clone();
    let body = match parse_client_request(&raw) {
        Ok(request) => session::handle_request(&state.dispatcher, &session, &document, request)
            .await
            .map(|result| envelope_ok(id.clone(), result))
            .unwrap_or_else(|e| envelope_err(id, e)),
        Err(e) => envelope_err(id, e),
    };

    let mut response = Json(body).into_response();
    if is_init {
        if let Ok(header_value) = axum::http::HeaderValue::from_str(&session.id) {
            response.headers_mut().insert(SESSION_HEADER, header_value);
        }
    }
    Ok(response)
}

async fn streamable_get_global(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HubError> {
    streamable_get(state, headers).await
}

async fn streamable_get_scoped(
    State(state): State<AppState>,
    Path(_scope): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HubError> {
    streamable_get(state, headers).await
}

/// Long-lived GET on the streamable-HTTP transport: drains server-initiated
/// notifications for an already-initialized session over SSE.
async fn streamable_get(
    state: AppState,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, HubError> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HubError::SessionNotFound("missing mcp-session-id header".to_string()))?;
    let session = state
        .sessions
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
    let receiver = session
        .take_receiver()
        .await
        .ok_or_else(|| HubError::Internal("session stream already taken".to_string()))?;

    let stream = ReceiverStream::new(receiver).map(|message| {
        Ok(Event::default().data(serde_json::to_string(&message).unwrap_or_default()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn streamable_delete_global(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, HubError> {
    streamable_delete(state, headers).await
}

async fn streamable_delete_scoped(
    State(state): State<AppState>,
    Path(_scope): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, HubError> {
    streamable_delete(state, headers).await
}

async fn streamable_delete(state: AppState, headers: HeaderMap) -> Result<StatusCode, HubError> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HubError::SessionNotFound("missing mcp-session-id header".to_string()))?;
    state.sessions.remove(session_id);
    state.metrics.record_session_closed();
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_path_strips_trailing_slash() {
        assert_eq!(normalize_base_path("/mcphub/"), "/mcphub");
        assert_eq!(normalize_base_path("/mcphub"), "/mcphub");
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
    }

    #[test]
    fn raw_request_parses_method_and_params() {
        let raw: RawRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#)
                .unwrap();
        assert_eq!(raw.method, "tools/list");
        assert_eq!(raw.id, Some(serde_json::json!(1)));
    }
}

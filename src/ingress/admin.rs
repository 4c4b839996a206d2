//! REST-ish admin API (§6): JSON over HTTP under `{basePath}/api`, JWT
//! authenticated unless `skipAuth`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    dispatcher::RequestOptions,
    error::HubError,
    registry::AuthContext,
    settings::{Group, InstallConfig, McpRouterConfig, RoutingConfig, ServerConfig, SmartRoutingConfig, UserAccount, UserConfig},
};

use super::{auth, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers", get(list_servers).post(upsert_server))
        .route(
            "/servers/{name}",
            get(get_server).put(upsert_named_server).delete(delete_server),
        )
        .route("/servers/{name}/enabled", put(set_server_enabled))
        .route("/groups", get(list_groups).post(create_group))
        .route(
            "/groups/{id}",
            get(get_group).put(update_group).delete(delete_group),
        )
        .route("/groups/{id}/servers/batch", put(replace_group_servers))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/system-config/{partition}", put(put_system_config_partition))
        .route("/tools/call/{server}", post(call_tool))
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/me", get(me))
        .route("/auth/password", put(change_password))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

fn error_response(err: HubError) -> (StatusCode, Json<ErrorBody>) {
    let status = StatusCode::from_u16(err.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            kind: err.kind().as_str(),
        }),
    )
}

async fn list_servers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let document = state.store.load().await;
    Json(serde_json::to_value(&document.mcp_servers).unwrap_or_default())
}

async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerConfig>, (StatusCode, Json<ErrorBody>)> {
    let document = state.store.load().await;
    document
        .mcp_servers
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| error_response(HubError::ServerNotFound(name)))
}

#[derive(Deserialize)]
struct NamedServer {
    name: String,
    #[serde(flatten)]
    config: ServerConfig,
}

async fn upsert_server(
    State(state): State<AppState>,
    Json(body): Json<NamedServer>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    save_server(&state, body.name, body.config, true).await
}

async fn upsert_named_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<ServerConfig>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    save_server(&state, name, config, false).await
}

/// `reject_collision` is set for the POST create path only: §9's first open
/// question and DESIGN's "Open Question decision #1" give `ServerConfig.name`
/// a single global namespace, so creating a server under a name that already
/// exists is refused rather than silently overwriting it. The PUT-by-name
/// path is an update and may freely replace the config under its own name.
async fn save_server(
    state: &AppState,
    name: String,
    config: ServerConfig,
    reject_collision: bool,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    config.validate().map_err(|e| error_response(HubError::Config(e)))?;
    let mut document = (*state.store.load().await).clone();
    if reject_collision && document.mcp_servers.contains_key(&name) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                error: format!("server {name} already exists"),
                kind: "config",
            }),
        ));
    }
    document.mcp_servers.insert(name, config);
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

async fn delete_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    document.mcp_servers.remove(&name);
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_server_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    let server = document
        .mcp_servers
        .get_mut(&name)
        .ok_or_else(|| error_response(HubError::ServerNotFound(name.clone())))?;
    server.enabled = body.enabled;
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

async fn list_groups(State(state): State<AppState>) -> Json<Vec<Group>> {
    Json(state.store.load().await.groups.clone())
}

async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Group>, (StatusCode, Json<ErrorBody>)> {
    state
        .store
        .load()
        .await
        .groups
        .iter()
        .find(|g| g.id == id)
        .cloned()
        .map(Json)
        .ok_or_else(|| error_response(HubError::GroupNotFound(id)))
}

async fn create_group(
    State(state): State<AppState>,
    Json(group): Json<Group>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    document.groups.push(group);
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::CREATED)
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(group): Json<Group>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    let slot = document
        .groups
        .iter_mut()
        .find(|g| g.id == id)
        .ok_or_else(|| error_response(HubError::GroupNotFound(id.clone())))?;
    *slot = group;
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    document.groups.retain(|g| g.id != id);
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn replace_group_servers(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(members): Json<Vec<crate::settings::GroupMember>>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    let group = document
        .groups
        .iter_mut()
        .find(|g| g.id == id)
        .ok_or_else(|| error_response(HubError::GroupNotFound(id.clone())))?;
    group.members = members;
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

async fn get_settings(State(state): State<AppState>) -> Json<serde_json::Value> {
    let document = state.store.load().await;
    Json(serde_json::to_value(&*document).unwrap_or_default())
}

async fn put_settings(
    State(state): State<AppState>,
    Json(document): Json<crate::settings::SettingsDocument>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

async fn put_system_config_partition(
    State(state): State<AppState>,
    Path(partition): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    match partition.as_str() {
        "routing" => {
            document.system_config.routing = serde_json::from_value::<RoutingConfig>(value)
                .map_err(|e| error_response(HubError::from(e)))?;
        }
        "install" => {
            document.system_config.install = serde_json::from_value::<InstallConfig>(value)
                .map_err(|e| error_response(HubError::from(e)))?;
        }
        "smart-routing" => {
            document.system_config.smart_routing =
                serde_json::from_value::<SmartRoutingConfig>(value)
                    .map_err(|e| error_response(HubError::from(e)))?;
        }
        "mcp-router" => {
            document.system_config.mcp_router = serde_json::from_value::<McpRouterConfig>(value)
                .map_err(|e| error_response(HubError::from(e)))?;
        }
        other => {
            return Err(error_response(HubError::Config(format!(
                "unknown system-config partition: {other}"
            ))))
        }
    }
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct CallToolBody {
    tool: String,
    #[serde(default)]
    args: serde_json::Map<String, serde_json::Value>,
}

async fn call_tool(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Json(body): Json<CallToolBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let document = state.store.load().await;
    let result = state
        .dispatcher
        .call_tool(
            &crate::registry::Scope::Server(server),
            &AuthContext::Unrestricted,
            &document,
            &body.tool,
            body.args,
            RequestOptions::default(),
        )
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

async fn health(State(state): State<AppState>) -> StatusCode {
    if state.pool.connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct TokenBody {
    token: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<TokenBody>, (StatusCode, Json<ErrorBody>)> {
    let document = state.store.load().await;
    let user = document
        .users
        .iter()
        .find(|u| u.username == body.username)
        .ok_or_else(|| error_response(HubError::Unauthorized("invalid credentials".to_string())))?;
    if !auth::verify_password(&body.password, &user.password_bcrypt) {
        return Err(error_response(HubError::Unauthorized(
            "invalid credentials".to_string(),
        )));
    }
    let token = auth::issue_jwt(&state.jwt_secret, &user.username, user.is_admin)
        .map_err(error_response)?;
    Ok(Json(TokenBody { token }))
}

#[derive(Deserialize)]
struct RegisterBody {
    username: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    if document.users.iter().any(|u| u.username == body.username) {
        return Err(error_response(HubError::Config(format!(
            "user {} already exists",
            body.username
        ))));
    }
    let password_bcrypt = auth::hash_password(&body.password).map_err(error_response)?;
    document.users.push(UserAccount {
        username: body.username.clone(),
        password_bcrypt,
        is_admin: false,
    });
    document
        .user_configs
        .insert(body.username, UserConfig::default());
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::CREATED)
}

#[derive(Serialize)]
struct MeBody {
    username: String,
    is_admin: bool,
}

async fn me(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<MeBody>, (StatusCode, Json<ErrorBody>)> {
    let document = state.store.load().await;
    let claims = headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| error_response(HubError::Unauthorized("no token presented".to_string())))
        .and_then(|token| {
            auth::verify_jwt(&state.jwt_secret, token)
                .map_err(|_| error_response(HubError::Unauthorized("invalid token".to_string())))
        })?;
    let is_admin = document
        .users
        .iter()
        .find(|u| u.username == claims.sub)
        .map(|u| u.is_admin)
        .unwrap_or(claims.is_admin);
    Ok(Json(MeBody {
        username: claims.sub,
        is_admin,
    }))
}

#[derive(Deserialize)]
struct PasswordChangeBody {
    username: String,
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Json(body): Json<PasswordChangeBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut document = (*state.store.load().await).clone();
    let user = document
        .users
        .iter_mut()
        .find(|u| u.username == body.username)
        .ok_or_else(|| error_response(HubError::Unauthorized("invalid credentials".to_string())))?;
    if !auth::verify_password(&body.current_password, &user.password_bcrypt) {
        return Err(error_response(HubError::Unauthorized(
            "invalid credentials".to_string(),
        )));
    }
    user.password_bcrypt = auth::hash_password(&body.new_password).map_err(error_response)?;
    state
        .store
        .save(document, None)
        .await
        .map_err(|e| error_response(HubError::from(e)))?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        dispatcher::Dispatcher, ingress::AppState, metrics::HubMetrics, pool::ConnectorPool,
        session::SessionRegistry, settings::SettingsStore,
    };

    async fn test_state() -> AppState {
        let pool = ConnectorPool::new(std::time::Duration::from_secs(5));
        AppState {
            store: Arc::new(SettingsStore::new(
                tempfile::tempdir().unwrap().path().join("mcp_settings.json"),
            )),
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&pool), None)),
            pool,
            sessions: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(HubMetrics::new()),
            jwt_secret: "test-secret".to_string(),
            readonly: false,
        }
    }

    fn stdio_config(command: &str) -> ServerConfig {
        ServerConfig {
            kind: crate::settings::ServerKind::Stdio,
            enabled: true,
            owner: None,
            keep_alive_interval_secs: None,
            options: Default::default(),
            tools: Default::default(),
            command: Some(command.to_string()),
            args: vec![],
            env: Default::default(),
            url: None,
            headers: Default::default(),
            openapi: None,
        }
    }

    #[tokio::test]
    async fn create_path_rejects_a_colliding_name() {
        let state = test_state().await;
        save_server(&state, "time".to_string(), stdio_config("time-server"), true)
            .await
            .unwrap();

        let err = save_server(&state, "time".to_string(), stdio_config("other"), true)
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
        assert_eq!(err.1.kind, "config");

        let document = state.store.load().await;
        assert_eq!(
            document.mcp_servers["time"].command.as_deref(),
            Some("time-server")
        );
    }

    #[tokio::test]
    async fn put_by_name_path_allows_updating_an_existing_server() {
        let state = test_state().await;
        save_server(&state, "time".to_string(), stdio_config("time-server"), true)
            .await
            .unwrap();

        save_server(&state, "time".to_string(), stdio_config("time-server-v2"), false)
            .await
            .unwrap();

        let document = state.store.load().await;
        assert_eq!(
            document.mcp_servers["time"].command.as_deref(),
            Some("time-server-v2")
        );
    }
}

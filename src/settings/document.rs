//! On-disk shape of the settings document (§6 of the design).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The single JSON document persisted at `MCPHUB_SETTING_PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub users: Vec<UserAccount>,
    #[serde(default, rename = "systemConfig")]
    pub system_config: SystemConfig,
    #[serde(default, rename = "userConfigs")]
    pub user_configs: HashMap<String, UserConfig>,
}

impl SettingsDocument {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One upstream server's static configuration. Exactly one of
/// `stdio`/`sse`/`streamable_http`/`openapi` is populated, matching `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "type")]
    pub kind: ServerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, rename = "keepAliveInterval")]
    pub keep_alive_interval_secs: Option<u64>,
    #[serde(default)]
    pub options: ConnectorOptions,
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,

    // stdio
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    // sse / streamable-http
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    // openapi
    #[serde(default)]
    pub openapi: Option<OpenApiConfig>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Invariant check: exactly one kind-specific payload is populated.
    pub fn validate(&self) -> Result<(), String> {
        match self.kind {
            ServerKind::Stdio => {
                if self.command.is_none() {
                    return Err("stdio server requires `command`".into());
                }
            }
            ServerKind::Sse | ServerKind::StreamableHttp => {
                if self.url.is_none() {
                    return Err(format!("{:?} server requires `url`", self.kind));
                }
            }
            ServerKind::Openapi => {
                if self.openapi.is_none() {
                    return Err("openapi server requires `openapi`".into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
    Stdio,
    Sse,
    StreamableHttp,
    Openapi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorOptions {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default, rename = "maxTotalTimeout")]
    pub max_total_timeout_secs: Option<u64>,
    #[serde(default, rename = "resetTimeoutOnProgress")]
    pub reset_timeout_on_progress: bool,
    #[serde(default, rename = "openapiResynthInterval")]
    pub openapi_resynth_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    #[serde(default)]
    pub security: Option<OpenApiSecurity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiSecurity {
    #[serde(rename = "type")]
    pub kind: SecurityKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "in")]
    pub location: Option<SecurityLocation>,
    #[serde(default)]
    pub creds: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityKind {
    None,
    ApiKey,
    Http,
    Oauth2,
    OpenIdConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLocation {
    Header,
    Query,
    Cookie,
}

/// A named collection of server memberships with per-server tool filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

fn default_owner() -> String {
    "admin".to_string()
}

/// Either a bare server name (all tools) or a `{name, tools}` restriction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupMember {
    Bare(String),
    Scoped { name: String, tools: ToolSelector },
}

impl GroupMember {
    pub fn server_name(&self) -> &str {
        match self {
            GroupMember::Bare(name) => name,
            GroupMember::Scoped { name, .. } => name,
        }
    }

    pub fn admits(&self, tool_name: &str) -> bool {
        match self {
            GroupMember::Bare(_) => true,
            GroupMember::Scoped { tools, .. } => tools.admits(tool_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolSelector {
    All(AllMarker),
    List(Vec<String>),
}

/// Matches the literal string `"all"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AllMarker;

impl TryFrom<String> for AllMarker {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "all" {
            Ok(AllMarker)
        } else {
            Err(format!("expected \"all\", got {value:?}"))
        }
    }
}

impl From<AllMarker> for String {
    fn from(_: AllMarker) -> Self {
        "all".to_string()
    }
}

impl ToolSelector {
    pub fn admits(&self, tool_name: &str) -> bool {
        match self {
            ToolSelector::All(_) => true,
            ToolSelector::List(names) => names.iter().any(|n| n == tool_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    #[serde(rename = "password-bcrypt")]
    pub password_bcrypt: String,
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default, rename = "smartRouting")]
    pub smart_routing: SmartRoutingConfig,
    #[serde(default, rename = "mcpRouter")]
    pub mcp_router: McpRouterConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default, rename = "enableGlobalRoute")]
    pub enable_global_route: bool,
    #[serde(default, rename = "enableGroupNameRoute")]
    pub enable_group_name_route: bool,
    #[serde(default, rename = "enableBearerAuth")]
    pub enable_bearer_auth: bool,
    #[serde(default, rename = "bearerAuthKey")]
    pub bearer_auth_key: Option<String>,
    #[serde(default, rename = "skipAuth")]
    pub skip_auth: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default, rename = "pythonIndexUrl")]
    pub python_index_url: Option<String>,
    #[serde(default, rename = "npmRegistry")]
    pub npm_registry: Option<String>,
    #[serde(default, rename = "baseUrl")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartRoutingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "dbUrl")]
    pub db_url: Option<String>,
    #[serde(default, rename = "openaiApiBaseUrl")]
    pub openai_api_base_url: Option<String>,
    #[serde(default, rename = "openaiApiKey")]
    pub openai_api_key: Option<String>,
    #[serde(default, rename = "openaiApiEmbeddingModel")]
    pub openai_api_embedding_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpRouterConfig {
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "baseUrl")]
    pub base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_member_bare_admits_everything() {
        let m = GroupMember::Bare("time".into());
        assert!(m.admits("anything"));
        assert_eq!(m.server_name(), "time");
    }

    #[test]
    fn group_member_scoped_list_restricts() {
        let m = GroupMember::Scoped {
            name: "brave".into(),
            tools: ToolSelector::List(vec!["web_search".into()]),
        };
        assert!(m.admits("web_search"));
        assert!(!m.admits("other"));
    }

    #[test]
    fn tool_selector_all_deserializes_from_string() {
        let sel: ToolSelector = serde_json::from_str("\"all\"").unwrap();
        assert!(sel.admits("whatever"));
    }

    #[test]
    fn server_config_validate_requires_matching_payload() {
        let cfg = ServerConfig {
            kind: ServerKind::Stdio,
            enabled: true,
            owner: None,
            keep_alive_interval_secs: None,
            options: ConnectorOptions::default(),
            tools: HashMap::new(),
            command: None,
            args: vec![],
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            openapi: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settings_document_round_trips_through_json() {
        let doc = SettingsDocument::empty();
        let text = serde_json::to_string(&doc).unwrap();
        let back: SettingsDocument = serde_json::from_str(&text).unwrap();
        assert!(back.mcp_servers.is_empty());
    }
}

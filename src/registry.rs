//! Tool registry (C4): a materialized, scope-filtered view over the
//! connector pool's merged `(server, tool)` list, with name-collision
//! qualification and reverse name resolution.

use std::{collections::HashMap, sync::Arc};

use crate::{
    connector::ToolInfo,
    pool::ConnectorPool,
    settings::{Group, SettingsDocument, UserConfig},
};

/// Which slice of the aggregate a downstream session is bound to (§4.4).
/// `Smart` scope defers its tool *search* to C5 but still resolves calls
/// through the same registry, so it carries the same group-membership rule
/// as an implicit "view everything this requester can see."
#[derive(Debug, Clone)]
pub enum Scope {
    Global,
    Group(String),
    Server(String),
    Smart,
}

/// Caller identity used for per-user filtering (§4.4). Admin and
/// bearer/skip-auth requests pass `Unrestricted`; everything else carries a
/// username resolved against `SettingsDocument.user_configs`.
#[derive(Debug, Clone)]
pub enum AuthContext {
    Unrestricted,
    User(String),
}

/// One entry in a resolved view: the name a client sees may differ from the
/// tool's bare name when it collides with another server's tool of the same
/// name (§4.4).
#[derive(Debug, Clone)]
pub struct ExposedTool {
    pub exposed_name: String,
    pub server: String,
    pub tool_name: String,
    pub info: ToolInfo,
}

/// Either the view holds nothing by this bare/qualified name, it binds
/// unambiguously to one server, or more than one server's tool shares the
/// bare name within this view (§4.4 "Resolution at call time").
pub enum Resolution {
    NotFound,
    Bound(ExposedTool),
    Ambiguous(Vec<ExposedTool>),
}

pub struct ToolRegistry {
    pool: Arc<ConnectorPool>,
}

impl ToolRegistry {
    pub fn new(pool: Arc<ConnectorPool>) -> Self {
        Self { pool }
    }

    /// Builds the exposed tool list for `scope`, after per-user filtering
    /// and name-collision qualification.
    pub async fn view(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
    ) -> Vec<ExposedTool> {
        let raw = self.visible_tools(scope, document).await;
        let filtered = filter_by_user(raw, auth, document);
        qualify(filtered)
    }

    /// Resolves a name (bare or `{server}/{tool}`) against the view for
    /// `scope` (§4.4 reverse resolution, grounded in the teacher's
    /// `call_tool_by_name` 0/1/many tie-break).
    pub async fn resolve(
        &self,
        name: &str,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
    ) -> Resolution {
        let view = self.view(scope, auth, document).await;

        if let Some((server, tool)) = name.split_once('/') {
            if let Some(exact) = view
                .iter()
                .find(|t| t.server == server && t.tool_name == tool)
            {
                return Resolution::Bound(exact.clone());
            }
        }

        let matches: Vec<ExposedTool> = view
            .iter()
            .filter(|t| t.exposed_name == name || t.tool_name == name)
            .cloned()
            .collect();

        match matches.len() {
            0 => Resolution::NotFound,
            1 => Resolution::Bound(matches.into_iter().next().unwrap()),
            _ => Resolution::Ambiguous(matches),
        }
    }

    async fn visible_tools(&self, scope: &Scope, document: &SettingsDocument) -> Vec<ExposedTool> {
        let mut out = Vec::new();
        for connector in self.pool.list() {
            if !connector.is_enabled() || !connector.is_connected() {
                continue;
            }
            if let Scope::Server(name) = scope {
                if &connector.name != name {
                    continue;
                }
            }
            for info in connector.list_tools().await {
                if !info.enabled {
                    continue;
                }
                if !admits(scope, document, &connector.name, &info.name) {
                    continue;
                }
                out.push(ExposedTool {
                    exposed_name: info.name.clone(),
                    server: connector.name.clone(),
                    tool_name: info.name.clone(),
                    info,
                });
            }
        }
        out
    }
}

fn admits(scope: &Scope, document: &SettingsDocument, server: &str, tool: &str) -> bool {
    match scope {
        Scope::Global | Scope::Smart => true,
        Scope::Server(_) => true,
        Scope::Group(group_id) => document
            .groups
            .iter()
            .find(|g| &g.id == group_id)
            .map(|group| group_admits(group, server, tool))
            .unwrap_or(false),
    }
}

fn group_admits(group: &Group, server: &str, tool: &str) -> bool {
    group
        .members
        .iter()
        .any(|m| m.server_name() == server && m.admits(tool))
}

/// Intersects the view with the union of the caller's allowed groups, unless
/// the caller is unrestricted (admin, bearer-auth, or skip-auth) (§4.4).
fn filter_by_user(
    tools: Vec<ExposedTool>,
    auth: &AuthContext,
    document: &SettingsDocument,
) -> Vec<ExposedTool> {
    let AuthContext::User(username) = auth else {
        return tools;
    };
    let Some(user) = document.users.iter().find(|u| &u.username == username) else {
        return tools;
    };
    if user.is_admin {
        return tools;
    }
    let Some(UserConfig { groups }) = document.user_configs.get(username) else {
        return Vec::new();
    };
    let allowed_groups: Vec<&Group> = document
        .groups
        .iter()
        .filter(|g| groups.contains(&g.id) || groups.contains(&g.name))
        .collect();

    tools
        .into_iter()
        .filter(|t| {
            allowed_groups
                .iter()
                .any(|g| group_admits(g, &t.server, &t.tool_name))
        })
        .collect()
}

/// Bare name unless it collides with another server's tool of the same
/// name, in which case both become `{server}/{tool}` (§4.4).
fn qualify(tools: Vec<ExposedTool>) -> Vec<ExposedTool> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for t in &tools {
        *counts.entry(t.tool_name.as_str()).or_insert(0) += 1;
    }
    tools
        .into_iter()
        .map(|mut t| {
            if counts.get(t.tool_name.as_str()).copied().unwrap_or(0) > 1 {
                t.exposed_name = format!("{}/{}", t.server, t.tool_name);
            }
            t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{GroupMember, ToolSelector};

    fn tool(server: &str, name: &str) -> ExposedTool {
        ExposedTool {
            exposed_name: name.to_string(),
            server: server.to_string(),
            tool_name: name.to_string(),
            info: ToolInfo {
                server: server.to_string(),
                name: name.to_string(),
                description: String::new(),
                input_schema: serde_json::Map::new(),
                enabled: true,
            },
        }
    }

    #[test]
    fn qualify_leaves_unique_names_bare() {
        let tools = vec![tool("a", "search"), tool("b", "fetch")];
        let qualified = qualify(tools);
        assert_eq!(qualified[0].exposed_name, "search");
        assert_eq!(qualified[1].exposed_name, "fetch");
    }

    #[test]
    fn qualify_disambiguates_name_collisions() {
        let tools = vec![tool("a", "search"), tool("b", "search")];
        let qualified = qualify(tools);
        assert_eq!(qualified[0].exposed_name, "a/search");
        assert_eq!(qualified[1].exposed_name, "b/search");
    }

    #[test]
    fn group_all_marker_admits_every_tool() {
        let group = Group {
            id: "g1".to_string(),
            name: "g1".to_string(),
            owner: "root".to_string(),
            members: vec![GroupMember::Bare("srv".to_string())],
        };
        assert!(group_admits(&group, "srv", "anything"));
    }

    #[test]
    fn group_scoped_list_restricts_tools() {
        let group = Group {
            id: "g1".to_string(),
            name: "g1".to_string(),
            owner: "root".to_string(),
            members: vec![GroupMember::Scoped {
                name: "srv".to_string(),
                tools: ToolSelector::List(vec!["search".to_string()]),
            }],
        };
        assert!(group_admits(&group, "srv", "search"));
        assert!(!group_admits(&group, "srv", "delete"));
    }
}

//! Dispatcher (C6): the single entry point downstream sessions call through.
//! Resolves scope + name against the registry, enforces request deadlines,
//! and falls back to raw pass-through for single-server views.

use std::time::Duration;

use rmcp::model::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};
use serde_json::Map;

use crate::{
    connector::{EffectiveDeadline, ToolInfo},
    error::{HubError, HubResult},
    pool::ConnectorPool,
    registry::{AuthContext, Resolution, Scope, ToolRegistry},
    settings::{ConnectorOptions, SettingsDocument},
    smart_index::SmartIndex,
};

/// Per-call deadline knobs (§4.6, `ConnectorOptions` defaults: 60s/none/false).
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub max_total_timeout: Option<Duration>,
    pub reset_timeout_on_progress: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_total_timeout: None,
            reset_timeout_on_progress: false,
        }
    }
}

/// Merges session-level `options` with the target connector's own
/// `options` (§4.6, §5, testable property 4): the effective timeout is the
/// minimum of the two, `maxTotalTimeout` comes from whichever side sets it
/// (the connector's takes precedence when both do, since it is the more
/// specific configuration), and `resetTimeoutOnProgress` is honored if
/// either side asks for it.
fn effective_deadline(options: &RequestOptions, connector: &ConnectorOptions) -> EffectiveDeadline {
    let connector_timeout = connector.timeout_secs.map(Duration::from_secs);
    let timeout = match connector_timeout {
        Some(t) => options.timeout.min(t),
        None => options.timeout,
    };
    let max_total_timeout = connector
        .max_total_timeout_secs
        .map(Duration::from_secs)
        .or(options.max_total_timeout);
    let reset_on_progress = options.reset_timeout_on_progress || connector.reset_timeout_on_progress;

    EffectiveDeadline {
        timeout,
        max_total_timeout,
        reset_on_progress,
    }
}

/// `smartCall`'s decision: either the top hit cleared threshold+margin and
/// was called directly, or the ranked list is returned for the client to
/// choose from (§4.6).
pub enum SmartCallOutcome {
    Called(CallToolResult),
    Ranked(Vec<crate::smart_index::SearchHit>),
}

pub struct Dispatcher {
    pool: std::sync::Arc<ConnectorPool>,
    registry: ToolRegistry,
    smart_index: Option<std::sync::Arc<SmartIndex>>,
    /// Minimum score gap between the top hit and the runner-up for
    /// `smartCall` to auto-invoke rather than return a ranked list.
    smart_call_margin: f32,
}

impl Dispatcher {
    pub fn new(
        pool: std::sync::Arc<ConnectorPool>,
        smart_index: Option<std::sync::Arc<SmartIndex>>,
    ) -> Self {
        Self {
            registry: ToolRegistry::new(std::sync::Arc::clone(&pool)),
            pool,
            smart_index,
            smart_call_margin: 0.05,
        }
    }

    pub async fn list_tools(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
    ) -> Vec<Tool> {
        self.registry
            .view(scope, auth, document)
            .await
            .into_iter()
            .map(|t| to_rmcp_tool(&t.exposed_name, &t.info))
            .collect()
    }

    pub async fn list_prompts(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
    ) -> HubResult<Vec<Prompt>> {
        let mut out = Vec::new();
        for connector in self.connectors_in_scope(scope, auth, document).await {
            out.extend(connector.list_prompts().await?);
        }
        Ok(out)
    }

    pub async fn list_resources(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
    ) -> HubResult<Vec<Resource>> {
        let mut out = Vec::new();
        for connector in self.connectors_in_scope(scope, auth, document).await {
            out.extend(connector.list_resources().await?);
        }
        Ok(out)
    }

    /// Resolves `name` in `scope`, then forwards to that connector with the
    /// given request options. Ambiguity is an error, never a silent pick
    /// (§4.6).
    pub async fn call_tool(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
        name: &str,
        args: Map<String, serde_json::Value>,
        options: RequestOptions,
    ) -> HubResult<CallToolResult> {
        let resolution = self.registry.resolve(name, scope, auth, document).await;
        let target = match resolution {
            Resolution::NotFound => return Err(HubError::ToolNotFound(name.to_string())),
            Resolution::Ambiguous(_) => return Err(HubError::ambiguous()),
            Resolution::Bound(tool) => tool,
        };
        let connector = self
            .pool
            .get(&target.server)
            .ok_or_else(|| HubError::ServerNotFound(target.server.clone()))?;

        let deadline = effective_deadline(&options, &connector.config_snapshot().options);
        connector.call_tool(&target.tool_name, args, deadline).await
    }

    /// `search` then either call the clear winner directly or return the
    /// ranked list for the client to choose from (§4.6).
    pub async fn smart_call(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
        query: &str,
        args: Map<String, serde_json::Value>,
        k: usize,
        threshold: f32,
        options: RequestOptions,
    ) -> HubResult<SmartCallOutcome> {
        let Some(index) = &self.smart_index else {
            return Err(HubError::Config(
                "smart routing is not enabled in system config".to_string(),
            ));
        };

        let document = document.clone();
        let scope = scope.clone();
        let auth = auth.clone();
        let registry = &self.registry;
        let allowed: std::collections::HashSet<(String, String)> = registry
            .view(&scope, &auth, &document)
            .await
            .into_iter()
            .map(|t| (t.server, t.tool_name))
            .collect();

        let hits = index
            .search(query, k, threshold, |server, tool| {
                allowed.contains(&(server.to_string(), tool.to_string()))
            })
            .await?;

        let clear_winner = match hits.as_slice() {
            [first, rest @ ..] => rest
                .first()
                .map(|second| first.score - second.score >= self.smart_call_margin)
                .unwrap_or(true)
                .then_some(first.clone()),
            [] => None,
        };

        if let Some(winner) = clear_winner {
            let connector = self
                .pool
                .get(&winner.server)
                .ok_or_else(|| HubError::ServerNotFound(winner.server.clone()))?;
            let deadline = effective_deadline(&options, &connector.config_snapshot().options);
            let result = connector
                .call_tool(&winner.tool_name, args, deadline)
                .await?;
            return Ok(SmartCallOutcome::Called(result));
        }

        Ok(SmartCallOutcome::Ranked(hits))
    }

    /// §6 pass-through rule: arbitrary methods only make sense against a
    /// single-server view; anything else is `method-not-found`.
    pub async fn get_prompt_passthrough(
        &self,
        scope: &Scope,
        name: &str,
        args: Option<Map<String, serde_json::Value>>,
    ) -> HubResult<GetPromptResult> {
        let connector = self.single_server_connector(scope)?;
        connector.get_prompt(name, args).await
    }

    pub async fn read_resource_passthrough(
        &self,
        scope: &Scope,
        uri: &str,
    ) -> HubResult<ReadResourceResult> {
        let connector = self.single_server_connector(scope)?;
        connector.read_resource(uri).await
    }

    fn single_server_connector(&self, scope: &Scope) -> HubResult<std::sync::Arc<crate::connector::Connector>> {
        let Scope::Server(name) = scope else {
            return Err(HubError::NotFound("method-not-found".to_string()));
        };
        self.pool
            .get(name)
            .ok_or_else(|| HubError::ServerNotFound(name.clone()))
    }

    async fn connectors_in_scope(
        &self,
        scope: &Scope,
        auth: &AuthContext,
        document: &SettingsDocument,
    ) -> Vec<std::sync::Arc<crate::connector::Connector>> {
        let servers: std::collections::HashSet<String> = self
            .registry
            .view(scope, auth, document)
            .await
            .into_iter()
            .map(|t| t.server)
            .collect();
        self.pool
            .list()
            .into_iter()
            .filter(|c| servers.contains(&c.name))
            .collect()
    }
}

fn to_rmcp_tool(exposed_name: &str, info: &ToolInfo) -> Tool {
    Tool {
        name: std::borrow::Cow::Owned(exposed_name.to_string()),
        title: None,
        description: Some(std::borrow::Cow::Owned(info.description.clone())),
        input_schema: std::sync::Arc::new(info.input_schema.clone()),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_options_default_matches_spec() {
        let options = RequestOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert!(options.max_total_timeout.is_none());
        assert!(!options.reset_timeout_on_progress);
    }

    #[test]
    fn effective_deadline_takes_the_shorter_timeout() {
        let options = RequestOptions::default();
        let connector = ConnectorOptions {
            timeout_secs: Some(5),
            ..Default::default()
        };
        let deadline = effective_deadline(&options, &connector);
        assert_eq!(deadline.timeout, Duration::from_secs(5));
    }

    #[test]
    fn effective_deadline_ignores_a_longer_connector_timeout() {
        let options = RequestOptions {
            timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let connector = ConnectorOptions {
            timeout_secs: Some(120),
            ..Default::default()
        };
        let deadline = effective_deadline(&options, &connector);
        assert_eq!(deadline.timeout, Duration::from_secs(10));
    }

    #[test]
    fn effective_deadline_picks_up_connector_max_total_and_reset_flag() {
        let options = RequestOptions::default();
        let connector = ConnectorOptions {
            max_total_timeout_secs: Some(300),
            reset_timeout_on_progress: true,
            ..Default::default()
        };
        let deadline = effective_deadline(&options, &connector);
        assert_eq!(deadline.max_total_timeout, Some(Duration::from_secs(300)));
        assert!(deadline.reset_on_progress);
    }
}

//! OpenAPI connector kind (§4.2.1-4.2.4): synthesizes one MCP tool per
//! operation in a dereferenced OpenAPI document, translates tool calls into
//! plain HTTP requests, and periodically re-fetches url-based documents.
//! There is no persistent transport: every call is a one-shot HTTP request.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use openapiv3::{
    OpenAPI, Operation, Parameter, ParameterSchemaOrContent, ReferenceOr, Schema,
};
use parking_lot::RwLock;
use rmcp::model::{CallToolResult, Content};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    error::{HubError, HubResult},
    settings::{OpenApiConfig, SecurityKind, SecurityLocation, ServerConfig},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Trace => reqwest::Method::TRACE,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
            Method::Put => "put",
            Method::Delete => "delete",
            Method::Patch => "patch",
            Method::Head => "head",
            Method::Options => "options",
            Method::Trace => "trace",
        }
    }

    /// JSON bodies are only meaningful for the write verbs (§4.2.2).
    fn accepts_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

/// One path+method bound to its synthesized tool name, kept so `call()` can
/// rebuild the HTTP request without re-parsing the document.
#[derive(Clone)]
struct OperationBinding {
    path: String,
    method: Method,
    path_params: Vec<String>,
    query_params: Vec<String>,
    header_params: Vec<String>,
}

/// Resolved, env-expanded security applied to every outgoing request.
/// `SecurityKind::Http`/`Oauth2`/`OpenIdConnect` all resolve to a bearer
/// token: the settings schema carries no explicit `http` sub-scheme, so a
/// bearer default was chosen over guessing Basic from credential shape
/// (recorded as an Open Question resolution in the design notes).
#[derive(Clone)]
struct ResolvedSecurity {
    kind: SecurityKind,
    name: Option<String>,
    location: Option<SecurityLocation>,
    value: String,
}

pub struct OpenApiAdapter {
    server: String,
    base_url: reqwest::Url,
    client: reqwest::Client,
    security: Option<ResolvedSecurity>,
    source: Source,
    resynth_interval: Duration,
    tools: RwLock<Vec<rmcp::model::Tool>>,
    operations: RwLock<HashMap<String, OperationBinding>>,
    last_synth: RwLock<DateTime<Utc>>,
    last_hash: RwLock<Option<String>>,
}

enum Source {
    Url(String),
    Inline,
}

impl OpenApiAdapter {
    pub async fn build(server: &str, config: &ServerConfig) -> HubResult<Self> {
        let openapi_config = config.openapi.as_ref().ok_or_else(|| {
            HubError::Config("openapi server requires an `openapi` block".to_string())
        })?;

        let (text, source) = fetch_document(openapi_config).await?;
        let document = parse_document(&text)?;
        let base_url = effective_base_url(&document, openapi_config)?;
        let security = resolve_security(openapi_config);

        let resynth_interval = Duration::from_secs(
            config
                .options
                .openapi_resynth_interval_secs
                .unwrap_or(900),
        );

        let adapter = Self {
            server: server.to_string(),
            base_url,
            client: reqwest::Client::new(),
            security,
            source,
            resynth_interval,
            tools: RwLock::new(Vec::new()),
            operations: RwLock::new(HashMap::new()),
            last_synth: RwLock::new(Utc::now()),
            last_hash: RwLock::new(None),
        };
        adapter.apply_synthesis(&document, text_hash(&text));
        Ok(adapter)
    }

    /// Raw tool list for `connect_kind()` to run through the shared
    /// per-tool-override pass, same as every other connector kind.
    pub fn synthesized_tools(&self) -> Vec<rmcp::model::Tool> {
        self.tools.read().clone()
    }

    /// Re-fetches and re-synthesizes if this is a `url`-based document past
    /// its TTL; inline-`schema` connectors never drift, so this is a no-op
    /// for them. A fetch/parse failure logs a warning and leaves the
    /// previous tool list in place (§4.2.4) — openapi connectors have no
    /// transport to tear down, so there is nothing to disconnect.
    pub async fn maybe_resynthesize(&self) -> Option<Vec<rmcp::model::Tool>> {
        let Source::Url(url) = &self.source else {
            return None;
        };
        let due = Utc::now() - *self.last_synth.read() >= chrono::Duration::from_std(self.resynth_interval).ok()?;
        if !due {
            return None;
        }
        let config = OpenApiConfig {
            url: Some(url.clone()),
            schema: None,
            security: None,
        };
        match fetch_document(&config).await {
            Ok((text, _)) => match parse_document(&text) {
                Ok(document) => {
                    let hash = text_hash(&text);
                    if self.last_hash.read().as_deref() == Some(hash.as_str()) {
                        *self.last_synth.write() = Utc::now();
                        return None;
                    }
                    self.apply_synthesis(&document, hash);
                    Some(self.tools.read().clone())
                }
                Err(e) => {
                    warn!(server = %self.server, error = %e, "openapi re-synthesis: parse failed, keeping previous tools");
                    None
                }
            },
            Err(e) => {
                warn!(server = %self.server, error = %e, "openapi re-synthesis: fetch failed, keeping previous tools");
                None
            }
        }
    }

    fn apply_synthesis(&self, document: &OpenAPI, hash: String) {
        let (tools, operations) = synthesize(document);
        *self.tools.write() = tools;
        *self.operations.write() = operations;
        *self.last_synth.write() = Utc::now();
        *self.last_hash.write() = Some(hash);
    }

    pub async fn call(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> HubResult<CallToolResult> {
        let binding = self
            .operations
            .read()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| HubError::ToolNotFound(tool_name.to_string()))?;

        let mut path = binding.path.clone();
        for name in &binding.path_params {
            let value = args
                .get(name)
                .map(value_to_path_segment)
                .unwrap_or_default();
            path = path.replace(&format!("{{{name}}}"), &value);
        }
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| HubError::Schema {
                server: self.server.clone(),
                message: format!("invalid path template {path}: {e}"),
            })?;

        let mut request = self.client.request(binding.method.as_reqwest(), url);
        for name in &binding.query_params {
            if let Some(value) = args.get(name) {
                request = request.query(&[(name.as_str(), value_to_path_segment(value))]);
            }
        }
        for name in &binding.header_params {
            if let Some(value) = args.get(name) {
                request = request.header(name.as_str(), value_to_path_segment(value));
            }
        }
        if binding.method.accepts_body() {
            if let Some(body) = args.get("body") {
                request = request.json(body);
            }
        }
        request = apply_security(request, &self.security);

        let response = request.send().await.map_err(|e| HubError::Upstream {
            server: self.server.clone(),
            message: format!("{} {}: {e}", binding.method.as_str(), binding.path),
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(HubError::Upstream {
                server: self.server.clone(),
                message: format!(
                    "{} {} - {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or(""),
                    body
                ),
            });
        }

        Ok(CallToolResult::success(vec![Content::text(body)]))
    }
}

fn value_to_path_segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{digest:x}")
}

async fn fetch_document(config: &OpenApiConfig) -> HubResult<(String, Source)> {
    if let Some(schema) = &config.schema {
        return Ok((
            serde_json::to_string(schema).map_err(HubError::from)?,
            Source::Inline,
        ));
    }
    let url = config
        .url
        .as_ref()
        .ok_or_else(|| HubError::Config("openapi block requires `url` or `schema`".to_string()))?;
    let text = reqwest::get(url)
        .await
        .map_err(HubError::from)?
        .text()
        .await
        .map_err(HubError::from)?;
    Ok((text, Source::Url(url.clone())))
}

fn parse_document(text: &str) -> HubResult<OpenAPI> {
    serde_json::from_str(text)
        .or_else(|_| serde_yaml::from_str(text))
        .map_err(|e| HubError::Schema {
            server: String::new(),
            message: format!("invalid openapi document: {e}"),
        })
}

fn effective_base_url(document: &OpenAPI, config: &OpenApiConfig) -> HubResult<reqwest::Url> {
    if let Some(server) = document.servers.first() {
        if let Ok(url) = reqwest::Url::parse(&server.url) {
            return Ok(url);
        }
    }
    let spec_url = config
        .url
        .as_ref()
        .ok_or_else(|| HubError::Config("cannot derive a base url for an inline openapi schema without servers[]".to_string()))?;
    reqwest::Url::parse(spec_url).map_err(|e| HubError::Config(format!("invalid openapi url: {e}")))
}

fn resolve_security(config: &OpenApiConfig) -> Option<ResolvedSecurity> {
    let security = config.security.as_ref()?;
    let value = match security.kind {
        SecurityKind::None => return None,
        SecurityKind::ApiKey => security.creds.clone()?,
        SecurityKind::Http | SecurityKind::Oauth2 | SecurityKind::OpenIdConnect => security
            .token
            .clone()
            .or_else(|| security.creds.clone())?,
    };
    Some(ResolvedSecurity {
        kind: security.kind,
        name: security.name.clone(),
        location: security.location,
        value,
    })
}

fn apply_security(
    request: reqwest::RequestBuilder,
    security: &Option<ResolvedSecurity>,
) -> reqwest::RequestBuilder {
    let Some(security) = security else {
        return request;
    };
    match security.kind {
        SecurityKind::None => request,
        SecurityKind::ApiKey => {
            let name = security.name.clone().unwrap_or_else(|| "X-API-Key".to_string());
            match security.location.unwrap_or(SecurityLocation::Header) {
                SecurityLocation::Header => request.header(name, &security.value),
                SecurityLocation::Query => request.query(&[(name, security.value.clone())]),
                SecurityLocation::Cookie => {
                    request.header(reqwest::header::COOKIE, format!("{name}={}", security.value))
                }
            }
        }
        SecurityKind::Http | SecurityKind::Oauth2 | SecurityKind::OpenIdConnect => {
            request.bearer_auth(&security.value)
        }
    }
}

/// Builds the `{name -> tool}` and `{name -> binding}` maps for every
/// `(path, method)` pair in the document (§4.2.1).
fn synthesize(document: &OpenAPI) -> (Vec<rmcp::model::Tool>, HashMap<String, OperationBinding>) {
    let mut tools = Vec::new();
    let mut operations = HashMap::new();
    let mut used_names: HashSet<String> = HashSet::new();

    for (path, item) in &document.paths.paths {
        let Some(item) = item.as_item() else { continue };
        let entries: [(Method, &Option<Operation>); 7] = [
            (Method::Get, &item.get),
            (Method::Post, &item.post),
            (Method::Put, &item.put),
            (Method::Delete, &item.delete),
            (Method::Patch, &item.patch),
            (Method::Head, &item.head),
            (Method::Options, &item.options),
        ];
        for (method, operation) in entries {
            let Some(operation) = operation else { continue };
            let name = unique_name(operation, method, path, &mut used_names);
            let (schema, path_params, query_params, header_params) =
                build_input_schema(document, item, operation);

            tools.push(rmcp::model::Tool {
                name: std::borrow::Cow::Owned(name.clone()),
                title: None,
                description: operation
                    .description
                    .clone()
                    .or_else(|| operation.summary.clone())
                    .map(std::borrow::Cow::Owned),
                input_schema: std::sync::Arc::new(schema),
                output_schema: None,
                annotations: None,
                icons: None,
            });
            operations.insert(
                name,
                OperationBinding {
                    path: path.clone(),
                    method,
                    path_params,
                    query_params,
                    header_params,
                },
            );
        }
    }

    (tools, operations)
}

/// `operationId` if present, else `method_pathSegments` with `{param}`
/// placeholders removed and non-alphanumerics dropped; collisions (with a
/// prior derived name *or* a prior explicit `operationId`) resolved by
/// appending the smallest positive integer that yields a name not already in
/// `used_names` (§4.2.1).
fn unique_name(
    operation: &Operation,
    method: Method,
    path: &str,
    used_names: &mut HashSet<String>,
) -> String {
    let base = operation.operation_id.clone().unwrap_or_else(|| {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty() && !s.starts_with('{'))
            .map(|s| {
                s.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            format!("{}_root", method.as_str())
        } else {
            format!("{}_{}", method.as_str(), segments.join("_"))
        }
    });

    if used_names.insert(base.clone()) {
        return base;
    }
    let mut suffix: u32 = 1;
    loop {
        let candidate = format!("{base}{suffix}");
        if used_names.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn build_input_schema(
    document: &OpenAPI,
    item: &openapiv3::PathItem,
    operation: &Operation,
) -> (Map<String, Value>, Vec<String>, Vec<String>, Vec<String>) {
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut path_params = Vec::new();
    let mut query_params = Vec::new();
    let mut header_params = Vec::new();

    for parameter in item.parameters.iter().chain(operation.parameters.iter()) {
        let Some(parameter) = resolve_parameter(document, parameter) else {
            continue;
        };
        let data = parameter_data(parameter);
        if data.required {
            required.push(data.name.clone());
        }
        match parameter {
            Parameter::Path { .. } => {
                path_params.push(data.name.clone());
                properties.insert(data.name.clone(), serde_json::json!({ "type": "string" }));
            }
            Parameter::Query { .. } => {
                query_params.push(data.name.clone());
                properties.insert(data.name.clone(), parameter_schema_json(document, data));
            }
            Parameter::Header { .. } => {
                header_params.push(data.name.clone());
                properties.insert(data.name.clone(), parameter_schema_json(document, data));
            }
            Parameter::Cookie { .. } => {}
        }
    }

    if let Some(body) = operation
        .request_body
        .as_ref()
        .and_then(|b| resolve_request_body(document, b))
    {
        if let Some(media) = body.content.get("application/json") {
            if let Some(schema) = media.schema.as_ref().and_then(|s| resolve_schema(document, s)) {
                properties.insert(
                    "body".to_string(),
                    serde_json::to_value(schema).unwrap_or(Value::Null),
                );
                if body.required {
                    required.push("body".to_string());
                }
            }
        }
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert(
            "required".to_string(),
            Value::Array(required.into_iter().map(Value::String).collect()),
        );
    }
    (schema, path_params, query_params, header_params)
}

fn parameter_data(parameter: &Parameter) -> &openapiv3::ParameterData {
    match parameter {
        Parameter::Query { parameter_data, .. } => parameter_data,
        Parameter::Header { parameter_data, .. } => parameter_data,
        Parameter::Path { parameter_data, .. } => parameter_data,
        Parameter::Cookie { parameter_data, .. } => parameter_data,
    }
}

fn parameter_schema_json(document: &OpenAPI, data: &openapiv3::ParameterData) -> Value {
    match &data.format {
        ParameterSchemaOrContent::Schema(schema_ref) => resolve_schema(document, schema_ref)
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or_else(|| serde_json::json!({ "type": "string" })),
        ParameterSchemaOrContent::Content(_) => serde_json::json!({ "type": "string" }),
    }
}

fn resolve_parameter<'a>(
    document: &'a OpenAPI,
    parameter: &'a ReferenceOr<Parameter>,
) -> Option<&'a Parameter> {
    match parameter {
        ReferenceOr::Item(p) => Some(p),
        ReferenceOr::Reference { reference } => {
            let name = reference.rsplit('/').next()?;
            document
                .components
                .as_ref()?
                .parameters
                .get(name)
                .and_then(|p| p.as_item())
        }
    }
}

fn resolve_request_body<'a>(
    document: &'a OpenAPI,
    body: &'a ReferenceOr<openapiv3::RequestBody>,
) -> Option<&'a openapiv3::RequestBody> {
    match body {
        ReferenceOr::Item(b) => Some(b),
        ReferenceOr::Reference { reference } => {
            let name = reference.rsplit('/').next()?;
            document
                .components
                .as_ref()?
                .request_bodies
                .get(name)
                .and_then(|b| b.as_item())
        }
    }
}

fn resolve_schema<'a>(document: &'a OpenAPI, schema: &'a ReferenceOr<Schema>) -> Option<&'a Schema> {
    match schema {
        ReferenceOr::Item(s) => Some(s),
        ReferenceOr::Reference { reference } => {
            let name = reference.rsplit('/').next()?;
            document
                .components
                .as_ref()?
                .schemas
                .get(name)
                .and_then(|s| s.as_item())
        }
    }
}

/// Free functions re-exported for unit testing and for `registry`/`dispatcher`
/// modules that only need synthesis, not the full connector lifecycle.
pub fn synthesize_openapi_tools(document: &OpenAPI) -> Vec<rmcp::model::Tool> {
    synthesize(document).0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> OpenAPI {
        let text = r#"
        {
          "openapi": "3.0.0",
          "info": { "title": "t", "version": "1" },
          "servers": [{ "url": "https://api.example.com" }],
          "paths": {
            "/pets/{petId}": {
              "get": {
                "operationId": "getPet",
                "parameters": [
                  { "name": "petId", "in": "path", "required": true, "schema": { "type": "string" } }
                ],
                "responses": { "200": { "description": "ok" } }
              }
            },
            "/pets": {
              "get": {
                "parameters": [
                  { "name": "limit", "in": "query", "required": false, "schema": { "type": "integer" } }
                ],
                "responses": { "200": { "description": "ok" } }
              },
              "post": {
                "requestBody": {
                  "required": true,
                  "content": { "application/json": { "schema": { "type": "object" } } }
                },
                "responses": { "200": { "description": "ok" } }
              }
            }
          }
        }
        "#;
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn synthesizes_operation_id_and_derived_names() {
        let document = sample_document();
        let tools = synthesize_openapi_tools(&document);
        let names: Vec<_> = tools.iter().map(|t| t.name.to_string()).collect();
        assert!(names.contains(&"getPet".to_string()));
        assert!(names.contains(&"get_pets".to_string()));
        assert!(names.contains(&"post_pets".to_string()));
    }

    #[test]
    fn path_param_becomes_required_string_property() {
        let document = sample_document();
        let tools = synthesize_openapi_tools(&document);
        let get_pet = tools.iter().find(|t| t.name == "getPet").unwrap();
        assert_eq!(get_pet.input_schema["properties"]["petId"]["type"], "string");
        assert_eq!(get_pet.input_schema["required"][0], "petId");
    }

    #[test]
    fn collisions_get_a_numeric_suffix() {
        let mut used = HashSet::new();
        let a = unique_name(
            &Operation {
                operation_id: Some("thing".to_string()),
                ..Default::default()
            },
            Method::Get,
            "/a",
            &mut used,
        );
        let b = unique_name(
            &Operation {
                operation_id: Some("thing".to_string()),
                ..Default::default()
            },
            Method::Get,
            "/b",
            &mut used,
        );
        assert_eq!(a, "thing");
        assert_eq!(b, "thing1");
    }

    #[test]
    fn collision_with_a_prior_explicit_operation_id_is_avoided() {
        let mut used = HashSet::new();
        // A later-synthesized derived name ("get_users1") would collide with
        // an operationId assigned earlier to a different operation.
        let explicit = unique_name(
            &Operation {
                operation_id: Some("get_users1".to_string()),
                ..Default::default()
            },
            Method::Get,
            "/users/extra",
            &mut used,
        );
        let first_derived = unique_name(&Operation::default(), Method::Get, "/users", &mut used);
        let second_derived = unique_name(&Operation::default(), Method::Get, "/users", &mut used);

        assert_eq!(explicit, "get_users1");
        assert_eq!(first_derived, "get_users");
        // "get_users1" is already taken by the explicit operationId above,
        // so the second collision on the same base must skip it.
        assert_eq!(second_derived, "get_users2");
    }
}

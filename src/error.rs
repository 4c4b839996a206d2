//! Hub-wide error taxonomy.
//!
//! Every layer (settings, connector, pool, registry, dispatcher, ingress)
//! converges on [`HubError`] before crossing a session or HTTP boundary, so
//! that a single `kind` string (§7 of the design) can be attached to both the
//! MCP error object returned to a downstream client and the HTTP status code
//! returned by the admin API.

use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

/// Stable error classification, carried in MCP error `data.kind` and mapped
/// to an HTTP status by the ingress layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    NotFound,
    Unauthorized,
    Forbidden,
    Transport,
    Timeout,
    Upstream,
    Schema,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Schema => "schema",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status code for admin API handlers (§7 propagation rule).
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Config => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::Transport | ErrorKind::Upstream => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Schema => 422,
            ErrorKind::Internal => 500,
        }
    }
}

/// A typed error describing what went wrong and which server/tool it
/// concerns, where applicable. Connectors never panic or bail with an
/// untyped error; they always return one of these.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous")]
    Ambiguous,

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("upstream transport error on {server}: {message}")]
    Transport { server: String, message: String },

    #[error("deadline exceeded on {server}")]
    Timeout { server: String },

    #[error("upstream protocol error on {server}: {message}")]
    Upstream { server: String, message: String },

    #[error("schema error on {server}: {message}")]
    Schema { server: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sdk(#[from] Box<rmcp::RmcpError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Config(_) => ErrorKind::Config,
            HubError::ServerNotFound(_)
            | HubError::ToolNotFound(_)
            | HubError::NotFound(_)
            | HubError::Ambiguous
            | HubError::GroupNotFound(_)
            | HubError::SessionNotFound(_) => ErrorKind::NotFound,
            HubError::Unauthorized(_) | HubError::Jwt(_) => ErrorKind::Unauthorized,
            HubError::Forbidden(_) => ErrorKind::Forbidden,
            HubError::Transport { .. } | HubError::Io(_) | HubError::Http(_) => {
                ErrorKind::Transport
            }
            HubError::Timeout { .. } => ErrorKind::Timeout,
            HubError::Upstream { .. } | HubError::Sdk(_) => ErrorKind::Upstream,
            HubError::Schema { .. } | HubError::Json(_) => ErrorKind::Schema,
            HubError::Internal(_) | HubError::Rusqlite(_) => ErrorKind::Internal,
        }
    }

    /// "ambiguous" not-found error used by the registry/dispatcher tie-break rule (§4.6).
    pub fn ambiguous() -> Self {
        HubError::Ambiguous
    }

    /// Build the `{code, message, data:{kind}}` MCP error object payload.
    pub fn to_mcp_error_data(&self) -> serde_json::Value {
        serde_json::json!({ "kind": self.kind().as_str() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_stable_string() {
        assert_eq!(HubError::Config("bad".into()).kind().as_str(), "config");
        assert_eq!(HubError::Ambiguous.kind().as_str(), "not-found");
        assert_eq!(
            HubError::Timeout {
                server: "s".into()
            }
            .kind()
            .as_str(),
            "timeout"
        );
    }

    #[test]
    fn kind_maps_to_http_status() {
        assert_eq!(HubError::Forbidden("ro".into()).kind().http_status(), 403);
        assert_eq!(HubError::Internal("x".into()).kind().http_status(), 500);
    }
}

//! Authentication chain for both the MCP ingress routes and the admin API
//! (§4.8): skip-auth, then bearer, then JWT.

use std::collections::HashMap;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    error::{HubError, HubResult},
    registry::AuthContext,
    settings::SettingsDocument,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
    pub exp: usize,
}

pub fn issue_jwt(secret: &str, username: &str, is_admin: bool) -> HubResult<String> {
    let exp = (chrono::Utc::now() + chrono::Duration::days(7)).timestamp() as usize;
    let claims = Claims {
        sub: username.to_string(),
        is_admin,
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(HubError::from)
}

pub fn verify_jwt(secret: &str, token: &str) -> HubResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(HubError::from)
}

/// Resolves the caller's `AuthContext` per §4.8's chain: `skipAuth` first,
/// then the static bearer key, then a JWT from the `x-auth-token` header or
/// `?token=` query parameter.
pub fn authenticate(
    document: &SettingsDocument,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    jwt_secret: &str,
) -> HubResult<AuthContext> {
    let routing = &document.system_config.routing;

    if routing.skip_auth {
        return Ok(AuthContext::Unrestricted);
    }

    if routing.enable_bearer_auth {
        if let Some(key) = &routing.bearer_auth_key {
            if let Some(presented) = bearer_token(headers) {
                if &presented == key {
                    return Ok(AuthContext::Unrestricted);
                }
            }
        }
    }

    let token = headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| query.get("token").cloned())
        .ok_or_else(|| HubError::Unauthorized("no credentials presented".to_string()))?;

    let claims = verify_jwt(jwt_secret, &token)
        .map_err(|_| HubError::Unauthorized("invalid or expired token".to_string()))?;

    if claims.is_admin {
        Ok(AuthContext::Unrestricted)
    } else {
        Ok(AuthContext::User(claims.sub))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.to_string())
}

/// §4.8: an absent scope segment is a 403 when `enableGlobalRoute` is off.
pub fn check_global_route(document: &SettingsDocument, scope_segment: Option<&str>) -> HubResult<()> {
    if scope_segment.is_none() && !document.system_config.routing.enable_global_route {
        return Err(HubError::Forbidden(
            "global (unscoped) routes are disabled".to_string(),
        ));
    }
    Ok(())
}

/// Readonly mode: only `GET` and tool-call paths may mutate state.
pub fn check_readonly(readonly: bool, method: &axum::http::Method, is_tool_call: bool) -> HubResult<()> {
    if !readonly {
        return Ok(());
    }
    if method == axum::http::Method::GET || is_tool_call {
        return Ok(());
    }
    Err(HubError::Forbidden(
        "hub is in readonly mode".to_string(),
    ))
}

pub fn verify_password(candidate: &str, hashed: &str) -> bool {
    bcrypt::verify(candidate, hashed).unwrap_or(false)
}

pub fn hash_password(password: &str) -> HubResult<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| HubError::Internal(format!("password hashing failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RoutingConfig;

    fn document_with_routing(routing: RoutingConfig) -> SettingsDocument {
        let mut document = SettingsDocument::empty();
        document.system_config.routing = routing;
        document
    }

    #[test]
    fn skip_auth_bypasses_everything() {
        let document = document_with_routing(RoutingConfig {
            skip_auth: true,
            ..Default::default()
        });
        let result = authenticate(&document, &HeaderMap::new(), &HashMap::new(), "secret");
        assert!(matches!(result, Ok(AuthContext::Unrestricted)));
    }

    #[test]
    fn missing_credentials_are_unauthorized() {
        let document = document_with_routing(RoutingConfig::default());
        let result = authenticate(&document, &HeaderMap::new(), &HashMap::new(), "secret");
        assert!(matches!(result, Err(HubError::Unauthorized(_))));
    }

    #[test]
    fn valid_jwt_resolves_to_user_context() {
        let document = document_with_routing(RoutingConfig::default());
        let token = issue_jwt("secret", "alice", false).unwrap();
        let mut query = HashMap::new();
        query.insert("token".to_string(), token);
        let result = authenticate(&document, &HeaderMap::new(), &query, "secret").unwrap();
        assert!(matches!(result, AuthContext::User(u) if u == "alice"));
    }

    #[test]
    fn admin_jwt_resolves_to_unrestricted() {
        let document = document_with_routing(RoutingConfig::default());
        let token = issue_jwt("secret", "root", true).unwrap();
        let mut query = HashMap::new();
        query.insert("token".to_string(), token);
        let result = authenticate(&document, &HeaderMap::new(), &query, "secret").unwrap();
        assert!(matches!(result, AuthContext::Unrestricted));
    }

    #[test]
    fn global_route_check_rejects_absent_scope_when_disabled() {
        let document = document_with_routing(RoutingConfig::default());
        assert!(check_global_route(&document, None).is_err());
        assert!(check_global_route(&document, Some("srv")).is_ok());
    }

    #[test]
    fn readonly_mode_allows_get_and_tool_calls_only() {
        assert!(check_readonly(true, &axum::http::Method::GET, false).is_ok());
        assert!(check_readonly(true, &axum::http::Method::POST, true).is_ok());
        assert!(check_readonly(true, &axum::http::Method::POST, false).is_err());
        assert!(check_readonly(false, &axum::http::Method::DELETE, false).is_ok());
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }
}

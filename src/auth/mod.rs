//! Authorization gate.
//!
//! # Responsibilities
//! - Validate bearer tokens against a remote JWKS endpoint (when configured)
//! - Enforce the agent token contract (subject/audience) on tunnel endpoints
//! - Enforce namespace and RBAC scoping on proxied requests
//!
//! # Design Decisions
//! - No JWKS endpoint configured means the gateway runs unauthenticated:
//!   validation is a no-op yielding no token
//! - A token without a usable `scopes` claim fails closed
//! - `/api` and `/version` directly under the proxied-cluster prefix are
//!   exempt from authorization

pub mod jwks;
pub mod rbac;
pub mod request_info;

use std::collections::HashMap;

use http::HeaderMap;

use crate::error::StatusError;
use jwks::{Claims, KeySet};
use rbac::{namespace_matches, rules_allow, Scope};
use request_info::RequestAttributes;

/// Token subject required on the agent-facing endpoints.
pub const AGENT_TOKEN_SUBJECT: &str = "KUBE_AGENT";

/// Path suffixes under `/proxies/{agentHost}` that skip authorization.
const NON_AUTH_PATHS: [&str; 2] = ["/api", "/version"];

/// Exact-match exemption check: `prefix + suffix == path`.
pub fn is_non_auth_path(path: &str, prefix: &str) -> bool {
    NON_AUTH_PATHS.iter().any(|p| format!("{prefix}{p}") == path)
}

/// Parse an `Authorization` header of the form `Type token; Type token`.
pub fn parse_authorization(value: &str) -> HashMap<String, String> {
    let mut auths = HashMap::new();
    for part in value.split(';') {
        let mut kv = part.trim().splitn(2, ' ');
        let Some(scheme) = kv.next().filter(|s| !s.is_empty()) else {
            continue;
        };
        let token = kv.next().unwrap_or("").trim().to_string();
        auths.insert(scheme.to_lowercase(), token);
    }
    auths
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    parse_authorization(value).remove("bearer").filter(|t| !t.is_empty())
}

/// The gateway's authorization gate; inactive when no key set is configured.
pub struct Gate {
    keyset: Option<KeySet>,
}

impl Gate {
    pub fn new(jwks_endpoint: Option<String>) -> Self {
        Self {
            keyset: jwks_endpoint.map(KeySet::new),
        }
    }

    pub fn enabled(&self) -> bool {
        self.keyset.is_some()
    }

    /// Extract and validate the bearer token, or `None` when the gate is
    /// inactive.
    pub async fn validate_token_if_needed(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Claims>, StatusError> {
        let Some(keyset) = &self.keyset else {
            return Ok(None);
        };

        let token = bearer_token(headers)
            .ok_or_else(|| StatusError::unauthorized("missing token"))?;

        keyset.validate(&token).await.map(Some)
    }

    /// Enforce the agent token contract: subject `KUBE_AGENT`, audience equal
    /// to the agent host. A `None` token (gate inactive) passes.
    pub fn check_agent_token(
        &self,
        claims: Option<&Claims>,
        agent_host: &str,
    ) -> Result<(), StatusError> {
        let Some(claims) = claims else { return Ok(()) };

        if claims.sub.as_deref() != Some(AGENT_TOKEN_SUBJECT)
            || claims.audience() != agent_host
        {
            return Err(StatusError::unauthorized(format!(
                "invalid token for {agent_host}"
            )));
        }
        Ok(())
    }

    /// Enforce the `scopes` claim against the parsed request attributes.
    pub fn authorize(
        &self,
        claims: &Claims,
        agent_host: &str,
        attrs: &RequestAttributes,
    ) -> Result<(), StatusError> {
        let scopes = claims
            .scopes
            .as_ref()
            .and_then(|v| v.as_object())
            .ok_or_else(|| StatusError::unauthorized("invalid kube access token"))?;

        let scope: Scope = scopes
            .get(agent_host)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| {
                StatusError::forbidden(format!("kube access token not for {agent_host}"))
            })?;

        if !attrs.namespace.is_empty() && !namespace_matches(&scope.namespaces, &attrs.namespace) {
            return Err(StatusError::forbidden(format!(
                "no access to resources in namespace {}",
                attrs.namespace
            )));
        }

        if !rules_allow(attrs, &scope.rules) {
            return Err(StatusError::forbidden(format!(
                "no access to {}",
                attrs.path
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde_json::json;

    fn claims(scopes: serde_json::Value) -> Claims {
        serde_json::from_value(json!({
            "sub": "user",
            "aud": "local",
            "scopes": scopes,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_authorization_multi() {
        let auths = parse_authorization("Bearer x; Other y");
        assert_eq!(auths.get("bearer").map(String::as_str), Some("x"));
        assert_eq!(auths.get("other").map(String::as_str), Some("y"));
        assert!(parse_authorization("").is_empty());
    }

    #[test]
    fn test_non_auth_paths_exact() {
        assert!(is_non_auth_path("/proxies/local/api", "/proxies/local"));
        assert!(is_non_auth_path("/proxies/local/version", "/proxies/local"));
        assert!(!is_non_auth_path("/proxies/local/api/v1", "/proxies/local"));
        assert!(!is_non_auth_path("/proxies/local/metrics", "/proxies/local"));
    }

    #[test]
    fn test_agent_token_contract() {
        let gate = Gate::new(Some("http://issuer/keys".into()));
        let good: Claims =
            serde_json::from_value(json!({"sub": "KUBE_AGENT", "aud": "local"})).unwrap();
        let bad_subject: Claims =
            serde_json::from_value(json!({"sub": "user", "aud": "local"})).unwrap();
        let bad_audience: Claims =
            serde_json::from_value(json!({"sub": "KUBE_AGENT", "aud": "other"})).unwrap();

        assert!(gate.check_agent_token(Some(&good), "local").is_ok());
        assert!(gate.check_agent_token(Some(&bad_subject), "local").is_err());
        assert!(gate.check_agent_token(Some(&bad_audience), "local").is_err());
        assert!(gate.check_agent_token(None, "local").is_ok());
    }

    #[test]
    fn test_authorize_scope_lookup() {
        let gate = Gate::new(Some("http://issuer/keys".into()));
        let claims = claims(json!({
            "local": {
                "namespaces": ["default"],
                "rules": [{"apiGroups": [""], "verbs": ["list"], "resources": ["*"]}],
            }
        }));

        let allowed =
            RequestAttributes::parse(&Method::GET, "/api/v1/namespaces/default/pods", "");
        assert!(gate.authorize(&claims, "local", &allowed).is_ok());

        let wrong_ns =
            RequestAttributes::parse(&Method::GET, "/api/v1/namespaces/kube-system/pods", "");
        assert!(gate.authorize(&claims, "local", &wrong_ns).is_err());

        // Token scoped to a different cluster fails closed.
        assert!(gate.authorize(&claims, "other", &allowed).is_err());
    }

    #[test]
    fn test_missing_scopes_fails_closed() {
        let gate = Gate::new(Some("http://issuer/keys".into()));
        let claims: Claims = serde_json::from_value(json!({"sub": "user"})).unwrap();
        let attrs = RequestAttributes::parse(&Method::GET, "/api/v1/pods", "");
        assert!(gate.authorize(&claims, "local", &attrs).is_err());
    }
}

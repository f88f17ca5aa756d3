//! Bearer token plumbing for mutating routes.
//!
//! Signature verification belongs to the auth collaborator in front of this
//! service; here the token is opaque except for two things: the configured
//! agent claim inside its base64url payload, and the `exp` claim. An expired
//! token is rejected unless the agent is the configured bot, in which case
//! it is accepted with a log note.

use axum::{async_trait, extract::FromRequestParts, http::header, http::request::Parts};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::error::RestError;
use crate::state::AppState;
use crate::versioning::is_bot;

/// The authenticated caller, attached to request extensions for the write
/// pipeline.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// URL-form identifier extracted from the configured claim path.
    pub agent: String,
    /// The full `Authorization` header, echoed into 401/403 messages.
    pub raw_header: String,
}

impl AuthContext {
    pub fn header(&self) -> Option<&str> {
        Some(self.raw_header.as_str())
    }
}

/// Extractor guarding every mutating route: rejects 503 in read-only mode,
/// then authenticates the bearer. Running as an extractor keeps method
/// dispatch first, so a wrong verb is still a 405 rather than a 401.
#[async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = RestError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.config.readonly {
            return Err(RestError::ReadOnly);
        }
        let raw = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map(ToString::to_string);
        authenticate(raw.as_deref(), &state.config)
    }
}

/// Validates the header shape, decodes the payload, extracts the agent and
/// applies the expiry policy.
pub fn authenticate(raw_header: Option<&str>, config: &Config) -> Result<AuthContext, RestError> {
    let Some(raw) = raw_header else {
        return Err(RestError::unauthenticated_for(
            "This action requires a bearer token.",
            None,
            config,
        ));
    };
    let Some(token) = raw.strip_prefix("Bearer ") else {
        return Err(RestError::unauthenticated_for(
            "The Authorization header does not carry a bearer token.",
            Some(raw),
            config,
        ));
    };
    let Some(claims) = decode_payload(token) else {
        return Err(RestError::unauthenticated_for(
            "The bearer token payload could not be decoded.",
            Some(raw),
            config,
        ));
    };
    let agent = claim_path(&claims, &config.agent_claim)
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let Some(agent) = agent else {
        return Err(RestError::unauthenticated_for(
            "The bearer token carries no agent claim.",
            Some(raw),
            config,
        ));
    };

    let expired = claims
        .get("exp")
        .and_then(Value::as_i64)
        .is_some_and(|exp| exp < Utc::now().timestamp());
    if expired {
        if is_bot(&agent, config) {
            tracing::info!(agent = %agent, "Accepting expired token for the configured bot agent");
        } else {
            return Err(RestError::unauthenticated_for(
                "The bearer token is expired.",
                Some(raw),
                config,
            ));
        }
    }

    Ok(AuthContext {
        agent,
        raw_header: raw.to_string(),
    })
}

/// Decodes the payload segment of a compact JWS, tolerating padded and
/// unpadded base64url.
fn decode_payload(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Resolves the configured claim path. Claim names are commonly full URLs,
/// so the whole string is tried as a literal key before dotted descent.
fn claim_path<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = claims.get(path) {
        return Some(value);
    }
    let mut current = claims;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bearer(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("Bearer {header}.{payload}.fakesignature")
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_extracts_agent_from_url_claim() {
        let config = Config::for_tests();
        let token = bearer(&json!({
            "http://store.rerum.io/agent": "http://x/agent/7",
            "exp": future_exp(),
        }));
        let context = authenticate(Some(&token), &config).unwrap();
        assert_eq!(context.agent, "http://x/agent/7");
    }

    #[test]
    fn test_dotted_claim_path() {
        let mut config = Config::for_tests();
        config.agent_claim = "payload.agent".to_string();
        let token = bearer(&json!({
            "payload": {"agent": "http://x/agent/9"},
            "exp": future_exp(),
        }));
        let context = authenticate(Some(&token), &config).unwrap();
        assert_eq!(context.agent, "http://x/agent/9");
    }

    #[test]
    fn test_missing_header_is_unauthenticated() {
        let config = Config::for_tests();
        let err = authenticate(None, &config).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
        assert!(err.message().contains(&config.register_url()));
    }

    #[test]
    fn test_non_bearer_header_is_rejected_with_echo() {
        let config = Config::for_tests();
        let err = authenticate(Some("Basic dXNlcg=="), &config).unwrap_err();
        assert!(err.message().contains("Basic dXNlcg=="));
    }

    #[test]
    fn test_expired_token_rejected_for_regular_agent() {
        let config = Config::for_tests();
        let token = bearer(&json!({
            "http://store.rerum.io/agent": "http://x/agent/7",
            "exp": Utc::now().timestamp() - 10,
        }));
        let err = authenticate(Some(&token), &config).unwrap_err();
        assert!(err.message().contains("expired"));
    }

    #[test]
    fn test_expired_token_accepted_for_bot() {
        let config = Config::for_tests();
        let token = bearer(&json!({
            "http://store.rerum.io/agent": config.bot_agent.clone(),
            "exp": Utc::now().timestamp() - 10,
        }));
        let context = authenticate(Some(&token), &config).unwrap();
        assert_eq!(context.agent, config.bot_agent);
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        let config = Config::for_tests();
        let err = authenticate(Some("Bearer not-a-jwt"), &config).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}

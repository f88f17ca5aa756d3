//! Request-level error kinds and their HTTP rendering.
//!
//! Every failure a handler can produce is one of these kinds; the
//! `IntoResponse` impl is the final middleware that renders the kind into a
//! `{http_response_code, message}` body. Cache failures never reach this
//! type: they degrade to misses inside the cache store.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::config::Config;

pub type RestResult<T> = Result<T, RestError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestError {
    /// Body not JSON, missing `@id` where required, bad content type.
    BadRequest(String),
    /// No bearer, bad bearer, or agent mismatch on an update.
    Unauthenticated(String),
    /// Released target, or action restricted.
    Forbidden(String),
    NotFound(String),
    /// Wrong verb for a route; names the correct method.
    MethodNotAllowed(&'static str),
    NotImplemented(String),
    /// The `READONLY` flag is on.
    ReadOnly,
    /// Document-store error after bounded retries.
    StoreFailure(String),
    /// The cluster bus did not achieve sync before the deadline after a
    /// successful write; the mutation stands but some workers may be stale.
    ClusterIncoherent { acked: u32, unacked: u32 },
    /// Flow control for no-op writes; renders as an empty 304.
    NotModified,
}

impl RestError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::ReadOnly => StatusCode::SERVICE_UNAVAILABLE,
            Self::StoreFailure(_) | Self::ClusterIncoherent { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotModified => StatusCode::NOT_MODIFIED,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(msg)
            | Self::Unauthenticated(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::NotImplemented(msg)
            | Self::StoreFailure(msg) => msg.clone(),
            Self::MethodNotAllowed(expected) => {
                format!("Improper request method for this route. Use {expected} instead.")
            }
            Self::ReadOnly => {
                "This RERUM instance is read-only. No writes are permitted.".to_string()
            }
            Self::ClusterIncoherent { acked, unacked } => format!(
                "The write succeeded but cache invalidation was not acknowledged \
                 cluster-wide before the deadline ({acked} acked, {unacked} unacked). \
                 Subsequent reads may be stale on some workers."
            ),
            Self::NotModified => String::new(),
        }
    }

    /// Builds a 401 whose message carries the offending `Authorization`
    /// header value and the registration URL, to aid client debugging.
    pub fn unauthenticated_for(reason: &str, auth_header: Option<&str>, config: &Config) -> Self {
        Self::Unauthenticated(with_auth_context(reason, auth_header, config))
    }

    /// Builds a 403 with the same debugging context as 401s.
    pub fn forbidden_for(reason: &str, auth_header: Option<&str>, config: &Config) -> Self {
        Self::Forbidden(with_auth_context(reason, auth_header, config))
    }
}

fn with_auth_context(reason: &str, auth_header: Option<&str>, config: &Config) -> String {
    let presented = match auth_header {
        Some(value) if !value.is_empty() => format!("Authorization presented: '{value}'."),
        _ => "No Authorization header was presented.".to_string(),
    };
    format!(
        "{reason} {presented} Register an agent at {} to obtain a token.",
        config.register_url()
    )
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::NOT_MODIFIED {
            return status.into_response();
        }
        let body = serde_json::json!({
            "http_response_code": status.as_u16(),
            "message": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for RestError {
    fn from(err: anyhow::Error) -> Self {
        Self::StoreFailure(format!("Document store failure: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RestError::ReadOnly.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            RestError::ClusterIncoherent { acked: 1, unacked: 2 }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(RestError::NotModified.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn test_method_not_allowed_names_verb() {
        let err = RestError::MethodNotAllowed("PATCH");
        assert!(err.message().contains("PATCH"));
    }

    #[test]
    fn test_unauthenticated_carries_header_and_registration() {
        let config = Config::for_tests();
        let err = RestError::unauthenticated_for(
            "Agent does not match the generator.",
            Some("Bearer abc"),
            &config,
        );
        let msg = err.message();
        assert!(msg.contains("Bearer abc"));
        assert!(msg.contains(&config.register_url()));
    }
}

//! Shared harness for the integration suites: the real router over the
//! in-process store and the single-process bus.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use rerum::cache::{CacheStore, LocalBus};
use rerum::config::Config;
use rerum::routes::build_router;
use rerum::state::AppState;
use rerum::store::MemoryStore;

pub const AGENT: &str = "http://localhost:3005/v1/id/agent-primary";
pub const OTHER_AGENT: &str = "http://localhost:3005/v1/id/agent-other";

pub struct Harness {
    pub app: Router,
    pub state: AppState,
}

pub fn harness() -> Harness {
    harness_with(Config::for_tests())
}

pub fn harness_with(config: Config) -> Harness {
    let cache = Arc::new(CacheStore::new(
        config.cache_max_length,
        config.cache_max_bytes,
        config.cache_ttl,
    ));
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(LocalBus::new(Arc::clone(&cache)));
    let state = AppState::new(config, store, cache, bus);
    Harness {
        app: build_router(state.clone()),
        state,
    }
}

/// A structurally valid bearer for `agent`; signatures are the auth
/// collaborator's concern and are not inspected here.
pub fn bearer(agent: &str) -> String {
    bearer_with_exp(agent, chrono::Utc::now().timestamp() + 3600)
}

pub fn bearer_with_exp(agent: &str, exp: i64) -> String {
    let head = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = json!({
        "http://store.rerum.io/agent": agent,
        "exp": exp,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("Bearer {head}.{payload}.sig")
}

/// Drives one request through the router and returns status, headers, and
/// the parsed JSON body (Null when empty).
pub async fn send(
    harness: &Harness,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<&Value>,
) -> (StatusCode, HeaderMap, Value) {
    send_raw(
        harness,
        method,
        uri,
        token,
        body.map(|b| b.to_string()),
        &[],
    )
    .await
}

pub async fn send_raw(
    harness: &Harness,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<String>,
    extra_headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json; charset=utf-8");
    }
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(body.map_or_else(Body::empty, Body::from))
        .expect("request should build");

    let response = harness
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, value)
}

/// Creates an object through the API and returns the response body.
pub async fn create_object(harness: &Harness, body: &Value) -> Value {
    let (status, _, created) = send(
        harness,
        "POST",
        "/v1/api/create",
        Some(&bearer(AGENT)),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {created}");
    created
}

pub fn short_id_of(doc: &Value) -> String {
    doc["@id"]
        .as_str()
        .and_then(|id| id.rsplit('/').next())
        .expect("document should carry an @id")
        .to_string()
}

pub fn x_cache(headers: &HeaderMap) -> &str {
    headers
        .get("X-Cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

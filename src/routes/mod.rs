//! HTTP surface: routing, CORS, method override, and the terminal 404/405
//! handlers. All API routes live under `/v1`.

pub mod cache_admin;
pub mod read;
pub mod write;

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::error::RestError;
use crate::request_id::request_id_middleware;
use crate::state::AppState;

/// Builds the full application router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let read_routes = Router::new()
        .route("/id/:_id", get(read::by_id).fallback(expect_get))
        .route(
            "/api/query",
            post(read::query).head(read::query_head).fallback(expect_post),
        )
        .route("/api/search", post(read::search).fallback(expect_post))
        .route(
            "/api/search/phrase",
            post(read::search_phrase).fallback(expect_post),
        )
        .route("/history/:_id", get(read::history).fallback(expect_get))
        .route("/since/:_id", get(read::since).fallback(expect_get))
        .route(
            "/gog/fragmentsFromManuscript",
            post(read::gog_fragments).fallback(expect_post),
        )
        .route(
            "/gog/glossesFromManuscript",
            post(read::gog_glosses).fallback(expect_post),
        );

    let write_routes = Router::new()
        .route("/api/create", post(write::create).fallback(expect_post))
        .route(
            "/api/bulkCreate",
            post(write::bulk_create).fallback(expect_post),
        )
        .route("/api/update", put(write::update).fallback(expect_put))
        .route(
            "/api/bulkUpdate",
            put(write::bulk_update).fallback(expect_put),
        )
        .route("/api/patch", patch(write::patch).fallback(expect_patch))
        .route("/api/set", patch(write::set).fallback(expect_patch))
        .route("/api/unset", patch(write::unset).fallback(expect_patch))
        .route(
            "/api/overwrite",
            put(write::overwrite).fallback(expect_put),
        )
        .route(
            "/api/release/:_id",
            patch(write::release).fallback(expect_patch),
        )
        .route(
            "/api/delete/:_id",
            delete(write::delete).fallback(expect_delete),
        );

    let cache_routes = Router::new()
        .route(
            "/api/cache/stats",
            get(cache_admin::stats).fallback(expect_get),
        )
        .route(
            "/api/cache/clear",
            post(cache_admin::clear).fallback(expect_post),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/v1", read_routes.merge(write_routes).merge(cache_routes))
        .fallback(not_found)
        .layer(middleware::from_fn(method_override_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

/// Rewrites `POST` + `X-HTTP-Method-Override: PATCH` into a PATCH before
/// routing; any other override value is a 405. Bare OPTIONS short-circuits
/// to 200 so the permissive CORS headers apply everywhere.
async fn method_override_middleware(mut req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    if req.method() == Method::POST {
        if let Some(value) = req.headers().get("X-HTTP-Method-Override") {
            match value.to_str() {
                Ok(v) if v.eq_ignore_ascii_case("PATCH") => {
                    *req.method_mut() = Method::PATCH;
                }
                _ => return RestError::MethodNotAllowed("PATCH").into_response(),
            }
        }
    }
    next.run(req).await
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "cacheLength": state.cache.stats().length,
            })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "message": format!("Document store unreachable: {err}"),
            })),
        )
            .into_response(),
    }
}

async fn not_found() -> RestError {
    RestError::NotFound("There is nothing at this route. Check the URL and verb.".to_string())
}

async fn expect_get() -> RestError {
    RestError::MethodNotAllowed("GET")
}

async fn expect_post() -> RestError {
    RestError::MethodNotAllowed("POST")
}

async fn expect_put() -> RestError {
    RestError::MethodNotAllowed("PUT")
}

async fn expect_patch() -> RestError {
    RestError::MethodNotAllowed("PATCH")
}

async fn expect_delete() -> RestError {
    RestError::MethodNotAllowed("DELETE")
}

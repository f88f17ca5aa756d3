//! Read pipeline: fingerprint, cache lookup, store fetch, schema-guarded
//! cache population. Every cacheable response carries `X-Cache: HIT|MISS`.
//! Cache operations here never touch the cluster bus.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::Response,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;

use crate::error::{RestError, RestResult};
use crate::fingerprint::{self, Namespace, DEFAULT_LIMIT, DEFAULT_SKIP, DEFAULT_SLOP};
use crate::model;
use crate::state::AppState;
use crate::store::id_query;
use crate::versioning;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const ID_CACHE_CONTROL: &str = "max-age=86400, must-revalidate";

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

impl Pagination {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    fn skip(&self) -> u64 {
        self.skip.unwrap_or(DEFAULT_SKIP)
    }
}

/// Schema guard deciding whether a fetched body may enter the cache.
#[derive(Clone, Copy)]
enum Guard {
    /// Endpoints contracted to return arrays.
    ArrayBody,
    /// Endpoints contracted to return a non-empty object.
    ObjectBody,
}

impl Guard {
    fn admits(self, value: &Value) -> bool {
        match self {
            Self::ArrayBody => value.is_array(),
            Self::ObjectBody => value.as_object().is_some_and(|m| !m.is_empty()),
        }
    }
}

/// Wraps a store call in the read deadline.
pub(crate) async fn with_timeout<T, Fut>(state: &AppState, fut: Fut) -> RestResult<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(state.config.store_timeout, fut)
        .await
        .map_err(|_| RestError::StoreFailure("The document store timed out.".to_string()))?
        .map_err(RestError::from)
}

/// The shared read pipeline: returns the response bytes and the cache
/// disposition header value.
async fn cached_bytes<Fut>(
    state: &AppState,
    fp: &str,
    fields: Option<BTreeSet<String>>,
    guard: Guard,
    fetch: Fut,
) -> RestResult<(Vec<u8>, &'static str)>
where
    Fut: Future<Output = RestResult<Value>>,
{
    if state.config.caching {
        if let Some(bytes) = state.cache.get(fp) {
            return Ok((bytes, "HIT"));
        }
    }
    let value = fetch.await?;
    let bytes = serde_json::to_vec(&value)
        .map_err(|e| RestError::StoreFailure(format!("Unserializable response: {e}")))?;
    if state.config.caching && guard.admits(&value) {
        state.cache.set(fp, bytes.clone(), fields);
    }
    Ok((bytes, "MISS"))
}

fn json_response(
    bytes: Vec<u8>,
    x_cache: &'static str,
    cache_control: Option<&'static str>,
) -> Response {
    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    headers.insert("X-Cache", HeaderValue::from_static(x_cache));
    if let Some(value) = cache_control {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(value));
    }
    response
}

fn parse_json(bytes: &Bytes) -> RestResult<Value> {
    serde_json::from_slice(bytes)
        .map_err(|_| RestError::BadRequest("The request body is not valid JSON.".to_string()))
}

pub(crate) fn parse_json_object(bytes: &Bytes) -> RestResult<Value> {
    let value = parse_json(bytes)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(RestError::BadRequest(
            "The request body must be a single JSON object.".to_string(),
        ))
    }
}

/// The object field names a query body depends on, recorded with the cache
/// entry so writes can invalidate by field overlap. Dotted paths index by
/// their root segment; `$or`/`$and` branches contribute recursively.
fn indexable_fields(body: &Value, out: &mut BTreeSet<String>) {
    let Some(map) = body.as_object() else {
        return;
    };
    for (key, value) in map {
        if key == "$or" || key == "$and" {
            if let Some(branches) = value.as_array() {
                for branch in branches {
                    indexable_fields(branch, out);
                }
            }
        } else if !key.starts_with('$') {
            let root = key.split('.').next().unwrap_or(key);
            out.insert(root.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /v1/id/:_id
pub async fn by_id(State(state): State<AppState>, Path(id): Path<String>) -> RestResult<Response> {
    let fp = fingerprint::for_id(Namespace::Id, &id);
    let fetch = async {
        with_timeout(&state, state.store.find_one(&id_query(&id)))
            .await?
            .ok_or_else(|| RestError::NotFound(format!("No RERUM object with id '{id}'.")))
    };
    let (bytes, disposition) =
        cached_bytes(&state, &fp, None, Guard::ObjectBody, fetch).await?;
    Ok(json_response(bytes, disposition, Some(ID_CACHE_CONTROL)))
}

/// POST /v1/api/query
pub async fn query(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    bytes: Bytes,
) -> RestResult<Response> {
    let (bytes, disposition) = query_payload(&state, &page, &bytes).await?;
    Ok(json_response(bytes, disposition, None))
}

/// HEAD /v1/api/query — `Content-Length` of the JSON response only.
pub async fn query_head(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    bytes: Bytes,
) -> RestResult<Response> {
    let (bytes, disposition) = query_payload(&state, &page, &bytes).await?;
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    headers.insert("X-Cache", HeaderValue::from_static(disposition));
    Ok(response)
}

async fn query_payload(
    state: &AppState,
    page: &Pagination,
    raw: &Bytes,
) -> RestResult<(Vec<u8>, &'static str)> {
    let body = parse_json_object(raw)?;
    let fp = fingerprint::for_body(Namespace::Query, &body, page.limit(), page.skip(), None);
    let mut fields = BTreeSet::new();
    indexable_fields(&body, &mut fields);
    let fetch = async {
        let found = with_timeout(
            state,
            state.store.find_many(&body, page.limit(), page.skip()),
        )
        .await?;
        Ok(Value::Array(found))
    };
    cached_bytes(state, &fp, Some(fields), Guard::ArrayBody, fetch).await
}

/// Accepts `{searchText, options?}` or a raw text body.
fn search_text(raw: &Bytes) -> RestResult<(String, Option<Value>)> {
    let fallback = || {
        String::from_utf8(raw.to_vec()).map_err(|_| {
            RestError::BadRequest("The search text is not valid UTF-8.".to_string())
        })
    };
    let (text, options) = match serde_json::from_slice::<Value>(raw) {
        Ok(Value::String(text)) => (text, None),
        Ok(Value::Object(map)) => {
            let text = map
                .get("searchText")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| {
                    RestError::BadRequest(
                        "A search request object must carry a 'searchText' string.".to_string(),
                    )
                })?;
            (text, map.get("options").cloned())
        }
        Ok(_) => {
            return Err(RestError::BadRequest(
                "The search body must be text or a search request object.".to_string(),
            ))
        }
        Err(_) => (fallback()?, None),
    };
    if text.trim().is_empty() {
        return Err(RestError::BadRequest("The search text is empty.".to_string()));
    }
    Ok((text, options))
}

/// POST /v1/api/search
pub async fn search(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    raw: Bytes,
) -> RestResult<Response> {
    let (text, _) = search_text(&raw)?;
    let fp = fingerprint::for_body(
        Namespace::Search,
        &Value::String(text.clone()),
        page.limit(),
        page.skip(),
        None,
    );
    let fetch = async {
        let found = with_timeout(
            &state,
            state.store.text_search(&text, page.limit(), page.skip()),
        )
        .await?;
        Ok(Value::Array(found))
    };
    let (bytes, disposition) = cached_bytes(&state, &fp, None, Guard::ArrayBody, fetch).await?;
    Ok(json_response(bytes, disposition, None))
}

/// POST /v1/api/search/phrase
pub async fn search_phrase(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    raw: Bytes,
) -> RestResult<Response> {
    let (text, options) = search_text(&raw)?;
    let slop = options
        .as_ref()
        .and_then(|o| o.get("slop"))
        .and_then(Value::as_u64)
        .and_then(|s| u32::try_from(s).ok())
        .unwrap_or(DEFAULT_SLOP);
    let fp = fingerprint::for_body(
        Namespace::SearchPhrase,
        &Value::String(text.clone()),
        page.limit(),
        page.skip(),
        Some(&json!({"slop": slop})),
    );
    let fetch = async {
        let found = with_timeout(
            &state,
            state
                .store
                .phrase_search(&text, slop, page.limit(), page.skip()),
        )
        .await?;
        Ok(Value::Array(found))
    };
    let (bytes, disposition) = cached_bytes(&state, &fp, None, Guard::ArrayBody, fetch).await?;
    Ok(json_response(bytes, disposition, None))
}

async fn chain_target(state: &AppState, id: &str) -> RestResult<Value> {
    let found = with_timeout(state, state.store.find_one(&id_query(id))).await?;
    let Some(doc) = found else {
        return Err(RestError::NotFound(format!("No RERUM object with id '{id}'.")));
    };
    if model::is_deleted(&doc) {
        return Err(RestError::NotFound(format!(
            "The object with id '{id}' is deleted and has no version chain."
        )));
    }
    Ok(doc)
}

/// GET /v1/history/:_id — the chain upward to the root, nearest first.
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> RestResult<Response> {
    let fp = fingerprint::for_id(Namespace::History, &id);
    let fetch = async {
        let target = chain_target(&state, &id).await?;
        let members =
            with_timeout(&state, versioning::chain_members(state.store.as_ref(), &target))
                .await?;
        Ok(Value::Array(versioning::ancestors_of(&target, &members)))
    };
    let (bytes, disposition) = cached_bytes(&state, &fp, None, Guard::ArrayBody, fetch).await?;
    Ok(json_response(bytes, disposition, None))
}

/// GET /v1/since/:_id — all descendants in generation order.
pub async fn since(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> RestResult<Response> {
    let fp = fingerprint::for_id(Namespace::Since, &id);
    let fetch = async {
        let target = chain_target(&state, &id).await?;
        let members =
            with_timeout(&state, versioning::chain_members(state.store.as_ref(), &target))
                .await?;
        Ok(Value::Array(versioning::descendants_of(&target, &members)))
    };
    let (bytes, disposition) = cached_bytes(&state, &fp, None, Guard::ArrayBody, fetch).await?;
    Ok(json_response(bytes, disposition, None))
}

// ---------------------------------------------------------------------------
// Gallery of Glosses helpers
// ---------------------------------------------------------------------------

fn manuscript_uri(body: &Value) -> RestResult<String> {
    body.get("ManuscriptWitness")
        .and_then(Value::as_str)
        .filter(|uri| !uri.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| {
            RestError::BadRequest(
                "The request body must carry a 'ManuscriptWitness' URI.".to_string(),
            )
        })
}

async fn fragments_for(state: &AppState, uri: &str, page: &Pagination) -> RestResult<Vec<Value>> {
    let query = json!({"@type": "WitnessFragment", "partOf": uri});
    with_timeout(
        state,
        state.store.find_many(&query, page.limit(), page.skip()),
    )
    .await
}

/// POST /v1/gog/fragmentsFromManuscript — the WitnessFragment documents of
/// one manuscript.
pub async fn gog_fragments(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    raw: Bytes,
) -> RestResult<Response> {
    let body = parse_json_object(&raw)?;
    let uri = manuscript_uri(&body)?;
    let fp = fingerprint::for_body(
        Namespace::GogFragments,
        &body,
        page.limit(),
        page.skip(),
        None,
    );
    let fetch = async {
        Ok(Value::Array(fragments_for(&state, &uri, &page).await?))
    };
    let (bytes, disposition) = cached_bytes(&state, &fp, None, Guard::ArrayBody, fetch).await?;
    Ok(json_response(bytes, disposition, None))
}

/// POST /v1/gog/glossesFromManuscript — the Gloss documents referenced by a
/// manuscript's fragments.
pub async fn gog_glosses(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    raw: Bytes,
) -> RestResult<Response> {
    let body = parse_json_object(&raw)?;
    let uri = manuscript_uri(&body)?;
    let fp = fingerprint::for_body(
        Namespace::GogGlosses,
        &body,
        page.limit(),
        page.skip(),
        None,
    );
    let fetch = async {
        let unpaged = Pagination { limit: Some(0), skip: Some(0) };
        let fragments = fragments_for(&state, &uri, &unpaged).await?;
        let mut gloss_ids: Vec<Value> = Vec::new();
        for fragment in &fragments {
            if let Some(references) = fragment.get("references").and_then(Value::as_array) {
                for reference in references {
                    if reference.is_string() && !gloss_ids.contains(reference) {
                        gloss_ids.push(reference.clone());
                    }
                }
            }
        }
        if gloss_ids.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let query = json!({"@id": {"$in": gloss_ids}});
        let found = with_timeout(
            &state,
            state.store.find_many(&query, page.limit(), page.skip()),
        )
        .await?;
        Ok(Value::Array(found))
    };
    let (bytes, disposition) = cached_bytes(&state, &fp, None, Guard::ArrayBody, fetch).await?;
    Ok(json_response(bytes, disposition, None))
}

//! Write pipeline.
//!
//! Every mutation follows the same two-phase shape: authorize and build the
//! new state inline, then run the store mutation, the invalidation plan and
//! the acknowledged cluster broadcast on a spawned task the handler awaits.
//! The spawn keeps steps 3-5 running to completion if the client
//! disconnects; the ordering store -> invalidate-acked -> respond is the
//! coherence property everything else leans on.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

use crate::auth::AuthContext;
use crate::cache::InvalidationPlan;
use crate::error::{RestError, RestResult};
use crate::model;
use crate::routes::read::{parse_json_object as parse_object_body, with_timeout as read_timeout};
use crate::state::AppState;
use crate::store::{id_query, UpdateSpec};
use crate::versioning;

/// Attempts an idempotent store call up to three times before giving up.
async fn with_retry<T, F, Fut>(mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last = None;
    for attempt in 0u32..3 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!("Store call failed (attempt {}): {err}", attempt + 1);
                last = Some(err);
            }
        }
        tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt + 1))).await;
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("store call failed")))
}

/// Step 5: broadcast the plan and require cluster-wide acknowledgement
/// before the caller may respond.
async fn invalidate_acked(state: &AppState, plan: InvalidationPlan) -> Result<(), RestError> {
    if !state.config.caching || plan.is_empty() {
        return Ok(());
    }
    // The bus bounds itself by the configured budget; the outer timeout only
    // guards against a wedged transport.
    let outer = state.config.cluster_sync_budget + Duration::from_millis(150);
    match tokio::time::timeout(outer, state.bus.broadcast_invalidate(plan)).await {
        Ok(Ok(ack)) if ack.is_coherent() => Ok(()),
        Ok(Ok(ack)) => Err(RestError::ClusterIncoherent {
            acked: ack.acked,
            unacked: ack.unacked,
        }),
        Ok(Err(err)) => {
            tracing::error!("Cluster bus failure during invalidation: {err}");
            Err(RestError::ClusterIncoherent { acked: 0, unacked: 0 })
        }
        Err(_) => Err(RestError::ClusterIncoherent { acked: 0, unacked: 0 }),
    }
}

/// Runs steps 3-5 on a task that survives client disconnection, and awaits
/// it under the write deadline.
async fn commit<T, Fut>(state: &AppState, work: Fut) -> RestResult<T>
where
    T: Send + 'static,
    Fut: Future<Output = RestResult<T>> + Send + 'static,
{
    let handle = tokio::spawn(tokio::time::timeout(state.config.store_timeout, work));
    match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(RestError::StoreFailure(
            "The write did not complete within the deadline.".to_string(),
        )),
        Err(err) => Err(RestError::StoreFailure(format!(
            "The write task failed: {err}"
        ))),
    }
}

fn created_response(doc: Value) -> Response {
    let location = model::at_id(&doc).unwrap_or_default().to_string();
    (
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(doc),
    )
        .into_response()
}

fn updated_response(doc: Value) -> Response {
    let location = model::at_id(&doc).unwrap_or_default().to_string();
    (StatusCode::OK, [(header::LOCATION, location)], Json(doc)).into_response()
}

async fn load_by_at_id(state: &AppState, at_id: &str) -> RestResult<Option<Value>> {
    let short = model::short_id(at_id);
    read_timeout(state, state.store.find_one(&id_query(short))).await
}

fn require_at_id(body: &Value) -> RestResult<String> {
    model::at_id(body)
        .map(ToString::to_string)
        .ok_or_else(|| RestError::BadRequest("The request body must carry an '@id'.".to_string()))
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// POST /v1/api/create
pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    let body = parse_object_body(&raw)?;
    let doc = versioning::configure_root(model::strip_protected(&body), &auth.agent, &state.config);

    let task_state = state.clone();
    let task_doc = doc.clone();
    commit(&state, async move {
        with_retry(|| task_state.store.insert_one(&task_doc)).await?;
        let plan = InvalidationPlan::for_created([&task_doc]);
        invalidate_acked(&task_state, plan).await
    })
    .await?;

    tracing::info!(id = %model::at_id(&doc).unwrap_or_default(), "Created object");
    Ok(created_response(doc))
}

/// POST /v1/api/bulkCreate
pub async fn bulk_create(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    let body: Value = serde_json::from_slice(&raw)
        .map_err(|_| RestError::BadRequest("The request body is not valid JSON.".to_string()))?;
    let Some(items) = body.as_array() else {
        return Err(RestError::BadRequest(
            "bulkCreate expects a JSON array of objects.".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(RestError::BadRequest(
            "bulkCreate expects at least one object.".to_string(),
        ));
    }
    let mut docs = Vec::with_capacity(items.len());
    for item in items {
        if !item.is_object() {
            return Err(RestError::BadRequest(
                "Every bulkCreate entry must be a JSON object.".to_string(),
            ));
        }
        docs.push(versioning::configure_root(
            model::strip_protected(item),
            &auth.agent,
            &state.config,
        ));
    }

    let task_state = state.clone();
    let task_docs = docs.clone();
    commit(&state, async move {
        with_retry(|| task_state.store.insert_many(&task_docs)).await?;
        let plan = InvalidationPlan::for_created(task_docs.iter());
        invalidate_acked(&task_state, plan).await
    })
    .await?;

    Ok((StatusCode::CREATED, Json(Value::Array(docs))).into_response())
}

// ---------------------------------------------------------------------------
// Update family
// ---------------------------------------------------------------------------

/// Commits a configured descendant: inserts the new version, appends it to
/// the ancestor's `history.next`, and invalidates.
async fn commit_descendant(
    state: &AppState,
    new_version: versioning::NewVersion,
) -> RestResult<Value> {
    let versioning::NewVersion { doc, ancestor } = new_version;
    let task_state = state.clone();
    let task_doc = doc.clone();
    commit(state, async move {
        with_retry(|| task_state.store.insert_one(&task_doc)).await?;
        if let Some((ancestor_short, spec)) = &ancestor {
            with_retry(|| task_state.store.update_one(ancestor_short, spec)).await?;
        }
        let plan = InvalidationPlan::for_mutation(&task_doc);
        invalidate_acked(&task_state, plan).await
    })
    .await?;
    Ok(doc)
}

/// PUT /v1/api/update
pub async fn update(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    let body = parse_object_body(&raw)?;
    let at_id = require_at_id(&body)?;

    match load_by_at_id(&state, &at_id).await? {
        Some(original) => {
            versioning::authorize_mutation(&original, &auth.agent, auth.header(), &state.config)?;
            let new_version = versioning::configure_descendant(
                &original,
                model::strip_protected(&body),
                &auth.agent,
                &state.config,
            );
            let doc = commit_descendant(&state, new_version).await?;
            Ok(updated_response(doc))
        }
        None if at_id.starts_with(state.config.id_prefix.as_str()) => {
            Err(RestError::NotFound(format!(
                "No RERUM object found to update at '{at_id}'."
            )))
        }
        None => {
            // External import: wrap the foreign object as a new root,
            // recording its @id for provenance.
            let doc = versioning::configure_import(
                model::strip_protected(&body),
                &at_id,
                &auth.agent,
                &state.config,
            );
            let task_state = state.clone();
            let task_doc = doc.clone();
            commit(&state, async move {
                with_retry(|| task_state.store.insert_one(&task_doc)).await?;
                invalidate_acked(&task_state, InvalidationPlan::for_created([&task_doc])).await
            })
            .await?;
            tracing::info!(foreign = %at_id, "Imported external object as a new root");
            Ok(created_response(doc))
        }
    }
}

/// PUT /v1/api/bulkUpdate
pub async fn bulk_update(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    let body: Value = serde_json::from_slice(&raw)
        .map_err(|_| RestError::BadRequest("The request body is not valid JSON.".to_string()))?;
    let Some(items) = body.as_array() else {
        return Err(RestError::BadRequest(
            "bulkUpdate expects a JSON array of objects with '@id'.".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(RestError::BadRequest(
            "bulkUpdate expects at least one object.".to_string(),
        ));
    }

    let mut versions = Vec::with_capacity(items.len());
    for item in items {
        let at_id = require_at_id(item)?;
        let Some(original) = load_by_at_id(&state, &at_id).await? else {
            return Err(RestError::NotFound(format!(
                "No RERUM object found to update at '{at_id}'."
            )));
        };
        versioning::authorize_mutation(&original, &auth.agent, auth.header(), &state.config)?;
        versions.push(versioning::configure_descendant(
            &original,
            model::strip_protected(item),
            &auth.agent,
            &state.config,
        ));
    }

    let docs: Vec<Value> = versions.iter().map(|v| v.doc.clone()).collect();
    let ancestors: Vec<(String, UpdateSpec)> =
        versions.into_iter().filter_map(|v| v.ancestor).collect();
    let mut plan = InvalidationPlan::default();
    for doc in &docs {
        plan.merge(InvalidationPlan::for_mutation(doc));
    }

    let task_state = state.clone();
    let task_docs = docs.clone();
    commit(&state, async move {
        with_retry(|| task_state.store.insert_many(&task_docs)).await?;
        for (ancestor_short, spec) in &ancestors {
            with_retry(|| task_state.store.update_one(ancestor_short, spec)).await?;
        }
        invalidate_acked(&task_state, plan).await
    })
    .await?;

    Ok((StatusCode::OK, Json(Value::Array(docs))).into_response())
}

/// Shared flow for the three merge verbs.
async fn merge_update(
    state: AppState,
    auth: AuthContext,
    raw: Bytes,
    merge: fn(&Value, &Value) -> Map<String, Value>,
) -> RestResult<Response> {
    let body = parse_object_body(&raw)?;
    let at_id = require_at_id(&body)?;
    let Some(original) = load_by_at_id(&state, &at_id).await? else {
        return Err(RestError::NotFound(format!(
            "No RERUM object found to update at '{at_id}'."
        )));
    };
    versioning::authorize_mutation(&original, &auth.agent, auth.header(), &state.config)?;

    let merged = merge(&original, &body);
    if merged == versioning::content_of(&original) {
        return Err(RestError::NotModified);
    }
    let new_version =
        versioning::configure_descendant(&original, merged, &auth.agent, &state.config);
    let doc = commit_descendant(&state, new_version).await?;
    Ok(updated_response(doc))
}

/// PATCH /v1/api/patch — replaces values of existing keys only.
pub async fn patch(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    merge_update(state, auth, raw, versioning::apply_patch).await
}

/// PATCH /v1/api/set — adds absent keys only.
pub async fn set(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    merge_update(state, auth, raw, versioning::apply_set).await
}

/// PATCH /v1/api/unset — removes keys whose body value is null.
pub async fn unset(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    merge_update(state, auth, raw, versioning::apply_unset).await
}

/// PUT /v1/api/overwrite — in place, no history.
pub async fn overwrite(
    State(state): State<AppState>,
    auth: AuthContext,
    raw: Bytes,
) -> RestResult<Response> {
    let body = parse_object_body(&raw)?;
    let at_id = require_at_id(&body)?;
    let Some(original) = load_by_at_id(&state, &at_id).await? else {
        return Err(RestError::NotFound(format!(
            "No RERUM object found to overwrite at '{at_id}'."
        )));
    };
    versioning::authorize_mutation(&original, &auth.agent, auth.header(), &state.config)?;

    let content = model::strip_protected(&body);
    if content == versioning::content_of(&original) {
        return Err(RestError::NotModified);
    }

    let mut replacement = content;
    let original_at_id = model::at_id(&original).unwrap_or_default().to_string();
    let short = model::short_id(&original_at_id).to_string();
    replacement.insert("@id".to_string(), Value::String(original_at_id));
    replacement.insert("_id".to_string(), Value::String(short.clone()));
    let mut meta = model::meta_of(&original).unwrap_or_default();
    meta.is_overwritten = model::iso_now();
    model::set_meta(&mut replacement, &meta);
    let doc = Value::Object(replacement);

    let task_state = state.clone();
    let task_doc = doc.clone();
    commit(&state, async move {
        let matched = with_retry(|| task_state.store.replace_one(&short, &task_doc)).await?;
        if !matched {
            return Err(RestError::NotFound(
                "The object disappeared before it could be overwritten.".to_string(),
            ));
        }
        invalidate_acked(&task_state, InvalidationPlan::for_mutation(&task_doc)).await
    })
    .await?;

    Ok(updated_response(doc))
}

// ---------------------------------------------------------------------------
// Release and delete
// ---------------------------------------------------------------------------

/// PATCH /v1/api/release/:_id
pub async fn release(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> RestResult<Response> {
    let Some(original) = read_timeout(&state, state.store.find_one(&id_query(&id))).await? else {
        return Err(RestError::NotFound(format!("No RERUM object with id '{id}'.")));
    };
    versioning::authorize_mutation(&original, &auth.agent, auth.header(), &state.config)?;

    let ancestor = read_timeout(
        &state,
        versioning::nearest_released_ancestor(state.store.as_ref(), &original),
    )
    .await?;
    let (target_spec, ancestor_update) = versioning::release_updates(&original, ancestor.as_ref());

    let task_state = state.clone();
    let task_id = id.clone();
    let released = commit(&state, async move {
        with_retry(|| task_state.store.update_one(&task_id, &target_spec)).await?;
        if let Some((ancestor_short, spec)) = &ancestor_update {
            with_retry(|| task_state.store.update_one(ancestor_short, spec)).await?;
        }
        let target_query = id_query(&task_id);
        let released = with_retry(|| task_state.store.find_one(&target_query))
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("released object vanished during the release")
            })?;
        // A release freezes a version other chains may reference anywhere;
        // drop everything.
        invalidate_acked(&task_state, InvalidationPlan::full()).await?;
        Ok(released)
    })
    .await?;

    tracing::info!(id = %id, "Released object");
    Ok((StatusCode::OK, Json(released)).into_response())
}

/// DELETE /v1/api/delete/:_id
pub async fn delete(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> RestResult<Response> {
    let Some(original) = read_timeout(&state, state.store.find_one(&id_query(&id))).await? else {
        return Err(RestError::NotFound(format!("No RERUM object with id '{id}'.")));
    };
    versioning::authorize_mutation(&original, &auth.agent, auth.header(), &state.config)?;

    let members = read_timeout(
        &state,
        versioning::chain_members(state.store.as_ref(), &original),
    )
    .await?;
    let healing = versioning::heal_history(&original, &members);
    let shell = model::deleted_shell(&original, &auth.agent);

    let task_state = state.clone();
    let snapshot = original.clone();
    let task_id = id.clone();
    commit(&state, async move {
        with_retry(|| task_state.store.replace_one(&task_id, &shell)).await?;
        for (member_short, spec) in &healing {
            with_retry(|| task_state.store.update_one(member_short, spec)).await?;
        }
        invalidate_acked(&task_state, InvalidationPlan::for_mutation(&snapshot)).await
    })
    .await?;

    tracing::info!(id = %id, "Deleted object");
    Ok(StatusCode::NO_CONTENT.into_response())
}

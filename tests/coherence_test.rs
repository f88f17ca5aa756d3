//! Read-after-write coherence through the full pipeline: a write is not
//! answered until the invalidation is applied, so no subsequent read may
//! observe a pre-write cached value.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_query_cache_invalidated_by_update() {
    let harness = harness();
    let created = create_object(&harness, &json!({"type": "T", "n": 1})).await;

    // Warm the query cache.
    let query = json!({"type": "T"});
    let (_, headers, body) = send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;
    assert_eq!(x_cache(&headers), "MISS");
    assert_eq!(body[0]["n"], 1);
    let (_, headers, _) = send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;
    assert_eq!(x_cache(&headers), "HIT");

    // The update response implies the invalidation was acknowledged.
    let (status, _, _) = send(
        &harness,
        "PUT",
        "/v1/api/update",
        Some(&bearer(AGENT)),
        Some(&json!({"@id": created["@id"], "type": "T", "n": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Any read after the write's response must observe fresh state.
    let (_, headers, body) = send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;
    assert_eq!(x_cache(&headers), "MISS");
    let versions: Vec<i64> = body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["n"].as_i64())
        .collect();
    assert!(versions.contains(&2), "stale query result: {body}");
}

#[tokio::test]
async fn test_unrelated_query_survives_update() {
    let harness = harness();
    let target = create_object(&harness, &json!({"type": "T", "n": 1})).await;
    create_object(&harness, &json!({"motivation": "painting"})).await;

    let unrelated = json!({"motivation": "painting"});
    send(&harness, "POST", "/v1/api/query", None, Some(&unrelated)).await;
    let (_, headers, _) = send(&harness, "POST", "/v1/api/query", None, Some(&unrelated)).await;
    assert_eq!(x_cache(&headers), "HIT");

    let (status, _, _) = send(
        &harness,
        "PUT",
        "/v1/api/update",
        Some(&bearer(AGENT)),
        Some(&json!({"@id": target["@id"], "type": "T", "n": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Field-disjoint query entries are untouched by the plan.
    let (_, headers, _) = send(&harness, "POST", "/v1/api/query", None, Some(&unrelated)).await;
    assert_eq!(x_cache(&headers), "HIT");
}

#[tokio::test]
async fn test_id_cache_invalidated_along_the_chain() {
    let harness = harness();
    let created = create_object(&harness, &json!({"type": "T", "n": 1})).await;
    let id_uri = format!("/v1/id/{}", short_id_of(&created));

    send(&harness, "GET", &id_uri, None, None).await;
    let (_, headers, _) = send(&harness, "GET", &id_uri, None, None).await;
    assert_eq!(x_cache(&headers), "HIT");

    // Updating mutates the ancestor's history.next, so its id entry drops.
    let (status, _, _) = send(
        &harness,
        "PUT",
        "/v1/api/update",
        Some(&bearer(AGENT)),
        Some(&json!({"@id": created["@id"], "type": "T", "n": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, headers, refreshed) = send(&harness, "GET", &id_uri, None, None).await;
    assert_eq!(x_cache(&headers), "MISS");
    assert_eq!(refreshed["__rerum"]["history"]["next"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_history_and_since_invalidated_by_update() {
    let harness = harness();
    let x = create_object(&harness, &json!({"type": "T", "n": 1})).await;
    let (_, _, x1) = send(
        &harness,
        "PUT",
        "/v1/api/update",
        Some(&bearer(AGENT)),
        Some(&json!({"@id": x["@id"], "type": "T", "n": 2})),
    )
    .await;

    let since_uri = format!("/v1/since/{}", short_id_of(&x));
    let (_, _, descendants) = send(&harness, "GET", &since_uri, None, None).await;
    assert_eq!(descendants.as_array().unwrap().len(), 1);
    let (_, headers, _) = send(&harness, "GET", &since_uri, None, None).await;
    assert_eq!(x_cache(&headers), "HIT");

    let (status, _, _) = send(
        &harness,
        "PUT",
        "/v1/api/update",
        Some(&bearer(AGENT)),
        Some(&json!({"@id": x1["@id"], "type": "T", "n": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, headers, descendants) = send(&harness, "GET", &since_uri, None, None).await;
    assert_eq!(x_cache(&headers), "MISS");
    assert_eq!(descendants.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_release_drops_every_namespace() {
    let harness = harness();
    let released = create_object(&harness, &json!({"type": "R", "n": 1})).await;
    create_object(&harness, &json!({"motivation": "untouched"})).await;

    let unrelated = json!({"motivation": "untouched"});
    send(&harness, "POST", "/v1/api/query", None, Some(&unrelated)).await;
    let (_, headers, _) = send(&harness, "POST", "/v1/api/query", None, Some(&unrelated)).await;
    assert_eq!(x_cache(&headers), "HIT");

    let uri = format!("/v1/api/release/{}", short_id_of(&released));
    let (status, _, _) = send(&harness, "PATCH", &uri, Some(&bearer(AGENT)), None).await;
    assert_eq!(status, StatusCode::OK);

    // Release is conservative: even field-disjoint entries are dropped.
    let (_, headers, _) = send(&harness, "POST", "/v1/api/query", None, Some(&unrelated)).await;
    assert_eq!(x_cache(&headers), "MISS");
}

// ---------------------------------------------------------------------------
// cache admin
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cache_stats_counters() {
    let harness = harness();
    create_object(&harness, &json!({"type": "S"})).await;
    let query = json!({"type": "S"});
    send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;
    send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;

    let (status, _, stats) = send(&harness, "GET", "/v1/api/cache/stats", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);
    assert_eq!(stats["sets"], 1);
    assert_eq!(stats["length"], 1);
    assert_eq!(stats["maxLength"], 1000);
    assert!(stats["bytes"].as_u64().unwrap() > 0);

    let (_, _, detailed) = send(
        &harness,
        "GET",
        "/v1/api/cache/stats?details=true",
        None,
        None,
    )
    .await;
    let entries = detailed["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0]["key"].as_str().unwrap().starts_with("query:"));
    assert!(entries[0]["sizeBytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_cache_clear_reports_zero_and_empties_store() {
    let harness = harness();
    create_object(&harness, &json!({"type": "C"})).await;
    send(&harness, "POST", "/v1/api/query", None, Some(&json!({"type": "C"}))).await;

    let (status, _, body) = send(&harness, "POST", "/v1/api/cache/clear", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Cache cleared");
    assert_eq!(body["currentSize"], 0);

    let (_, _, stats) = send(&harness, "GET", "/v1/api/cache/stats", None, None).await;
    assert_eq!(stats["length"], 0);
}

#[tokio::test]
async fn test_hit_body_matches_prior_miss_byte_for_byte() {
    let harness = harness();
    create_object(&harness, &json!({"type": "B", "payload": {"z": 1, "a": 2}})).await;

    let query = json!({"type": "B"});
    let (_, _, miss_body) = send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;
    let (_, headers, hit_body) = send(&harness, "POST", "/v1/api/query", None, Some(&query)).await;
    assert_eq!(x_cache(&headers), "HIT");
    assert_eq!(miss_body, hit_body);
}

//! Architectural Contract Test: Control API
//!
//! This test verifies the HTTP surface in front of the reconciler.
//!
//! Constraints verified:
//! - Calls for another serial number are refused with code "500"
//! - Bodies must be JSON
//! - Existence and input errors come back as code "400"
//! - Singletons are upserted with PUT
//! - configAll applies a full document and removes absent objects

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestApi;
use cpe_api::{ApiResponse, router};
use cpe_core::traits::ConfigStore;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn call(api: &TestApi, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, ApiResponse) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json; charset=utf-8");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = router(api.state.clone())
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_subnet_lifecycle() {
    let api = TestApi::new("SN0001");

    let (status, reply) = call(
        &api,
        "POST",
        "/cpe/SN0001/subnet",
        Some(json!({"id": "zone1", "cidrs": ["172.16.0.0/16"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply, ApiResponse::ok());
    assert!(api.store.get("/subnet/zone1").await.unwrap().is_some());

    let (_, again) = call(
        &api,
        "POST",
        "/cpe/SN0001/subnet",
        Some(json!({"id": "zone1", "cidrs": ["172.16.0.0/16"]})),
    )
    .await;
    assert!(!again.success);
    assert_eq!(again.code, "400", "Expected AlreadyExists as 400, got {:?}", again);

    let (_, modified) = call(
        &api,
        "PUT",
        "/cpe/SN0001/subnet",
        Some(json!({"id": "zone1", "cidrs": ["172.17.0.0/16"]})),
    )
    .await;
    assert!(modified.success);
    let stored = api.store.get("/subnet/zone1").await.unwrap().unwrap();
    assert!(stored.contains("172.17.0.0/16"));

    let (_, deleted) = call(&api, "DELETE", "/cpe/SN0001/subnet/zone1", None).await;
    assert!(deleted.success);
    assert!(api.store.get("/subnet/zone1").await.unwrap().is_none());

    let (_, missing) = call(&api, "DELETE", "/cpe/SN0001/subnet/zone1", None).await;
    assert_eq!(missing.code, "400");
}

#[tokio::test]
async fn test_serial_mismatch_is_refused() {
    let api = TestApi::new("SN0001");

    let (status, reply) = call(
        &api,
        "POST",
        "/cpe/SN9999/subnet",
        Some(json!({"id": "zone1", "cidrs": []})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(!reply.success);
    assert_eq!(reply.code, "500");
    assert!(api.store.get("/subnet/zone1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_body_must_be_json() {
    let api = TestApi::new("SN0001");

    let request = Request::builder()
        .method("POST")
        .uri("/cpe/SN0001/subnet")
        .header("content-type", "text/plain")
        .body(Body::from(r#"{"id":"zone1"}"#))
        .unwrap();
    let response = router(api.state.clone()).oneshot(request).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let reply: ApiResponse = serde_json::from_slice(&bytes).unwrap();

    assert!(!reply.success);
    assert_eq!(reply.code, "400");
    assert!(api.store.get("/subnet/zone1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_kind_and_singleton_rules() {
    let api = TestApi::new("SN0001");

    let (_, unknown) = call(&api, "POST", "/cpe/SN0001/vlan", Some(json!({"id": "v1"}))).await;
    assert_eq!(unknown.code, "400");

    let (_, post_singleton) = call(&api, "POST", "/cpe/SN0001/bgp", Some(json!({"localAs": 65001}))).await;
    assert_eq!(post_singleton.code, "400", "Expected singletons to reject POST");

    let (_, put) = call(
        &api,
        "PUT",
        "/cpe/SN0001/bgp",
        Some(json!({"localAs": 65001, "routerId": "1.1.1.1"})),
    )
    .await;
    assert!(put.success, "Expected PUT to upsert the singleton, got {:?}", put);
    assert!(api.store.get("/bgp").await.unwrap().is_some());
    assert!(api.exec.commands().iter().any(|c| c.contains("router bgp 65001")));
}

#[tokio::test]
async fn test_config_all_replaces_collections() {
    let api = TestApi::new("SN0001");

    let (_, first) = call(
        &api,
        "POST",
        "/cpe/SN0001/configAll",
        Some(json!({
            "ts": 1,
            "subnetConfig": [
                {"id": "zone1", "cidrs": ["172.16.0.0/16"]},
                {"id": "zone2", "cidrs": ["172.18.0.0/16"]}
            ]
        })),
    )
    .await;
    assert!(first.success, "got {:?}", first);

    let (_, second) = call(
        &api,
        "POST",
        "/cpe/SN0001/configAll",
        Some(json!({"ts": 2, "subnetConfig": [{"id": "zone2", "cidrs": ["172.18.0.0/16"]}]})),
    )
    .await;
    assert!(second.success);

    let keys = api.store.keys().await;
    assert_eq!(keys, vec!["/subnet/zone2".to_string()]);

    let (_, wrong_sn) = call(&api, "POST", "/cpe/SN0002/configAll", Some(json!({}))).await;
    assert_eq!(wrong_sn.code, "500");
}

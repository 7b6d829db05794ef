//! HTTP handlers for the Control API

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use cpe_core::model::Kind;
use cpe_core::reconcile::ObjectRequest;
use cpe_core::{AllConf, Error, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::dto::{ApiResponse, CODE_BAD_REQUEST, CODE_ERROR};
use crate::server::ApiState;

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false)
}

fn check_serial(state: &ApiState, sn: &str) -> Result<()> {
    let own = &state.reconciler.context().sn;
    if sn == own {
        Ok(())
    } else {
        Err(Error::SerialMismatch(format!("request for {}, device is {}", sn, own)))
    }
}

fn parse_kind(segment: &str) -> Result<Kind> {
    Kind::parse(segment).ok_or_else(|| Error::invalid_input(format!("unknown kind '{}'", segment)))
}

fn parse_body(headers: &HeaderMap, body: &Bytes) -> std::result::Result<Value, ApiResponse> {
    if !is_json(headers) {
        return Err(ApiResponse::failure(CODE_BAD_REQUEST, "Content-type : application/json"));
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiResponse::failure(CODE_BAD_REQUEST, format!("malformed JSON body: {}", e)))
}

fn respond(kind: &str, result: Result<()>) -> Json<ApiResponse> {
    if let Err(e) = &result {
        warn!(kind, error = %e, "control call failed");
    }
    Json(ApiResponse::from(result))
}

async fn dispatch(
    state: &ApiState,
    sn: &str,
    kind: &str,
    build: impl FnOnce(Kind) -> ObjectRequest,
) -> Result<()> {
    check_serial(state, sn)?;
    let kind = parse_kind(kind)?;
    state.reconciler.handle(kind, build(kind)).await
}

/// POST /cpe/{sn}/{kind}
#[instrument(skip(state, headers, body))]
pub async fn create_object(
    State(state): State<ApiState>,
    Path((sn, kind)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ApiResponse> {
    let value = match parse_body(&headers, &body) {
        Ok(value) => value,
        Err(reply) => return Json(reply),
    };
    let result = dispatch(&state, &sn, &kind, |_| ObjectRequest::Create(value)).await;
    respond(&kind, result)
}

/// PUT /cpe/{sn}/{kind}
///
/// Modify for collection kinds, upsert for singletons.
#[instrument(skip(state, headers, body))]
pub async fn put_object(
    State(state): State<ApiState>,
    Path((sn, kind)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ApiResponse> {
    let value = match parse_body(&headers, &body) {
        Ok(value) => value,
        Err(reply) => return Json(reply),
    };
    let result = dispatch(&state, &sn, &kind, |k| {
        if k.is_singleton() {
            ObjectRequest::Put(value)
        } else {
            ObjectRequest::Modify(value)
        }
    })
    .await;
    respond(&kind, result)
}

/// DELETE /cpe/{sn}/{kind}/{id}
#[instrument(skip(state))]
pub async fn delete_object(
    State(state): State<ApiState>,
    Path((sn, kind, id)): Path<(String, String, String)>,
) -> Json<ApiResponse> {
    let result = dispatch(&state, &sn, &kind, |_| ObjectRequest::Delete(id)).await;
    respond(&kind, result)
}

/// POST /cpe/{sn}/configAll
#[instrument(skip(state, headers, body))]
pub async fn config_all(
    State(state): State<ApiState>,
    Path(sn): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ApiResponse> {
    let value = match parse_body(&headers, &body) {
        Ok(value) => value,
        Err(reply) => return Json(reply),
    };
    if let Err(e) = check_serial(&state, &sn) {
        return respond("configAll", Err(e));
    }
    let doc: AllConf = match serde_json::from_value(value) {
        Ok(doc) => doc,
        Err(e) => return respond("configAll", Err(Error::invalid_input(format!("malformed document: {}", e)))),
    };

    let failures = state.reconciler.apply_all(&doc).await;
    if failures == 0 {
        info!(ts = doc.ts, "configuration document applied via API");
        Json(ApiResponse::ok())
    } else {
        Json(ApiResponse::failure(
            CODE_ERROR,
            format!("{} objects failed to apply", failures),
        ))
    }
}

//! HTTP surface: thin axum handlers over the engine.
//!
//! Handlers translate between ISO-8601 strings at the wire and the engine's
//! epoch-seconds, and map engine failures onto JSON error bodies. A malformed
//! scan query is answered 200 with `status: 302` in the body, which is what
//! deployed clients expect; everything else uses conventional status codes.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::clock::{iso_from_seconds, seconds_from_iso};
use crate::engine::{
    ScanError, ScanRequest, SeedRequest, SendRequest, SightingsEngine, UpdateRequest,
};
use crate::record::Record;

/// `since` default when a client sends none; kept verbatim for clients that
/// echo it back.
const EPOCH_SINCE: &str = "1970-01-01T01:01Z";

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult = Result<Json<Value>, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    error!(%err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn router(engine: Arc<SightingsEngine>) -> Router {
    Router::new()
        .route("/status/send", post(send_status))
        .route("/status/update", post(status_update))
        .route("/status/scan", post(scan_status))
        .route("/status/result", post(status_result))
        .route("/status/data_points", post(data_points))
        .route("/init", post(init))
        .route("/sync", get(sync))
        .route("/admin/status", get(admin_status))
        .route("/admin/config", get(admin_config))
        .fallback(no_such_request)
        .with_state(engine)
}

/// Parse the test-only time override; ignored by the engine outside testing
/// deployments.
fn testing_time(headers: &HeaderMap) -> Option<f64> {
    headers
        .get("x-testing-time")?
        .to_str()
        .ok()
        .and_then(|value| seconds_from_iso(value).ok())
}

async fn send_status(
    State(engine): State<Arc<SightingsEngine>>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> ApiResult {
    let now = engine.current_time(testing_time(&headers));
    engine.send_status(&req, now).map_err(internal)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn status_update(
    State(engine): State<Arc<SightingsEngine>>,
    headers: HeaderMap,
    Json(req): Json<UpdateRequest>,
) -> ApiResult {
    let now = engine.current_time(testing_time(&headers));
    engine.status_update(&req, now).map_err(internal)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn scan_status(
    State(engine): State<Arc<SightingsEngine>>,
    headers: HeaderMap,
    Json(req): Json<ScanRequest>,
) -> ApiResult {
    let now = engine.current_time(testing_time(&headers));
    let since_string = req.since.clone().unwrap_or_else(|| EPOCH_SINCE.to_string());
    let since = seconds_from_iso(&since_string)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    match engine.scan_status(&req, since, now).await {
        Ok(feed) => Ok(Json(json!({
            "since": since_string,
            "contact_ids": feed.contact_ids,
            "locations": feed.locations,
            "until": iso_from_seconds(feed.until).map_err(internal)?,
            "more_data": feed.more_data,
        }))),
        // malformed queries are answered in-band, as clients expect
        Err(ScanError::BadQuery(err)) => Ok(Json(json!({
            "status": 302,
            "error": err.to_string(),
        }))),
        Err(ScanError::Internal(err)) => Err(internal(err)),
    }
}

async fn status_result(
    State(engine): State<Arc<SightingsEngine>>,
    headers: HeaderMap,
    Json(req): Json<SeedRequest>,
) -> ApiResult {
    let now = engine.current_time(testing_time(&headers));
    engine.status_result(&req, now).map_err(internal)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn data_points(
    State(engine): State<Arc<SightingsEngine>>,
    headers: HeaderMap,
    Json(req): Json<SeedRequest>,
) -> ApiResult {
    let now = engine.current_time(testing_time(&headers));
    let Some(seed) = req.seed.as_deref() else {
        return Err(api_error(StatusCode::BAD_REQUEST, "seed is required"));
    };
    let feed = engine.data_points(seed, now).await.map_err(internal)?;
    Ok(Json(json!({
        "contact_ids": feed.contact_ids,
        "locations": feed.locations,
    })))
}

async fn init(
    State(engine): State<Arc<SightingsEngine>>,
    Json(body): Json<Record>,
) -> ApiResult {
    Ok(Json(engine.record_init(&body)))
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    since: Option<String>,
}

async fn sync(
    State(engine): State<Arc<SightingsEngine>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> ApiResult {
    let now = engine.current_time(testing_time(&headers));
    let since_string = query.since.unwrap_or_else(|| EPOCH_SINCE.to_string());
    let since = seconds_from_iso(&since_string)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    let feed = engine.sync(since, now).await.map_err(internal)?;
    Ok(Json(json!({
        "since": since_string,
        "contact_ids": feed.contact_ids,
        "locations": feed.locations,
        "until": iso_from_seconds(feed.until).map_err(internal)?,
        "more_data": feed.more_data,
        "server_name": engine.server_name(),
    })))
}

async fn admin_status(State(engine): State<Arc<SightingsEngine>>) -> ApiResult {
    Ok(Json(engine.admin_status()))
}

async fn admin_config(State(engine): State<Arc<SightingsEngine>>) -> ApiResult {
    Ok(Json(engine.admin_config()))
}

async fn no_such_request() -> ApiError {
    api_error(StatusCode::PAYMENT_REQUIRED, "no such request")
}

//! Agent report ingestion.
//!
//! `POST /api/v1/ingest` accepts a batch (`{"events": [...]}`) or a
//! single event object. Each accepted event is normalized (missing id,
//! severity, timestamp, and host filled in), appended to the store,
//! broadcast over SSE, and evaluated for alerting. Supplying the same id
//! twice appends two lines; downstream consumers deduplicate by id.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use kwatch_core::{event_id, local_host_id, now_ts, AnomalyType, Event, SCHEMA_VERSION};
use serde_json::{json, Value};

use crate::api::ApiError;
use crate::app::App;

pub async fn ingest_handler(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::invalid_argument("empty body", json!({})));
    }
    let data: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_argument("invalid json", json!({})))?;
    let Some(obj) = data.as_object() else {
        return Err(ApiError::invalid_argument(
            "body must be a JSON object",
            json!({}),
        ));
    };

    let config = app.config.snapshot();
    let expected = &config.security.ingest_token;
    if !expected.is_empty() {
        let supplied = headers
            .get("x-ingest-token")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| {
                obj.get("token")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });
        if supplied.as_deref() != Some(expected.as_str()) {
            return Err(ApiError::unauthorized("invalid ingest token"));
        }
    }

    let events: Vec<Value> = match obj.get("events") {
        Some(Value::Array(events)) => events.clone(),
        Some(_) => {
            return Err(ApiError::invalid_argument(
                "events must be an array",
                json!({}),
            ));
        }
        None => vec![data.clone()],
    };

    let received = events.len();
    let mut processed = 0usize;
    for raw in &events {
        let Some(event) = normalize(raw) else {
            continue;
        };
        if let Err(err) = app.store.append(&event) {
            tracing::error!(%err, "event store append failed");
            return Err(ApiError::internal("event store append failed"));
        }
        app.broadcaster.publish(&event);
        app.evaluate_alert(event, config.clone());
        processed += 1;
    }

    Ok(Json(json!({
        "status": "success",
        "received": received,
        "processed": processed,
    })))
}

/// Turn one submitted object into a canonical event, filling defaults.
/// Returns None for objects missing the required `type`/`message` pair
/// or naming an unknown anomaly type.
fn normalize(raw: &Value) -> Option<Event> {
    let obj = raw.as_object()?;
    let anomaly_type = AnomalyType::parse(obj.get("type")?.as_str()?)?;
    let message = obj.get("message")?.as_str()?.trim().to_string();

    let source_file = obj
        .get("source_file")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let line_number = obj.get("line_number").and_then(|v| v.as_u64()).unwrap_or(0);
    let detected_at = obj
        .get("detected_at")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(now_ts);
    let host_id = obj
        .get("host_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(local_host_id);
    let severity = obj
        .get("severity")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
        .unwrap_or_else(|| anomaly_type.severity());
    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| event_id(&host_id, &source_file, line_number, &detected_at, &message));

    Some(Event {
        schema_version: obj
            .get("schema_version")
            .and_then(|v| v.as_str())
            .unwrap_or(SCHEMA_VERSION)
            .to_string(),
        id,
        anomaly_type,
        severity,
        message,
        source_file,
        line_number,
        detected_at,
        host_id,
        processed: obj.get("processed").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

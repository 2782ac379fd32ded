//! Query API handlers and the shared error envelope.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::Query;
use kwatch_core::{parse_ts, Config};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::App;
use crate::stats::compute_stats;

// ============================================================================
// Error envelope
// ============================================================================

/// Error surface shared by every endpoint:
/// `{status, code, message, trace_id, details}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl ApiError {
    pub fn invalid_argument(message: impl Into<String>, details: Value) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_ARGUMENT",
            message: message.into(),
            details,
        }
    }

    pub fn not_found(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn internal(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "UNAVAILABLE",
            message: message.into(),
            details: json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": self.status.as_u16(),
            "code": self.code,
            "message": self.message,
            "trace_id": uuid::Uuid::new_v4().to_string(),
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub window: Option<String>,
    pub host_id: Option<String>,
}

pub async fn stats_handler(
    State(app): State<Arc<App>>,
    Query(params): Query<StatsParams>,
) -> impl IntoResponse {
    let summary = compute_stats(
        &app.store,
        params.window.as_deref(),
        params.host_id.as_deref(),
        app.last_scan.read().clone(),
    );
    Json(summary)
}

// ============================================================================
// Event list / fetch
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Repeated query parameter.
    #[serde(default)]
    pub severity: Vec<String>,
    /// Comma-separated type list.
    pub types: Option<String>,
    pub keyword: Option<String>,
    pub host_id: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
    /// `field:asc|desc`, default `detected_at:desc`.
    pub sort: Option<String>,
}

pub async fn events_handler(
    State(app): State<Arc<App>>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Value>, ApiError> {
    for (name, value) in [("start", &params.start), ("end", &params.end)] {
        if let Some(v) = value {
            if parse_ts(v).is_none() {
                return Err(ApiError::invalid_argument(
                    format!("parameter '{}' must be ISO8601", name),
                    json!({ "param": name }),
                ));
            }
        }
    }

    let type_filter: Option<Vec<String>> = params.types.as_ref().map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });

    let mut items: Vec<Value> = Vec::new();
    for ev in app.store.iter() {
        if let Some(start) = &params.start {
            if ev.detected_at.as_str() < start.as_str() {
                continue;
            }
        }
        if let Some(end) = &params.end {
            if ev.detected_at.as_str() > end.as_str() {
                continue;
            }
        }
        if !params.severity.is_empty()
            && !params.severity.iter().any(|s| s == ev.severity.as_str())
        {
            continue;
        }
        if let Some(types) = &type_filter {
            if !types.iter().any(|t| t == ev.anomaly_type.as_str()) {
                continue;
            }
        }
        if let Some(keyword) = &params.keyword {
            if !ev.message.contains(keyword.as_str())
                && !ev.source_file.contains(keyword.as_str())
            {
                continue;
            }
        }
        if let Some(host) = &params.host_id {
            if &ev.host_id != host {
                continue;
            }
        }
        items.push(json!({
            "id": ev.id,
            "type": ev.anomaly_type.as_str(),
            "severity": ev.severity.as_str(),
            "message": ev.message,
            "source_file": ev.source_file,
            "line_number": ev.line_number,
            "detected_at": ev.detected_at,
            "host_id": ev.host_id,
        }));
    }

    let (sort_key, descending) = parse_sort(params.sort.as_deref());
    items.sort_by(|a, b| {
        let ka = a.get(sort_key).and_then(|v| v.as_str()).unwrap_or("");
        let kb = b.get(sort_key).and_then(|v| v.as_str()).unwrap_or("");
        if descending {
            kb.cmp(ka)
        } else {
            ka.cmp(kb)
        }
    });

    let page = params.page.unwrap_or(1).max(1);
    let size = params.size.unwrap_or(20).clamp(1, 1000);
    let total = items.len();
    let start_idx = (page - 1).saturating_mul(size).min(total);
    let end_idx = (start_idx + size).min(total);
    let page_items = &items[start_idx..end_idx];

    Ok(Json(json!({
        "items": page_items,
        "page": page,
        "size": size,
        "total": total,
        "has_next": end_idx < total,
    })))
}

fn parse_sort(sort: Option<&str>) -> (&'static str, bool) {
    const SORTABLE: &[&str] = &[
        "detected_at",
        "severity",
        "type",
        "host_id",
        "id",
        "source_file",
    ];
    let Some(sort) = sort else {
        return ("detected_at", true);
    };
    let (field, order) = sort.split_once(':').unwrap_or((sort, "desc"));
    let field = SORTABLE
        .iter()
        .find(|s| **s == field)
        .copied()
        .unwrap_or("detected_at");
    (field, order != "asc")
}

pub async fn event_handler(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match app.store.find(&id) {
        Some(ev) => {
            let mut obj = serde_json::to_value(&ev)
                .map_err(|e| ApiError::internal(e.to_string()))?;
            if let Some(map) = obj.as_object_mut() {
                map.entry("raw_excerpt").or_insert_with(|| json!([]));
            }
            Ok(Json(obj))
        }
        None => Err(ApiError::not_found("event not found")),
    }
}

// ============================================================================
// Hosts
// ============================================================================

pub async fn hosts_handler(State(app): State<Arc<App>>) -> Json<Value> {
    let hosts = app.store.hosts();
    Json(json!({ "total": hosts.len(), "hosts": hosts }))
}

// ============================================================================
// Config
// ============================================================================

pub async fn config_get_handler(State(app): State<Arc<App>>) -> Json<Config> {
    Json(app.config.snapshot())
}

pub async fn config_put_handler(
    State(app): State<Arc<App>>,
    body: Bytes,
) -> Result<Json<Config>, ApiError> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_argument("invalid json", json!({})))?;
    let Some(obj) = raw.as_object() else {
        return Err(ApiError::invalid_argument(
            "body must be a JSON object",
            json!({}),
        ));
    };
    for key in obj.keys() {
        if !kwatch_core::config::KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            return Err(ApiError::invalid_argument(
                "unknown fields",
                json!({ "param": key }),
            ));
        }
    }
    let config: Config = serde_json::from_value(raw)
        .map_err(|e| ApiError::invalid_argument(e.to_string(), json!({})))?;
    if let Err(param) = config.validate() {
        return Err(ApiError::invalid_argument(
            format!("{} out of range", param),
            json!({ "param": param }),
        ));
    }
    app.config
        .replace(&config)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(config))
}

// ============================================================================
// Report artifact
// ============================================================================

pub const REPORT_FILE: &str = "report.md";

/// Surface the offline analysis artifact. Generation happens out of
/// process; the server only serves the file.
pub async fn report_handler(State(app): State<Arc<App>>) -> Result<Response, ApiError> {
    let path = app.data_dir.join(REPORT_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            content,
        )
            .into_response()),
        Err(_) => Err(ApiError::not_found("no analysis report generated")),
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn health_handler(State(app): State<Arc<App>>) -> Json<Value> {
    let writable = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(app.data_dir.join(".health_probe"))
        .is_ok();
    let uptime = (chrono::Utc::now() - app.start_time).num_seconds();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_sec": uptime,
        "storage": {
            "data_dir": app.data_dir.display().to_string(),
            "writable": writable,
            "event_count": app.store.count(),
        },
        "scan": {
            "local_detection_enabled": app.config.snapshot().detection.local_detection_enabled,
            "last_scan": app.last_scan.read().clone(),
        },
        "sse_clients": app.broadcaster.client_count(),
    }))
}

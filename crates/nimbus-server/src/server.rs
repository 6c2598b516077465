//! Axum routes for the ingestion API

use crate::service::IngestionService;
use crate::sse;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use nimbus_core::types::wire_timestamp;
use nimbus_core::{NimbusError, TelemetryRequest};
use nimbus_storage::{ClientFilter, EventFilter};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

const DEFAULT_LIMIT: i64 = 100;

/// Shared application state
pub struct AppState {
    pub service: IngestionService,
    pub api_key: String,
}

pub type SharedState = Arc<AppState>;

/// Build the full API router
pub fn router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/api/telemetry", get(list_events).post(ingest))
        .route("/api/telemetry/stream", get(sse::sse_handler))
        .route("/api/clients", get(list_clients))
        .route("/api/clients/:client_id", get(client_details))
        .route("/api/stats", get(statistics))
        .route("/api/deployment-phases", get(phases))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body shared by every failing endpoint
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "Bad Request",
            message: message.into(),
        }
    }
}

impl From<NimbusError> for ApiError {
    fn from(err: NimbusError) -> Self {
        match err {
            NimbusError::Validation(message) => Self::bad_request(message),
            NimbusError::NotFound(message) => Self {
                status: StatusCode::NOT_FOUND,
                error: "Not Found",
                message,
            },
            other => {
                error!("Request failed: {}", other);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: "Internal Server Error",
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

async fn require_api_key(State(app): State<SharedState>, request: Request, next: Next) -> Response {
    if app.api_key.is_empty() {
        error!("Server API key is not configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Server configuration error",
                "message": "API key not configured",
            })),
        )
            .into_response();
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(app.api_key.as_str()) {
        warn!("Rejected request to {} with invalid API key", request.uri().path());
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "Invalid or missing API key",
            })),
        )
            .into_response();
    }

    next.run(request).await
}

/// POST /api/telemetry
async fn ingest(
    State(app): State<SharedState>,
    body: Result<Json<TelemetryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let event_id = app.service.ingest(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Telemetry data received",
            "event_id": event_id,
        })),
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct EventQuery {
    client_id: Option<String>,
    phase_name: Option<String>,
    status: Option<String>,
    from_date: Option<String>,
    to_date: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

fn parse_date(raw: Option<String>, name: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    match raw.filter(|s| !s.is_empty()) {
        Some(raw) => wire_timestamp::parse(&raw)
            .map(Some)
            .map_err(|e| ApiError::bad_request(format!("{}: {}", name, e))),
        None => Ok(None),
    }
}

/// GET /api/telemetry
async fn list_events(
    State(app): State<SharedState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = EventFilter {
        client_id: query.client_id.filter(|s| !s.is_empty()),
        phase_name: query.phase_name.filter(|s| !s.is_empty()),
        status: query.status.filter(|s| !s.is_empty()),
        from: parse_date(query.from_date, "from_date")?,
        to: parse_date(query.to_date, "to_date")?,
        limit: query.limit.unwrap_or(DEFAULT_LIMIT),
        offset: query.offset.unwrap_or(0),
    };
    let events = app.service.list_events(&filter).await?;

    Ok(Json(json!({
        "events": events,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ClientQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/clients
async fn list_clients(
    State(app): State<SharedState>,
    Query(query): Query<ClientQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = ClientFilter {
        status: query.status.filter(|s| !s.is_empty()),
        limit: query.limit.unwrap_or(DEFAULT_LIMIT),
        offset: query.offset.unwrap_or(0),
    };
    let page = app.service.list_clients(&filter).await?;

    Ok(Json(json!({
        "clients": page.clients,
        "total": page.total,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

/// GET /api/clients/:client_id
async fn client_details(
    State(app): State<SharedState>,
    Path(client_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (client, events) = app
        .service
        .client_details(&client_id)
        .await
        .map_err(|e| match e {
            NimbusError::NotFound(_) => NimbusError::NotFound("Client not found".to_string()),
            other => other,
        })?;

    Ok(Json(json!({ "client": client, "events": events })))
}

/// GET /api/stats
async fn statistics(State(app): State<SharedState>) -> Result<Response, ApiError> {
    let stats = app.service.statistics().await?;
    Ok(Json(stats).into_response())
}

/// GET /api/deployment-phases
async fn phases(State(app): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let phases = app.service.phases().await?;
    Ok(Json(json!({ "phases": phases })))
}

/// GET /api/health
async fn health(State(app): State<SharedState>) -> Response {
    let timestamp = Utc::now().format(wire_timestamp::FORMAT).to_string();
    match app.service.health().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "database": "connected",
            "timestamp": timestamp,
        }))
        .into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "disconnected",
                    "error": e.to_string(),
                    "timestamp": timestamp,
                })),
            )
                .into_response()
        }
    }
}

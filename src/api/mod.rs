//! HTTP API
//!
//! JSON endpoints over [`TelemetryQueries`] and the shard topology. Every
//! response carries a `status` of `success` or `error`; errors add a
//! `message`.

mod handlers;
mod telemetry;

use crate::query::TelemetryQueries;
use crate::sharding::ShardConnectionManager;
use crate::Error;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub http_port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            http_port: 5000,
            enable_cors: true,
        }
    }
}

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub queries: TelemetryQueries,
    pub manager: Arc<ShardConnectionManager>,
}

/// Build the HTTP API router
pub fn build_http_router(state: ApiState, config: &ApiServerConfig) -> Router {
    use axum::middleware;
    use axum::routing::{get, post};
    use tower_http::cors::{Any, CorsLayer};

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/sensor_data", post(handlers::sensor_data))
        .route("/api/v1/sensor_count", post(handlers::sensor_count))
        .route("/api/v1/search", post(handlers::search))
        .route("/api/v1/summary", get(handlers::summary))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/distribution", get(handlers::distribution))
        .with_state(state)
        .layer(middleware::from_fn(telemetry::http_observability_middleware));

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Successful response body: `status` plus the flattened payload
#[derive(Debug, Serialize)]
pub struct Success<T> {
    status: &'static str,
    #[serde(flatten)]
    body: T,
}

impl<T: Serialize> Success<T> {
    pub fn new(body: T) -> Json<Self> {
        Json(Self {
            status: "success",
            body,
        })
    }
}

/// Error response carrying the HTTP status derived from the error kind
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Config(format!(
            "invalid request body: {}",
            rejection.body_text()
        )))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::Config(format!(
            "invalid query string: {}",
            rejection.body_text()
        )))
    }
}

/// [`Json`] extractor whose rejections use the error envelope
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

/// [`Query`](axum::extract::Query) extractor whose rejections use the error
/// envelope
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct QueryParams<T>(pub T);

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::UnknownLocation(_)
            | Error::MalformedKey(_)
            | Error::UnknownUnit(_)
            | Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::SeriesNotFound(_) => StatusCode::NOT_FOUND,
            Error::LocationUnavailable(_)
            | Error::ShardUnreachable { .. }
            | Error::ShardReadOnly { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::QueryTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({
                "status": "error",
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

//! Request handlers

use super::{ApiError, ApiState, JsonBody, QueryParams, Success};
use crate::query::TimeRange;
use crate::sharding::{compute_distribution, SensorType};
use crate::Error;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

fn default_sensor_id() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct SensorDataRequest {
    pub sensor_type: SensorType,
    pub location: String,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default = "default_sensor_id")]
    pub sensor_id: u32,
}

pub async fn sensor_data(
    State(state): State<ApiState>,
    JsonBody(request): JsonBody<SensorDataRequest>,
) -> Result<Response, ApiError> {
    let data = state
        .queries
        .sensor_data(
            request.sensor_type,
            &request.location,
            request.sensor_id,
            request.time_range,
        )
        .await?;
    Ok(Success::new(data).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SensorCountRequest {
    pub location: String,
    #[serde(default)]
    pub sensor_type: Option<SensorType>,
}

pub async fn sensor_count(
    State(state): State<ApiState>,
    JsonBody(request): JsonBody<SensorCountRequest>,
) -> Result<Response, ApiError> {
    let report = state
        .queries
        .sensor_counts(&request.location, request.sensor_type)
        .await?;
    Ok(Success::new(report).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

pub async fn search(
    State(state): State<ApiState>,
    JsonBody(request): JsonBody<SearchRequest>,
) -> Result<Response, ApiError> {
    if request.query.trim().is_empty() {
        return Err(Error::Config("search query cannot be empty".to_string()).into());
    }
    let report = state.queries.search(request.query.trim()).await;
    Ok(Success::new(report).into_response())
}

fn default_hours() -> u64 {
    1
}

/// Either `unit`, or `location` with an optional `type`
#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    pub unit: Option<String>,
    pub location: Option<String>,
    #[serde(rename = "type")]
    pub sensor_type: Option<SensorType>,
    #[serde(default = "default_hours")]
    pub hours: u64,
}

pub async fn summary(
    State(state): State<ApiState>,
    QueryParams(params): QueryParams<SummaryParams>,
) -> Result<Response, ApiError> {
    let report = match (params.unit, params.location) {
        (Some(unit), None) => {
            state
                .queries
                .query_by_unit(&unit, params.sensor_type, params.hours)
                .await?
        }
        (None, Some(location)) => {
            state
                .queries
                .query_location(&location, params.sensor_type, params.hours)
                .await?
        }
        _ => {
            return Err(Error::Config(
                "specify exactly one of 'unit' or 'location'".to_string(),
            )
            .into())
        }
    };
    Ok(Success::new(report).into_response())
}

pub async fn status(State(state): State<ApiState>) -> Response {
    let shards = state.manager.probe_all().await;
    Success::new(serde_json::json!({ "shards": shards })).into_response()
}

pub async fn distribution(State(state): State<ApiState>) -> Response {
    let router = state.queries.router();
    let report = compute_distribution(router, router.registry()).await;
    Success::new(report).into_response()
}

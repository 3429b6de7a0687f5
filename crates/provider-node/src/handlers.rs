//! Read-only status API handlers

use crate::jobs::JobRunner;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use provider_common::ApiDefinition;
use provider_ledger::{ApiStat, Earning, EarningsRange, Job, JobStatus, LedgerStore};
use provider_registrar::{PairStatus, Registrar};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub runner: Arc<JobRunner>,
    /// Absent when the node runs without aggregators wired in (tests, tooling)
    pub registrar: Option<Arc<Registrar>>,
    pub apis: Vec<ApiDefinition>,
    pub provider_address: String,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<provider_common::Error> for ApiError {
    fn from(err: provider_common::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

/// Health check endpoint
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "provider-node",
        "provider_address": state.provider_address,
        "ledger": state.store.backend(),
        "apis": state.apis.len(),
        "handlers": state.runner.handler_ids()
    }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub stats: Vec<ApiStat>,
    pub total_earned: u64,
}

/// Per-API counters plus the overall earnings total
pub async fn list_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.get_all_api_stats().await?;
    let total_earned = state.store.get_total_earnings().await?;

    Ok(Json(StatsResponse {
        stats,
        total_earned,
    }))
}

pub async fn get_stat_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
) -> Result<Json<ApiStat>, ApiError> {
    match state.store.get_api_stat(&api_id).await? {
        Some(stat) => Ok(Json(stat)),
        None => Err(ApiError::not_found(format!("No stats for API: {}", api_id))),
    }
}

pub async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.store.get_job(&job_id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::not_found(format!("Job not found: {}", job_id))),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobsListResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
}

const DEFAULT_JOB_LIMIT: usize = 50;
const MAX_JOB_LIMIT: usize = 500;

/// Recent jobs for one API, optionally filtered by status
pub async fn list_api_jobs_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).min(MAX_JOB_LIMIT);

    let jobs = match query.status.as_deref() {
        Some(raw) => {
            let status: JobStatus = raw.parse().map_err(ApiError::bad_request)?;
            // Filter the full API history; status lists span every API
            state
                .store
                .list_jobs_by_api(&api_id, usize::MAX)
                .await?
                .into_iter()
                .filter(|job| job.status == status)
                .take(limit)
                .collect()
        }
        None => state.store.list_jobs_by_api(&api_id, limit).await?,
    };

    let total = jobs.len();
    Ok(Json(JobsListResponse { jobs, total }))
}

#[derive(Debug, Deserialize)]
pub struct EarningsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EarningsResponse {
    pub earnings: Vec<Earning>,
    /// Sum over the returned range
    pub total: u64,
}

fn parse_timestamp(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ApiError::bad_request(format!("Invalid {} timestamp: {}", name, e)))
    })
    .transpose()
}

/// Earnings in `[from, to)`, both RFC 3339 and optional
pub async fn list_earnings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EarningsQuery>,
) -> Result<Json<EarningsResponse>, ApiError> {
    let range = EarningsRange {
        from: parse_timestamp("from", query.from.as_deref())?,
        to: parse_timestamp("to", query.to.as_deref())?,
    };

    let earnings = state.store.get_earnings(range).await?;
    let total = earnings.iter().map(|e| e.amount).sum();

    Ok(Json(EarningsResponse { earnings, total }))
}

#[derive(Debug, Serialize)]
pub struct QueuePositionResponse {
    pub api_id: String,
    pub position: u64,
}

pub async fn queue_position_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
) -> Result<Json<QueuePositionResponse>, ApiError> {
    let position = state.store.get_queue_position(&api_id).await?;
    Ok(Json(QueuePositionResponse { api_id, position }))
}

#[derive(Debug, Serialize)]
pub struct RegistrationsResponse {
    pub provider_address: String,
    pub registration_complete: bool,
    pub pairs: Vec<PairStatus>,
}

/// State of every (aggregator, API) pair
pub async fn registrations_handler(
    State(state): State<Arc<AppState>>,
) -> Json<RegistrationsResponse> {
    let (registration_complete, pairs) = match &state.registrar {
        Some(registrar) => (registrar.registration_complete(), registrar.states()),
        None => (false, Vec::new()),
    };

    Json(RegistrationsResponse {
        provider_address: state.provider_address.clone(),
        registration_complete,
        pairs,
    })
}

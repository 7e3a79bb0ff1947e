use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::models::error::AppError;
use crate::models::forecast::{self, ForecastEntry, ForecastResponse, PredictionEnvelope};
use crate::models::tasks::{PredictionTask, TaskSource, TaskType};
use crate::services::normalizer;
use crate::services::prediction::{ForecastInput, PredictionRequest, PredictionService};
use crate::AppState;

// ---------------------------------------------------------------------------
// POST /api/day_prediction, /api/month_prediction
// ---------------------------------------------------------------------------

pub async fn day_prediction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    run_prediction(&state, TaskType::Daily, &headers, &body).await
}

pub async fn month_prediction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    run_prediction(&state, TaskType::Monthly, &headers, &body).await
}

async fn run_prediction(
    state: &AppState,
    task_type: TaskType,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let envelope: PredictionEnvelope = serde_json::from_slice(body)
        .map_err(|e| AppError::ValidationError(format!("Invalid request body: {}", e)))?;
    let start_date = forecast::parse_start_date(&envelope.data.start_date)?;
    let image_paths = envelope.data.image_paths;
    PredictionService::validate_count(task_type, image_paths.len())?;

    // Every input must open before a task record exists.
    let images = tokio::task::spawn_blocking(move || normalizer::open_images(&image_paths))
        .await
        .map_err(|e| AppError::Internal(format!("Image loader failed: {}", e)))??;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let outcome = state
        .predictions
        .run(PredictionRequest {
            task_type,
            start_date,
            source: TaskSource::Api,
            input: ForecastInput::Images(images),
            idempotency_key,
        })
        .await?;

    let data = dated_entries(&outcome.task, &state.config.host_prefix, |i| {
        forecast::output_label(task_type, outcome.task.start_date, i)
    })?;

    if outcome.reused {
        tracing::debug!(task_id = outcome.task.id, "Served stored forecast for idempotency key");
    }

    let mut response = Json(ForecastResponse { data }).into_response();
    if let Ok(value) = HeaderValue::from_str(&outcome.task.id.to_string()) {
        response.headers_mut().insert("X-Task-Id", value);
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// GET /api/realtime_day_prediction, /api/realtime_month_prediction
// ---------------------------------------------------------------------------

pub async fn realtime_day_prediction(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ForecastResponse>, AppError> {
    latest_scheduled(&state, TaskType::Daily)
}

pub async fn realtime_month_prediction(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ForecastResponse>, AppError> {
    latest_scheduled(&state, TaskType::Monthly)
}

fn latest_scheduled(state: &AppState, task_type: TaskType) -> Result<Json<ForecastResponse>, AppError> {
    let task = state
        .tasks
        .latest_completed(task_type, TaskSource::Scheduled)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "No completed {} prediction task found",
                task_type.label()
            ))
        })?;

    let data = dated_entries(&task, &state.config.host_prefix, |i| {
        forecast::realtime_label(task_type, task.start_date, i)
    })?;
    Ok(Json(ForecastResponse { data }))
}

fn dated_entries(
    task: &PredictionTask,
    host_prefix: &str,
    label: impl Fn(usize) -> Result<String, AppError>,
) -> Result<Vec<ForecastEntry>, AppError> {
    task.result_urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            Ok(ForecastEntry {
                path: format!("{}{}", host_prefix, url),
                date: label(i)?,
            })
        })
        .collect()
}

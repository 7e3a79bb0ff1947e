//! Request/response shapes and calendar arithmetic for forecast endpoints.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::error::AppError;
use crate::models::tasks::TaskType;

pub const START_DATE_FORMAT: &str = "%Y/%m/%d";

#[derive(Debug, Deserialize)]
pub struct PredictionEnvelope {
    pub data: PredictionParams,
}

#[derive(Debug, Deserialize)]
pub struct PredictionParams {
    pub start_date: String,
    #[serde(default)]
    pub image_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastEntry {
    pub path: String,
    pub date: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub data: Vec<ForecastEntry>,
}

pub fn parse_start_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), START_DATE_FORMAT).map_err(|e| {
        AppError::ValidationError(format!(
            "Invalid start_date '{}', expected YYYY/MM/DD: {}",
            raw, e
        ))
    })
}

/// Moves `start` forward by `steps` days or calendar months. Month steps clamp
/// the day to the end of shorter months.
pub fn shift(task_type: TaskType, start: NaiveDate, steps: usize) -> Result<NaiveDate, AppError> {
    let shifted = match task_type {
        TaskType::Daily => start.checked_add_days(Days::new(steps as u64)),
        TaskType::Monthly => u32::try_from(steps)
            .ok()
            .and_then(|m| start.checked_add_months(Months::new(m))),
    };
    shifted.ok_or_else(|| {
        AppError::ValidationError(format!("Date {} + {} steps is out of range", start, steps))
    })
}

pub fn format_label(task_type: TaskType, date: NaiveDate) -> String {
    match task_type {
        TaskType::Daily => date.format("%Y-%m-%d").to_string(),
        TaskType::Monthly => date.format("%Y-%m").to_string(),
    }
}

/// Last day covered by a task started at `start`.
pub fn end_date(task_type: TaskType, start: NaiveDate) -> Result<NaiveDate, AppError> {
    match task_type {
        TaskType::Daily => shift(task_type, start, task_type.horizon() - 1),
        TaskType::Monthly => shift(task_type, start, task_type.horizon()),
    }
}

/// Label for forecast step `step` of a request started at `start`.
pub fn output_label(task_type: TaskType, start: NaiveDate, step: usize) -> Result<String, AppError> {
    Ok(format_label(task_type, shift(task_type, start, step + 1)?))
}

/// Label for the `index`-th stored result of a scheduled task: the window right
/// after the task's own input window.
pub fn realtime_label(task_type: TaskType, start: NaiveDate, index: usize) -> Result<String, AppError> {
    Ok(format_label(
        task_type,
        shift(task_type, start, index + task_type.horizon())?,
    ))
}

/// Calendar month numbers (1..=12) of `count` consecutive months from `start`.
pub fn input_months(start: NaiveDate, count: usize) -> Vec<i64> {
    (0..count)
        .map(|i| ((start.month0() as usize + i) % 12 + 1) as i64)
        .collect()
}

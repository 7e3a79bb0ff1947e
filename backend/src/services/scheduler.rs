//! Periodic producer of SCHEDULED prediction tasks.
//!
//! Inbox directories hold one frame per file named by its date (`YYYYMMDD` for
//! daily frames, `YYYYMM` for monthly ones). With gridded input enabled a single
//! `<date>.stack.nc` file may instead carry a whole window starting at that date.
//! Each pass forecasts from the newest window unless a scheduled task was already
//! started for it; failed windows are not retried.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::models::error::AppError;
use crate::models::forecast;
use crate::models::tasks::{PredictionTask, TaskSource, TaskType};
use crate::services::normalizer;
use crate::services::prediction::{ForecastInput, PredictionRequest};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Image,
    #[cfg(feature = "netcdf")]
    Gridded,
    /// One gridded file holding every frame of the window.
    #[cfg(feature = "netcdf")]
    GriddedStack,
}

/// Stem suffix marking a gridded file that holds a whole window.
#[cfg(feature = "netcdf")]
pub const STACK_SUFFIX: &str = ".stack";

impl FrameKind {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(FrameKind::Image),
            #[cfg(feature = "netcdf")]
            "nc" => Some(FrameKind::Gridded),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ScheduledBatch {
    pub task_type: TaskType,
    pub start_date: NaiveDate,
    pub kind: FrameKind,
    pub paths: Vec<PathBuf>,
}

pub fn parse_frame_date(task_type: TaskType, stem: &str) -> Option<NaiveDate> {
    if !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match (task_type, stem.len()) {
        (TaskType::Daily, 8) => NaiveDate::parse_from_str(stem, "%Y%m%d").ok(),
        (TaskType::Monthly, 6) => NaiveDate::parse_from_str(&format!("{}01", stem), "%Y%m%d").ok(),
        _ => None,
    }
}

/// Finds the newest window in `dir`: either a full run of consecutive frames or,
/// with gridded input enabled, a stacked file starting no earlier than that run.
pub async fn scan_inbox(dir: &Path, task_type: TaskType) -> Result<Option<ScheduledBatch>, AppError> {
    let mut frames: Vec<(NaiveDate, FrameKind, PathBuf)> = Vec::new();
    #[cfg(feature = "netcdf")]
    let mut stacks: Vec<(NaiveDate, PathBuf)> = Vec::new();

    let mut entries = fs::read_dir(dir).await.map_err(|e| {
        AppError::Io(format!("Failed to read inbox {}: {}", dir.display(), e))
    })?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let (Some(ext), Some(stem)) = (
            path.extension().and_then(|e| e.to_str()),
            path.file_stem().and_then(|s| s.to_str()),
        ) else {
            continue;
        };

        #[cfg(feature = "netcdf")]
        if ext.eq_ignore_ascii_case("nc") {
            if let Some(date) = stem
                .strip_suffix(STACK_SUFFIX)
                .and_then(|s| parse_frame_date(task_type, s))
            {
                stacks.push((date, path));
                continue;
            }
        }

        if let (Some(kind), Some(date)) = (
            FrameKind::from_extension(ext),
            parse_frame_date(task_type, stem),
        ) {
            frames.push((date, kind, path));
        }
    }

    let window = newest_window(dir, task_type, frames)?;

    #[cfg(feature = "netcdf")]
    if let Some((date, path)) = stacks.into_iter().max() {
        if window.as_ref().map_or(true, |w| date >= w.start_date) {
            return Ok(Some(ScheduledBatch {
                task_type,
                start_date: date,
                kind: FrameKind::GriddedStack,
                paths: vec![path],
            }));
        }
    }

    Ok(window)
}

fn newest_window(
    dir: &Path,
    task_type: TaskType,
    mut frames: Vec<(NaiveDate, FrameKind, PathBuf)>,
) -> Result<Option<ScheduledBatch>, AppError> {
    frames.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));
    let Some(&(_, newest_kind, _)) = frames.last() else {
        return Ok(None);
    };
    frames.retain(|(_, kind, _)| *kind == newest_kind);
    frames.dedup_by_key(|(date, _, _)| *date);

    let horizon = task_type.horizon();
    if frames.len() < horizon {
        debug!(
            inbox = %dir.display(),
            frames = frames.len(),
            needed = horizon,
            "Not enough scheduled frames yet"
        );
        return Ok(None);
    }
    let window = frames.split_off(frames.len() - horizon);

    for pair in window.windows(2) {
        if forecast::shift(task_type, pair[0].0, 1)? != pair[1].0 {
            warn!(
                inbox = %dir.display(),
                after = %pair[0].0,
                next = %pair[1].0,
                "Gap in scheduled frames; skipping window"
            );
            return Ok(None);
        }
    }

    Ok(Some(ScheduledBatch {
        task_type,
        start_date: window[0].0,
        kind: newest_kind,
        paths: window.into_iter().map(|(_, _, path)| path).collect(),
    }))
}

#[cfg_attr(not(feature = "netcdf"), allow(unused_variables))]
async fn load_batch(kind: FrameKind, paths: Vec<PathBuf>, variable: String) -> Result<ForecastInput, AppError> {
    tokio::task::spawn_blocking(move || match kind {
        FrameKind::Image => {
            let locators: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            normalizer::open_images(&locators).map(ForecastInput::Images)
        }
        #[cfg(feature = "netcdf")]
        FrameKind::Gridded => {
            normalizer::read_gridded_files(&paths, &variable).map(ForecastInput::Frames)
        }
        #[cfg(feature = "netcdf")]
        FrameKind::GriddedStack => match paths.first() {
            Some(path) => normalizer::read_gridded_file(path, &variable).map(ForecastInput::Frames),
            None => Err(AppError::Internal("Stacked window has no file".to_string())),
        },
    })
    .await
    .map_err(|e| AppError::Internal(format!("Scheduled loader failed: {}", e)))?
}

/// Forecasts from the inbox if its newest window has not been done yet.
pub async fn run_inbox(
    state: &AppState,
    task_type: TaskType,
    dir: &Path,
) -> Result<Option<PredictionTask>, AppError> {
    let Some(batch) = scan_inbox(dir, task_type).await? else {
        return Ok(None);
    };
    if state
        .tasks
        .has_window(task_type, TaskSource::Scheduled, batch.start_date)
    {
        debug!(task_type = task_type.label(), start_date = %batch.start_date, "Scheduled window already attempted");
        return Ok(None);
    }

    let input = load_batch(batch.kind, batch.paths, state.config.gridded_variable.clone()).await?;
    let outcome = state
        .predictions
        .run(PredictionRequest {
            task_type: batch.task_type,
            start_date: batch.start_date,
            source: TaskSource::Scheduled,
            input,
            idempotency_key: None,
        })
        .await?;

    info!(
        task_id = outcome.task.id,
        task_type = task_type.label(),
        start_date = %batch.start_date,
        "Scheduled forecast stored"
    );
    Ok(Some(outcome.task))
}

/// One pass over every configured inbox. Errors are logged, never propagated.
pub async fn run_pending(state: &AppState) {
    let inboxes = [
        (TaskType::Daily, state.config.scheduled_daily_dir.as_deref()),
        (TaskType::Monthly, state.config.scheduled_monthly_dir.as_deref()),
    ];
    for (task_type, dir) in inboxes {
        let Some(dir) = dir else { continue };
        if let Err(e) = run_inbox(state, task_type, Path::new(dir)).await {
            warn!(task_type = task_type.label(), inbox = dir, error = %e, "Scheduled forecast failed");
        }
    }
}

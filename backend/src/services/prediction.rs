use std::io::Cursor;
use std::sync::Arc;

use chrono::NaiveDate;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{Array3, ArrayView2, Axis};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::models::error::AppError;
use crate::models::forecast;
use crate::models::tasks::{PredictionTask, TaskSource, TaskStatus, TaskType};
use crate::services::model_runtime::ForecastModels;
use crate::services::normalizer;
use crate::services::storage::ArtifactStore;
use crate::services::task_store::{KeyClaim, TaskStore};

/// Frames for one prediction, either still-encoded images or an already
/// normalized `(T, H, W)` stack.
pub enum ForecastInput {
    Images(Vec<DynamicImage>),
    Frames(Array3<f32>),
}

impl ForecastInput {
    pub fn frame_count(&self) -> usize {
        match self {
            ForecastInput::Images(images) => images.len(),
            ForecastInput::Frames(frames) => frames.len_of(Axis(0)),
        }
    }
}

pub struct PredictionRequest {
    pub task_type: TaskType,
    pub start_date: NaiveDate,
    pub source: TaskSource,
    pub input: ForecastInput,
    pub idempotency_key: Option<String>,
}

#[derive(Debug)]
pub struct PredictionOutcome {
    pub task: PredictionTask,
    /// True when an earlier task was returned for the same idempotency key.
    pub reused: bool,
}

pub struct PredictionService {
    tasks: Arc<TaskStore>,
    artifacts: Arc<ArtifactStore>,
    models: ForecastModels,
    permits: Semaphore,
}

impl PredictionService {
    pub fn new(
        tasks: Arc<TaskStore>,
        artifacts: Arc<ArtifactStore>,
        models: ForecastModels,
        max_parallel: usize,
    ) -> Self {
        Self {
            tasks,
            artifacts,
            models,
            permits: Semaphore::new(max_parallel.max(1)),
        }
    }

    pub fn models(&self) -> &ForecastModels {
        &self.models
    }

    pub fn validate_count(task_type: TaskType, count: usize) -> Result<(), AppError> {
        if count == task_type.horizon() {
            return Ok(());
        }
        Err(AppError::ValidationError(match task_type {
            TaskType::Daily => "Please provide exactly 14 image paths".to_string(),
            TaskType::Monthly => {
                "Please provide exactly 12 image paths for monthly prediction".to_string()
            }
        }))
    }

    /// Creates the task record, runs inference, stores one artifact per step and
    /// completes the task. Failures after the record exists mark it FAILED.
    pub async fn run(&self, req: PredictionRequest) -> Result<PredictionOutcome, AppError> {
        Self::validate_count(req.task_type, req.input.frame_count())?;

        let end_date = forecast::end_date(req.task_type, req.start_date)?;
        let time_indices = match req.task_type {
            TaskType::Monthly => Some(forecast::input_months(req.start_date, req.task_type.horizon())),
            TaskType::Daily => None,
        };

        // The key is claimed before the first await so concurrent repeats see it.
        let key = req.idempotency_key.as_deref();
        if let Some(key) = key {
            if let KeyClaim::Completed(previous) = self.tasks.claim_idempotency_key(key)? {
                info!(task_id = previous.id, "Returning prediction for repeated idempotency key");
                return Ok(PredictionOutcome { task: previous, reused: true });
            }
        }

        let created = self
            .tasks
            .create_prediction(PredictionTask::new(
                req.start_date,
                end_date,
                req.task_type,
                req.source,
                TaskStatus::InProgress,
            ))
            .await;
        let mut task = match (created, key) {
            (Ok(task), Some(key)) => {
                self.tasks.bind_idempotency_key(key, task.id);
                task
            }
            (Ok(task), None) => task,
            (Err(e), key) => {
                if let Some(key) = key {
                    self.tasks.release_idempotency_key(key);
                }
                return Err(e);
            }
        };
        info!(
            task_id = task.id,
            task_type = req.task_type.label(),
            source = ?req.source,
            start_date = %req.start_date,
            "Prediction task started"
        );

        match self.forecast(req.task_type, req.input, time_indices).await {
            Ok(urls) => {
                task.set_completed(urls);
                let task = self.tasks.save_prediction(task).await?;
                info!(task_id = task.id, steps = task.result_urls.len(), "Prediction task completed");
                Ok(PredictionOutcome { task, reused: false })
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Prediction task failed");
                task.set_failed(e.to_string());
                let task_id = task.id;
                if let Err(save_err) = self.tasks.save_prediction(task).await {
                    error!(task_id, error = %save_err, "Failed to record task failure");
                }
                Err(e)
            }
        }
    }

    async fn forecast(
        &self,
        task_type: TaskType,
        input: ForecastInput,
        time_indices: Option<Vec<i64>>,
    ) -> Result<Vec<String>, AppError> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            AppError::Internal("Prediction semaphore closed".to_string())
        })?;

        let model = self.models.for_task(task_type);
        let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>, AppError> {
            let frames = match input {
                ForecastInput::Images(images) => normalizer::images_to_frames(&images)?,
                ForecastInput::Frames(frames) => frames,
            };
            let output = model.infer(&frames, time_indices.as_deref())?;
            output.outer_iter().map(encode_frame_png).collect()
        })
        .await
        .map_err(|e| AppError::Internal(format!("Prediction worker failed: {}", e)))??;

        let mut urls = Vec::with_capacity(encoded.len());
        for png in encoded {
            let stored = self.artifacts.store_prediction(&png).await?;
            urls.push(stored.url);
        }
        Ok(urls)
    }
}

/// Encodes one concentration map as an 8-bit grayscale PNG (inverse of the image
/// adapter). Values are clamped to `[0, 1]`; NaN becomes 0.
pub fn encode_frame_png(frame: ArrayView2<f32>) -> Result<Vec<u8>, AppError> {
    let (h, w) = frame.dim();
    let gray = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = frame[[y as usize, x as usize]];
        let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Luma([(v * 255.0).round() as u8])
    });

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray)
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| AppError::Internal(format!("PNG encode error: {}", e)))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, FailingModel, PersistenceModel};

    async fn service(dir: &std::path::Path, models: ForecastModels) -> (PredictionService, Arc<TaskStore>) {
        let tasks = Arc::new(TaskStore::open(dir.join("data"), 600).await.unwrap());
        let artifacts = Arc::new(ArtifactStore::new(dir.join("media")).await.unwrap());
        (PredictionService::new(tasks.clone(), artifacts, models, 1), tasks)
    }

    fn frames(count: usize) -> ForecastInput {
        ForecastInput::Frames(Array3::from_elem((count, 2, 2), 0.5))
    }

    fn request(task_type: TaskType, count: usize) -> PredictionRequest {
        PredictionRequest {
            task_type,
            start_date: NaiveDate::from_ymd_opt(2024, 11, 1).unwrap(),
            source: TaskSource::Api,
            input: frames(count),
            idempotency_key: None,
        }
    }

    #[test]
    fn encoded_frames_round_trip_through_the_image_adapter() {
        let frame = ndarray::arr2(&[[0.0f32, 1.0], [f32::NAN, 2.0]]);
        let png = encode_frame_png(frame.view()).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        let back = normalizer::images_to_frames(&[decoded]).unwrap();
        assert_eq!(back[[0, 0, 1]], 1.0);
        assert_eq!(back[[0, 1, 0]], 0.0);
        assert_eq!(back[[0, 1, 1]], 1.0);
    }

    #[tokio::test]
    async fn monthly_run_completes_with_one_url_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let monthly = Arc::new(PersistenceModel::new(TaskType::Monthly));
        let models = ForecastModels {
            daily: Arc::new(PersistenceModel::new(TaskType::Daily)),
            monthly: monthly.clone(),
        };
        let (service, tasks) = service(dir.path(), models).await;

        let outcome = service.run(request(TaskType::Monthly, 12)).await.unwrap();
        assert!(!outcome.reused);
        assert_eq!(outcome.task.status, TaskStatus::Completed);
        assert_eq!(outcome.task.task_type, TaskType::Monthly);
        assert_eq!(outcome.task.result_urls.len(), 12);
        assert_eq!(
            outcome.task.end_date,
            NaiveDate::from_ymd_opt(2025, 11, 1).unwrap()
        );
        assert_eq!(
            monthly.seen_times(),
            vec![vec![11, 12, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]]
        );
        assert_eq!(tasks.prediction(outcome.task.id).unwrap(), outcome.task);
    }

    #[tokio::test]
    async fn wrong_count_creates_no_task() {
        let dir = tempfile::tempdir().unwrap();
        let (service, tasks) = service(dir.path(), test_support::stub_models()).await;

        let err = service.run(request(TaskType::Daily, 13)).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert!(tasks.predictions().is_empty());
    }

    #[tokio::test]
    async fn inference_failure_marks_task_failed() {
        let dir = tempfile::tempdir().unwrap();
        let models = ForecastModels {
            daily: Arc::new(FailingModel),
            monthly: Arc::new(FailingModel),
        };
        let (service, tasks) = service(dir.path(), models).await;

        let err = service.run(request(TaskType::Daily, 14)).await.unwrap_err();
        assert!(matches!(err, AppError::Model(_)));

        let stored = tasks.predictions();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, TaskStatus::Failed);
        assert!(stored[0].error.as_deref().unwrap().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn idempotency_key_reuses_completed_task() {
        let dir = tempfile::tempdir().unwrap();
        let daily = Arc::new(PersistenceModel::new(TaskType::Daily));
        let models = ForecastModels {
            daily: daily.clone(),
            monthly: Arc::new(PersistenceModel::new(TaskType::Monthly)),
        };
        let (service, tasks) = service(dir.path(), models).await;

        let mut first = request(TaskType::Daily, 14);
        first.idempotency_key = Some("batch-1".to_string());
        let first = service.run(first).await.unwrap();

        let mut second = request(TaskType::Daily, 14);
        second.idempotency_key = Some("batch-1".to_string());
        let second = service.run(second).await.unwrap();

        assert!(second.reused);
        assert_eq!(first.task.id, second.task.id);
        assert_eq!(daily.calls(), 1);
        assert_eq!(tasks.predictions().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_repeats_of_one_key_create_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let daily = Arc::new(PersistenceModel::new(TaskType::Daily));
        let models = ForecastModels {
            daily: daily.clone(),
            monthly: Arc::new(PersistenceModel::new(TaskType::Monthly)),
        };
        let (service, tasks) = service(dir.path(), models).await;

        let keyed = || {
            let mut req = request(TaskType::Daily, 14);
            req.idempotency_key = Some("same-key".to_string());
            req
        };
        let (a, b) = tokio::join!(service.run(keyed()), service.run(keyed()));

        let a = a.unwrap();
        assert!(!a.reused);
        match b {
            Err(AppError::Conflict(_)) => {}
            Ok(outcome) => {
                assert!(outcome.reused);
                assert_eq!(outcome.task.id, a.task.id);
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
        assert_eq!(tasks.predictions().len(), 1);
        assert_eq!(daily.calls(), 1);
    }
}

//! Shared fixtures for unit and handler tests.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{Array3, Axis};

use crate::models::config::AppConfig;
use crate::models::error::AppError;
use crate::models::manifest::ModelDescriptor;
use crate::models::tasks::TaskType;
use crate::services::model_runtime::{ForecastModel, ForecastModels};
use crate::services::prediction::PredictionService;
use crate::services::storage::ArtifactStore;
use crate::services::task_store::TaskStore;
use crate::AppState;

/// Repeats the last input frame for every forecast step.
pub struct PersistenceModel {
    task_type: TaskType,
    calls: AtomicUsize,
    seen_times: parking_lot::Mutex<Vec<Vec<i64>>>,
}

impl PersistenceModel {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            calls: AtomicUsize::new(0),
            seen_times: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_times(&self) -> Vec<Vec<i64>> {
        self.seen_times.lock().clone()
    }
}

impl ForecastModel for PersistenceModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            id: format!("persistence-{}", self.task_type.label()),
            name: "Persistence".to_string(),
            description: "Repeats the last observed frame".to_string(),
            task_type: self.task_type,
            horizon: self.task_type.horizon(),
        }
    }

    fn infer(
        &self,
        frames: &Array3<f32>,
        time_indices: Option<&[i64]>,
    ) -> Result<Array3<f32>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(times) = time_indices {
            self.seen_times.lock().push(times.to_vec());
        }
        let (t, h, w) = frames.dim();
        if t == 0 {
            return Err(AppError::Shape("empty frame batch".to_string()));
        }
        let last = frames.index_axis(Axis(0), t - 1);
        let mut out = Array3::<f32>::zeros((self.task_type.horizon(), h, w));
        for mut step in out.outer_iter_mut() {
            step.assign(&last);
        }
        Ok(out)
    }
}

pub struct FailingModel;

impl ForecastModel for FailingModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            id: "failing".to_string(),
            name: "Failing".to_string(),
            description: String::new(),
            task_type: TaskType::Daily,
            horizon: 14,
        }
    }

    fn infer(&self, _frames: &Array3<f32>, _time_indices: Option<&[i64]>) -> Result<Array3<f32>, AppError> {
        Err(AppError::Model("backend unavailable".to_string()))
    }
}

pub fn stub_models() -> ForecastModels {
    ForecastModels {
        daily: Arc::new(PersistenceModel::new(TaskType::Daily)),
        monthly: Arc::new(PersistenceModel::new(TaskType::Monthly)),
    }
}

pub fn test_config(root: &Path) -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        allowed_origins: vec!["http://localhost:3000".to_string()],
        host_prefix: "http://test.local".to_string(),
        media_root: root.join("media").display().to_string(),
        data_dir: root.join("data").display().to_string(),
        models_dir: root.join("models").display().to_string(),
        max_upload_bytes: 1_048_576,
        max_parallel_predictions: 1,
        onnx_intra_threads: 1,
        log_level: "debug".to_string(),
        idempotency_ttl_secs: 600,
        schedule_interval_secs: 0,
        scheduled_daily_dir: None,
        scheduled_monthly_dir: None,
        gridded_variable: "ice_conc".to_string(),
    }
}

pub async fn test_state(root: &Path) -> Arc<AppState> {
    test_state_with_models(root, stub_models()).await
}

pub async fn test_state_with_models(root: &Path, models: ForecastModels) -> Arc<AppState> {
    let config = Arc::new(test_config(root));
    let artifacts = Arc::new(ArtifactStore::new(&config.media_root).await.unwrap());
    let tasks = Arc::new(
        TaskStore::open(&config.data_dir, config.idempotency_ttl_secs)
            .await
            .unwrap(),
    );
    let predictions = PredictionService::new(
        tasks.clone(),
        artifacts.clone(),
        models,
        config.max_parallel_predictions,
    );
    Arc::new(AppState {
        config,
        artifacts,
        tasks,
        predictions,
    })
}

pub fn gray_png_bytes(value: u8) -> Vec<u8> {
    let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([value])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Writes `count` distinct 4x4 frames and returns their paths.
pub fn write_gray_pngs(root: &Path, count: usize) -> Vec<String> {
    let dir = root.join("inputs");
    std::fs::create_dir_all(&dir).unwrap();
    (0..count)
        .map(|i| {
            let path = dir.join(format!("frame_{:02}.png", i));
            std::fs::write(&path, gray_png_bytes((i * 10) as u8)).unwrap();
            path.display().to_string()
        })
        .collect()
}

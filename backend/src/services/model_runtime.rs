use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array3, Axis};

use crate::models::error::AppError;
use crate::models::manifest::{ModelDescriptor, ModelManifest};
use crate::models::tasks::TaskType;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A loaded forecasting model. `frames` is `(T, H, W)` in `[0, 1]`; the result is
/// `(horizon, H, W)`. Implementations must be safe to call from several blocking
/// threads at once.
pub trait ForecastModel: Send + Sync {
    fn descriptor(&self) -> ModelDescriptor;
    fn infer(&self, frames: &Array3<f32>, time_indices: Option<&[i64]>)
        -> Result<Array3<f32>, AppError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ForecastModels {
    pub daily: Arc<dyn ForecastModel>,
    pub monthly: Arc<dyn ForecastModel>,
}

impl ForecastModels {
    /// Loads `daily.json` and `monthly.json` manifests from `models_dir`.
    pub fn load(models_dir: &str, intra_threads: usize) -> anyhow::Result<Self> {
        let dir = Path::new(models_dir);
        let daily = OnnxForecaster::load(&dir.join("daily.json"), TaskType::Daily, intra_threads)?;
        let monthly =
            OnnxForecaster::load(&dir.join("monthly.json"), TaskType::Monthly, intra_threads)?;
        Ok(Self {
            daily: Arc::new(daily),
            monthly: Arc::new(monthly),
        })
    }

    pub fn for_task(&self, task_type: TaskType) -> Arc<dyn ForecastModel> {
        match task_type {
            TaskType::Daily => self.daily.clone(),
            TaskType::Monthly => self.monthly.clone(),
        }
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        vec![self.daily.descriptor(), self.monthly.descriptor()]
    }
}

// ---------------------------------------------------------------------------
// ONNX Runtime provider
// ---------------------------------------------------------------------------

/// One ONNX Runtime session per model. The session is behind a mutex, so
/// concurrent requests run their forward passes one at a time.
pub struct OnnxForecaster {
    session: parking_lot::Mutex<ort::session::Session>,
    manifest: ModelManifest,
}

impl OnnxForecaster {
    pub fn load(manifest_path: &Path, task_type: TaskType, intra_threads: usize) -> anyhow::Result<Self> {
        let json_str = std::fs::read_to_string(manifest_path).map_err(|e| {
            anyhow::anyhow!("Failed to read model manifest {:?}: {}", manifest_path, e)
        })?;
        let manifest: ModelManifest = serde_json::from_str(&json_str).map_err(|e| {
            anyhow::anyhow!("Failed to parse model manifest {:?}: {}", manifest_path, e)
        })?;
        manifest
            .validate(task_type)
            .map_err(|e| anyhow::anyhow!("Invalid model manifest {:?}: {}", manifest_path, e))?;

        let models_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let onnx_path = models_dir.join(&manifest.file);
        if !onnx_path.exists() {
            anyhow::bail!("ONNX file '{}' not found in {:?}", manifest.file, models_dir);
        }

        let session = Self::build_session(&onnx_path, intra_threads)
            .map_err(|e| anyhow::anyhow!("Failed to load ONNX session {:?}: {}", onnx_path, e))?;

        tracing::info!(
            model = %manifest.id,
            task_type = task_type.label(),
            horizon = manifest.horizon,
            "Loaded forecast model from {:?}",
            onnx_path
        );

        Ok(Self {
            session: parking_lot::Mutex::new(session),
            manifest,
        })
    }

    #[cfg(feature = "cuda")]
    fn build_session(onnx_path: &Path, intra_threads: usize) -> ort::Result<ort::session::Session> {
        use ort::execution_providers::CUDAExecutionProvider;

        ort::session::Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_intra_threads(intra_threads))
            .and_then(|b| b.commit_from_file(onnx_path))
    }

    #[cfg(not(feature = "cuda"))]
    fn build_session(onnx_path: &Path, intra_threads: usize) -> ort::Result<ort::session::Session> {
        ort::session::Session::builder()
            .and_then(|b| b.with_intra_threads(intra_threads))
            .and_then(|b| b.commit_from_file(onnx_path))
    }
}

impl ForecastModel for OnnxForecaster {
    fn descriptor(&self) -> ModelDescriptor {
        self.manifest.descriptor()
    }

    fn infer(
        &self,
        frames: &Array3<f32>,
        time_indices: Option<&[i64]>,
    ) -> Result<Array3<f32>, AppError> {
        check_inputs(&self.manifest, frames, time_indices)?;

        let (t, h, w) = frames.dim();
        let batch = frames
            .to_owned()
            .into_shape_with_order((1, t, 1, h, w))
            .map_err(|e| AppError::Shape(format!("cannot batch frames: {}", e)))?;
        let frames_value = ort::value::Tensor::from_array(batch).map_err(|e| {
            AppError::Model(format!("Failed to create ONNX input tensor: {}", e))
        })?;

        let mut session = self.session.lock();
        let outputs = match (&self.manifest.times_input, time_indices) {
            (Some(times_name), Some(times)) => {
                let times_value = ort::value::Tensor::from_array(Array1::from_vec(times.to_vec()))
                    .map_err(|e| {
                        AppError::Model(format!("Failed to create ONNX time tensor: {}", e))
                    })?;
                session.run(ort::inputs![
                    self.manifest.frames_input.as_str() => frames_value,
                    times_name.as_str() => times_value,
                ])
            }
            _ => session.run(ort::inputs![self.manifest.frames_input.as_str() => frames_value]),
        }
        .map_err(|e| AppError::Model(format!("ONNX inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Model(format!("Failed to extract ONNX output: {}", e)))?;
        let shape: Vec<i64> = shape.iter().copied().collect();
        output_to_frames(&shape, data, self.manifest.horizon)
    }
}

/// Validates a frame batch against the manifest before it reaches the graph.
pub fn check_inputs(
    manifest: &ModelManifest,
    frames: &Array3<f32>,
    time_indices: Option<&[i64]>,
) -> Result<(), AppError> {
    let (t, h, w) = frames.dim();
    if t == 0 || h == 0 || w == 0 {
        return Err(AppError::Shape(format!("empty frame batch {:?}", frames.shape())));
    }
    if t != manifest.input_length {
        return Err(AppError::Shape(format!(
            "model '{}' expects {} frames, got {}",
            manifest.id, manifest.input_length, t
        )));
    }
    if let Some([gh, gw]) = manifest.grid {
        if (h, w) != (gh, gw) {
            return Err(AppError::Shape(format!(
                "model '{}' expects {}x{} frames, got {}x{}",
                manifest.id, gw, gh, w, h
            )));
        }
    }
    match (&manifest.times_input, time_indices) {
        (Some(_), None) => Err(AppError::Shape(format!(
            "model '{}' requires calendar month indices",
            manifest.id
        ))),
        (Some(_), Some(times)) if times.len() != t => Err(AppError::Shape(format!(
            "{} time indices for {} frames",
            times.len(),
            t
        ))),
        (None, Some(_)) => Err(AppError::Shape(format!(
            "model '{}' does not take time indices",
            manifest.id
        ))),
        _ => Ok(()),
    }
}

/// Unpacks `(1, horizon, C, H, W)` or `(1, horizon, H, W)` output, keeping channel 0.
pub fn output_to_frames(shape: &[i64], data: &[f32], horizon: usize) -> Result<Array3<f32>, AppError> {
    let dims: Vec<usize> = shape
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<_, _>>()
        .map_err(|_| AppError::Shape(format!("dynamic output shape {:?}", shape)))?;

    let frames = match dims.as_slice() {
        [1, steps, channels, h, w] if *channels >= 1 => {
            let full = ndarray::ArrayView4::from_shape((*steps, *channels, *h, *w), data)
                .map_err(|e| AppError::Shape(format!("output tensor: {}", e)))?;
            full.index_axis(Axis(1), 0).to_owned()
        }
        [1, steps, h, w] => ndarray::ArrayView3::from_shape((*steps, *h, *w), data)
            .map_err(|e| AppError::Shape(format!("output tensor: {}", e)))?
            .to_owned(),
        other => {
            return Err(AppError::Shape(format!("unexpected output shape {:?}", other)));
        }
    };

    if frames.len_of(Axis(0)) != horizon {
        return Err(AppError::Shape(format!(
            "model produced {} steps, expected {}",
            frames.len_of(Axis(0)),
            horizon
        )));
    }
    Ok(frames)
}

use serde::{Deserialize, Serialize};

use crate::models::tasks::TaskType;

/// Highest manifest `schemaVersion` this build understands.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

fn default_frames_input() -> String {
    "frames".to_string()
}

/// JSON sidecar describing an exported forecasting model. Unknown fields are
/// ignored so newer exporters can add metadata without breaking old servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelManifest {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    /// ONNX file, relative to the models directory.
    pub file: String,
    pub input_length: usize,
    pub horizon: usize,
    /// Expected `[height, width]` of every frame, if the graph is fixed-size.
    #[serde(default)]
    pub grid: Option<[usize; 2]>,
    #[serde(default = "default_frames_input")]
    pub frames_input: String,
    /// Name of the calendar-month input; monthly models only.
    #[serde(default)]
    pub times_input: Option<String>,
}

impl ModelManifest {
    pub fn validate(&self, expected: TaskType) -> Result<(), String> {
        if self.schema_version == 0 || self.schema_version > MANIFEST_SCHEMA_VERSION {
            return Err(format!(
                "unsupported manifest schemaVersion {} (supported: 1..={})",
                self.schema_version, MANIFEST_SCHEMA_VERSION
            ));
        }
        if self.task_type != expected {
            return Err(format!(
                "manifest '{}' is for {:?} models, expected {:?}",
                self.id, self.task_type, expected
            ));
        }
        if self.horizon != expected.horizon() || self.input_length != expected.horizon() {
            return Err(format!(
                "manifest '{}' declares {} inputs / {} outputs, expected {} / {}",
                self.id,
                self.input_length,
                self.horizon,
                expected.horizon(),
                expected.horizon()
            ));
        }
        match (expected, &self.times_input) {
            (TaskType::Monthly, None) => {
                Err(format!("monthly manifest '{}' must name timesInput", self.id))
            }
            (TaskType::Daily, Some(_)) => {
                Err(format!("daily manifest '{}' must not declare timesInput", self.id))
            }
            _ => Ok(()),
        }
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            task_type: self.task_type,
            horizon: self.horizon,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub task_type: TaskType,
    pub horizon: usize,
}

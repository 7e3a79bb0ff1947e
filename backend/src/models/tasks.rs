use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DAILY_HORIZON: usize = 14;
pub const MONTHLY_HORIZON: usize = 12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Daily,
    Monthly,
}

impl TaskType {
    /// Number of input frames consumed and forecast steps produced.
    pub fn horizon(self) -> usize {
        match self {
            TaskType::Daily => DAILY_HORIZON,
            TaskType::Monthly => MONTHLY_HORIZON,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskType::Daily => "daily",
            TaskType::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskSource {
    Api,
    Scheduled,
}

/// Common bookkeeping shared by every persisted task table.
pub trait TaskRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> u64;
    fn assign_id(&mut self, id: u64);
    fn created_at(&self) -> DateTime<Utc>;
    fn touch(&mut self);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionTask {
    pub id: u64,
    pub status: TaskStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub task_type: TaskType,
    pub source: TaskSource,
    /// One locator per forecast step, earliest step first.
    #[serde(default)]
    pub result_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PredictionTask {
    pub fn new(
        start_date: NaiveDate,
        end_date: NaiveDate,
        task_type: TaskType,
        source: TaskSource,
        status: TaskStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            status,
            start_date,
            end_date,
            task_type,
            source,
            result_urls: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_completed(&mut self, result_urls: Vec<String>) {
        self.status = TaskStatus::Completed;
        self.result_urls = result_urls;
        self.error = None;
    }

    pub fn set_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
    }
}

impl TaskRecord for PredictionTask {
    fn id(&self) -> u64 {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DynamicGradType {
    /// Sea-ice area.
    #[default]
    Sum,
    /// Sea-ice change.
    Sqrt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicGradTask {
    pub id: u64,
    #[serde(default)]
    pub status: TaskStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub grad_month: i32,
    #[serde(default)]
    pub grad_type: DynamicGradType,
    #[serde(default)]
    pub result_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord for DynamicGradTask {
    fn id(&self) -> u64 {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterGradType {
    /// Sea-ice area.
    #[default]
    Sum,
    /// L2 norm.
    L2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInterpreterTask {
    pub id: u64,
    #[serde(default)]
    pub status: TaskStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub grad_day: i32,
    #[serde(default)]
    pub grad_type: InterpreterGradType,
    #[serde(default)]
    pub result_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord for ModelInterpreterTask {
    fn id(&self) -> u64 {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, info};

use crate::models::error::AppError;
use crate::models::tasks::{
    DynamicGradTask, ModelInterpreterTask, PredictionTask, TaskRecord, TaskSource, TaskStatus,
    TaskType,
};

/// A table of records kept in memory and mirrored to one JSON file.
pub struct Table<T: TaskRecord> {
    path: PathBuf,
    rows: DashMap<u64, T>,
    next_id: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
}

impl<T: TaskRecord> Table<T> {
    pub async fn open(dir: &Path, name: &str) -> anyhow::Result<Self> {
        let path = dir.join(format!("{}.json", name));
        let rows = DashMap::new();
        if fs::try_exists(&path).await? {
            let bytes = fs::read(&path).await?;
            let records: Vec<T> = serde_json::from_slice(&bytes)
                .map_err(|e| anyhow::anyhow!("Corrupt task table {:?}: {}", path, e))?;
            for record in records {
                rows.insert(record.id(), record);
            }
        }
        let next_id = rows.iter().map(|r| *r.key()).max().unwrap_or(0) + 1;
        debug!(table = name, rows = rows.len(), "Task table loaded");

        Ok(Self {
            path,
            rows,
            next_id: AtomicU64::new(next_id),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn insert(&self, mut record: T) -> Result<T, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        record.assign_id(id);
        self.rows.insert(id, record.clone());
        if let Err(e) = self.flush().await {
            self.rows.remove(&id);
            return Err(e);
        }
        Ok(record)
    }

    /// Replaces an existing row. The previous row is restored if the write fails.
    pub async fn update(&self, mut record: T) -> Result<T, AppError> {
        let id = record.id();
        record.touch();
        let previous = match self.rows.get_mut(&id) {
            Some(mut row) => std::mem::replace(row.value_mut(), record.clone()),
            None => return Err(AppError::NotFound(format!("Task not found: {}", id))),
        };
        if let Err(e) = self.flush().await {
            self.rows.insert(id, previous);
            return Err(e);
        }
        Ok(record)
    }

    pub fn get(&self, id: u64) -> Option<T> {
        self.rows.get(&id).map(|r| r.value().clone())
    }

    /// All rows ordered by id.
    pub fn all(&self) -> Vec<T> {
        let mut rows: Vec<T> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.id());
        rows
    }

    /// Newest row, by creation time then id, matching `filter`.
    pub fn latest_where(&self, filter: impl Fn(&T) -> bool) -> Option<T> {
        self.rows
            .iter()
            .filter(|r| filter(r.value()))
            .max_by_key(|r| (r.value().created_at(), *r.key()))
            .map(|r| r.value().clone())
    }

    // The snapshot is taken under the write lock so the last flush always wins.
    async fn flush(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_vec_pretty(&self.all())
            .map_err(|e| AppError::Internal(format!("Failed to serialize tasks: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(|e| {
            AppError::Internal(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            AppError::Internal(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum KeyClaim {
    /// The caller owns the key and must bind or release it.
    Claimed,
    /// An earlier run under this key already finished.
    Completed(PredictionTask),
}

pub struct TaskStore {
    predictions: Table<PredictionTask>,
    dynamic_grad: Table<DynamicGradTask>,
    model_interpreter: Table<ModelInterpreterTask>,
    /// Key -> (task id once created, expiry). `None` marks a reserved key whose
    /// task record is still being written.
    idempotency_keys: DashMap<String, (Option<u64>, DateTime<Utc>)>,
    idempotency_ttl_secs: u64,
}

impl TaskStore {
    pub async fn open(data_dir: impl AsRef<Path>, idempotency_ttl_secs: u64) -> anyhow::Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).await?;
        let store = Self {
            predictions: Table::open(dir, "prediction_tasks").await?,
            dynamic_grad: Table::open(dir, "dynamic_grad_tasks").await?,
            model_interpreter: Table::open(dir, "model_interpreter_tasks").await?,
            idempotency_keys: DashMap::new(),
            idempotency_ttl_secs,
        };
        info!(
            predictions = store.predictions.rows.len(),
            data_dir = %dir.display(),
            "Task store opened"
        );
        Ok(store)
    }

    pub async fn create_prediction(&self, task: PredictionTask) -> Result<PredictionTask, AppError> {
        self.predictions.insert(task).await
    }

    pub async fn save_prediction(&self, task: PredictionTask) -> Result<PredictionTask, AppError> {
        self.predictions.update(task).await
    }

    pub fn prediction(&self, id: u64) -> Option<PredictionTask> {
        self.predictions.get(id)
    }

    pub fn predictions(&self) -> Vec<PredictionTask> {
        self.predictions.all()
    }

    /// Most recently created COMPLETED task of the given type and source.
    pub fn latest_completed(&self, task_type: TaskType, source: TaskSource) -> Option<PredictionTask> {
        self.predictions.latest_where(|t| {
            t.status == TaskStatus::Completed && t.task_type == task_type && t.source == source
        })
    }

    /// True when any task of this type and source was started for `start_date`,
    /// whatever its status.
    pub fn has_window(&self, task_type: TaskType, source: TaskSource, start_date: NaiveDate) -> bool {
        self.predictions.rows.iter().any(|r| {
            let t = r.value();
            t.task_type == task_type && t.source == source && t.start_date == start_date
        })
    }

    /// Claims `key` for a new run. A key bound to a COMPLETED task yields that
    /// task; a key that is reserved or bound to a running task is a conflict.
    /// Expired keys and keys of FAILED tasks are claimed afresh.
    pub fn claim_idempotency_key(&self, key: &str) -> Result<KeyClaim, AppError> {
        let now = Utc::now();
        let expires = now + Duration::seconds(self.idempotency_ttl_secs as i64);
        let mut entry = match self.idempotency_keys.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert((None, expires));
                return Ok(KeyClaim::Claimed);
            }
            Entry::Occupied(occupied) => occupied,
        };

        let (task_id, key_expires) = *entry.get();
        if key_expires > now {
            let previous = match task_id {
                Some(id) => self.predictions.get(id),
                None => {
                    return Err(AppError::Conflict(
                        "A prediction for this idempotency key is still in progress".to_string(),
                    ))
                }
            };
            match previous {
                Some(task) if task.status == TaskStatus::Completed => {
                    return Ok(KeyClaim::Completed(task));
                }
                Some(task) if task.status != TaskStatus::Failed => {
                    return Err(AppError::Conflict(format!(
                        "Prediction task {} for this idempotency key is still in progress",
                        task.id
                    )));
                }
                _ => {}
            }
        }
        entry.insert((None, expires));
        Ok(KeyClaim::Claimed)
    }

    /// Points a claimed key at the task created for it.
    pub fn bind_idempotency_key(&self, key: &str, task_id: u64) {
        if let Some(mut entry) = self.idempotency_keys.get_mut(key) {
            entry.value_mut().0 = Some(task_id);
        }
    }

    /// Drops a claim that never got a task.
    pub fn release_idempotency_key(&self, key: &str) {
        self.idempotency_keys.remove_if(key, |_, (task_id, _)| task_id.is_none());
    }

    pub fn cleanup_expired_keys(&self) {
        let now = Utc::now();
        self.idempotency_keys.retain(|_, (_, expires)| *expires > now);
    }

    pub fn dynamic_grad_tasks(&self) -> &Table<DynamicGradTask> {
        &self.dynamic_grad
    }

    pub fn model_interpreter_tasks(&self) -> &Table<ModelInterpreterTask> {
        &self.model_interpreter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(task_type: TaskType, source: TaskSource, status: TaskStatus) -> PredictionTask {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        PredictionTask::new(start, start, task_type, source, status)
    }

    #[tokio::test]
    async fn ids_increment_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::open(dir.path(), 600).await.unwrap();
            let a = store
                .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::InProgress))
                .await
                .unwrap();
            let mut b = store
                .create_prediction(task(TaskType::Monthly, TaskSource::Api, TaskStatus::InProgress))
                .await
                .unwrap();
            assert_eq!((a.id, b.id), (1, 2));
            b.set_completed(vec!["/media/predictions/x.png".to_string()]);
            store.save_prediction(b).await.unwrap();
        }

        let store = TaskStore::open(dir.path(), 600).await.unwrap();
        let reloaded = store.prediction(2).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Completed);
        assert_eq!(reloaded.result_urls.len(), 1);
        let c = store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(c.id, 3);
    }

    #[tokio::test]
    async fn latest_completed_filters_type_source_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 600).await.unwrap();
        assert!(store.latest_completed(TaskType::Daily, TaskSource::Scheduled).is_none());

        store
            .create_prediction(task(TaskType::Daily, TaskSource::Scheduled, TaskStatus::Completed))
            .await
            .unwrap();
        let newer = store
            .create_prediction(task(TaskType::Daily, TaskSource::Scheduled, TaskStatus::Completed))
            .await
            .unwrap();
        store
            .create_prediction(task(TaskType::Daily, TaskSource::Scheduled, TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::Completed))
            .await
            .unwrap();

        let latest = store.latest_completed(TaskType::Daily, TaskSource::Scheduled).unwrap();
        assert_eq!(latest.id, newer.id);
        assert!(store.latest_completed(TaskType::Monthly, TaskSource::Scheduled).is_none());
    }

    #[tokio::test]
    async fn updating_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 600).await.unwrap();
        let mut ghost = task(TaskType::Daily, TaskSource::Api, TaskStatus::Pending);
        ghost.id = 42;
        assert!(matches!(
            store.save_prediction(ghost).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn idempotency_keys_expire() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 0).await.unwrap();
        let t = store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(store.claim_idempotency_key("abc"), Ok(KeyClaim::Claimed)));
        store.bind_idempotency_key("abc", t.id);
        assert!(matches!(store.claim_idempotency_key("abc"), Ok(KeyClaim::Claimed)));
    }

    #[tokio::test]
    async fn reserved_key_conflicts_until_its_task_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 600).await.unwrap();

        assert!(matches!(store.claim_idempotency_key("abc"), Ok(KeyClaim::Claimed)));
        assert!(matches!(
            store.claim_idempotency_key("abc"),
            Err(AppError::Conflict(_))
        ));

        let mut running = store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::InProgress))
            .await
            .unwrap();
        store.bind_idempotency_key("abc", running.id);
        assert!(matches!(
            store.claim_idempotency_key("abc"),
            Err(AppError::Conflict(_))
        ));

        running.set_completed(vec!["/media/predictions/x.png".to_string()]);
        store.save_prediction(running.clone()).await.unwrap();
        match store.claim_idempotency_key("abc").unwrap() {
            KeyClaim::Completed(done) => assert_eq!(done.id, running.id),
            other => panic!("unexpected claim {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_task_and_released_keys_can_be_claimed_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 600).await.unwrap();

        assert!(matches!(store.claim_idempotency_key("k"), Ok(KeyClaim::Claimed)));
        store.release_idempotency_key("k");
        assert!(matches!(store.claim_idempotency_key("k"), Ok(KeyClaim::Claimed)));

        let mut failed = store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::InProgress))
            .await
            .unwrap();
        store.bind_idempotency_key("k", failed.id);
        failed.set_failed("boom".to_string());
        store.save_prediction(failed).await.unwrap();
        assert!(matches!(store.claim_idempotency_key("k"), Ok(KeyClaim::Claimed)));
    }

    #[tokio::test]
    async fn failed_writes_leave_no_trace_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 600).await.unwrap();
        let kept = store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::InProgress))
            .await
            .unwrap();

        // A directory at the temp path makes every flush fail.
        let blocker = dir.path().join("prediction_tasks.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let err = store
            .create_prediction(task(TaskType::Daily, TaskSource::Api, TaskStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(store.predictions().len(), 1);

        let mut changed = kept.clone();
        changed.set_completed(vec!["/media/predictions/y.png".to_string()]);
        assert!(store.save_prediction(changed).await.is_err());
        assert_eq!(store.prediction(kept.id).unwrap().status, TaskStatus::InProgress);

        std::fs::remove_dir(&blocker).unwrap();
        let reopened = TaskStore::open(dir.path(), 600).await.unwrap();
        assert_eq!(reopened.predictions(), vec![kept]);
    }

    #[tokio::test]
    async fn window_lookup_ignores_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path(), 600).await.unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(!store.has_window(TaskType::Daily, TaskSource::Scheduled, start));

        store
            .create_prediction(task(TaskType::Daily, TaskSource::Scheduled, TaskStatus::Failed))
            .await
            .unwrap();
        assert!(store.has_window(TaskType::Daily, TaskSource::Scheduled, start));
        assert!(!store.has_window(TaskType::Monthly, TaskSource::Scheduled, start));
        assert!(!store.has_window(TaskType::Daily, TaskSource::Api, start));
    }
}

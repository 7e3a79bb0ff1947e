use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::models::error::AppError;
use crate::models::tasks::{DynamicGradTask, ModelInterpreterTask, PredictionTask};
use crate::AppState;

#[derive(Serialize)]
pub struct TaskList<T> {
    pub data: Vec<T>,
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<u64>,
) -> Result<Json<PredictionTask>, AppError> {
    match state.tasks.prediction(task_id) {
        Some(task) => Ok(Json(task)),
        None => Err(AppError::NotFound(format!("Task not found: {}", task_id))),
    }
}

pub async fn list_dynamic_grad_tasks(
    State(state): State<Arc<AppState>>,
) -> Json<TaskList<DynamicGradTask>> {
    Json(TaskList {
        data: state.tasks.dynamic_grad_tasks().all(),
    })
}

pub async fn list_model_interpreter_tasks(
    State(state): State<Arc<AppState>>,
) -> Json<TaskList<ModelInterpreterTask>> {
    Json(TaskList {
        data: state.tasks.model_interpreter_tasks().all(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::{NaiveDate, Utc};

    use crate::models::tasks::{
        DynamicGradTask, DynamicGradType, PredictionTask, TaskSource, TaskStatus, TaskType,
    };
    use crate::test_support::test_state;

    #[tokio::test]
    async fn task_lookup_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let server = TestServer::new(crate::build_router(state.clone())).unwrap();

        server.get("/api/tasks/7").await.assert_status(StatusCode::NOT_FOUND);

        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let task = state
            .tasks
            .create_prediction(PredictionTask::new(
                start,
                start,
                TaskType::Daily,
                TaskSource::Api,
                TaskStatus::InProgress,
            ))
            .await
            .unwrap();

        let body: serde_json::Value = server.get(&format!("/api/tasks/{}", task.id)).await.json();
        assert_eq!(body["status"], "IN_PROGRESS");
        assert_eq!(body["taskType"], "DAILY");
        assert_eq!(body["startDate"], "2024-03-01");
    }

    #[tokio::test]
    async fn analysis_tables_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let server = TestServer::new(crate::build_router(state.clone())).unwrap();

        let empty: serde_json::Value = server.get("/api/model_interpreter_tasks").await.json();
        assert_eq!(empty["data"], serde_json::json!([]));

        let now = Utc::now();
        state
            .tasks
            .dynamic_grad_tasks()
            .insert(DynamicGradTask {
                id: 0,
                status: TaskStatus::Completed,
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
                grad_month: 3,
                grad_type: DynamicGradType::Sqrt,
                result_urls: vec!["/media/grad/1.png".to_string()],
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let listed: serde_json::Value = server.get("/api/dynamic_grad_tasks").await.json();
        assert_eq!(listed["data"][0]["id"], 1);
        assert_eq!(listed["data"][0]["gradType"], "sqrt");
    }
}

mod handlers;
mod models;
mod services;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use axum::{
    Router,
    middleware,
    extract::Request,
    http::Method,
    response::Response,
    body::Body,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use models::config::AppConfig;
use services::model_runtime::ForecastModels;
use services::prediction::PredictionService;
use services::storage::{ArtifactStore, MEDIA_URL_PREFIX};
use services::task_store::TaskStore;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub artifacts: Arc<ArtifactStore>,
    pub tasks: Arc<TaskStore>,
    pub predictions: PredictionService,
}

async fn request_id_middleware(
    request: Request<Body>,
    next: axum::middleware::Next,
) -> Response {
    let mut response = next.run(request).await;
    // Error responses already carry the id quoted in their body.
    if !response.headers().contains_key("X-Request-Id") {
        let request_id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("X-Request-Id", value);
        }
    }
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors_origins: Vec<_> = state.config.allowed_origins.iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("idempotency-key"),
            axum::http::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            axum::http::HeaderName::from_static("x-request-id"),
            axum::http::HeaderName::from_static("x-task-id"),
        ]);

    let api = Router::new()
        .route("/day_prediction", post(handlers::predictions::day_prediction))
        .route("/month_prediction", post(handlers::predictions::month_prediction))
        .route("/realtime_day_prediction", get(handlers::predictions::realtime_day_prediction))
        .route("/realtime_month_prediction", get(handlers::predictions::realtime_month_prediction))
        .route("/upload_image", post(handlers::files::upload_image))
        .route("/tasks/:task_id", get(handlers::tasks::get_task))
        .route("/dynamic_grad_tasks", get(handlers::tasks::list_dynamic_grad_tasks))
        .route("/model_interpreter_tasks", get(handlers::tasks::list_model_interpreter_tasks))
        .route("/health", get(handlers::health::health_check))
        .route("/version", get(handlers::health::version));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<Body>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_response(|response: &Response, latency: std::time::Duration, _span: &Span| {
            tracing::info!(
                status = response.status().as_u16(),
                latency_ms = latency.as_millis() as u64,
                "response",
            );
        });

    // Multipart framing needs headroom over the raw file limit.
    let body_limit = state.config.max_upload_bytes as usize + 64 * 1024;

    Router::new()
        .nest("/api", api)
        .nest_service(MEDIA_URL_PREFIX, ServeDir::new(state.artifacts.media_root()))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    handlers::health::init_start_time();

    let config = Arc::new(config);
    // Missing or invalid models are fatal here rather than per request.
    let models = ForecastModels::load(&config.models_dir, config.onnx_intra_threads)?;
    let artifacts = Arc::new(ArtifactStore::new(&config.media_root).await?);
    let tasks = Arc::new(TaskStore::open(&config.data_dir, config.idempotency_ttl_secs).await?);
    let predictions = PredictionService::new(
        tasks.clone(),
        artifacts.clone(),
        models,
        config.max_parallel_predictions,
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        artifacts,
        tasks,
        predictions,
    });

    let app = build_router(state.clone());

    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_state.tasks.cleanup_expired_keys();
        }
    });

    if config.scheduling_enabled() {
        let schedule_state = state.clone();
        let period = std::time::Duration::from_secs(config.schedule_interval_secs);
        tracing::info!(
            interval_secs = config.schedule_interval_secs,
            daily_inbox = ?config.scheduled_daily_dir,
            monthly_inbox = ?config.scheduled_monthly_dir,
            "Scheduled forecasting enabled"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                services::scheduler::run_pending(&schedule_state).await;
            }
        });
    }

    let addr = config.listen_addr.clone();
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}

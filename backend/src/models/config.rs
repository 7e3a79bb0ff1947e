use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub allowed_origins: Vec<String>,
    /// Prepended to stored artifact URLs in prediction responses.
    pub host_prefix: String,
    pub media_root: String,
    pub data_dir: String,
    pub models_dir: String,
    pub max_upload_bytes: u64,
    pub max_parallel_predictions: usize,
    pub onnx_intra_threads: usize,
    pub log_level: String,
    pub idempotency_ttl_secs: u64,
    pub schedule_interval_secs: u64,
    pub scheduled_daily_dir: Option<String>,
    pub scheduled_monthly_dir: Option<String>,
    pub gridded_variable: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173,http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            host_prefix: env::var("HOST_PREFIX")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            media_root: env::var("MEDIA_ROOT").unwrap_or_else(|_| "./media".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            models_dir: env::var("MODELS_DIR").unwrap_or_else(|_| "./models".to_string()),
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20_971_520),
            max_parallel_predictions: env::var("MAX_PARALLEL_PREDICTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            onnx_intra_threads: env::var("ONNX_INTRA_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            idempotency_ttl_secs: env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            schedule_interval_secs: env::var("SCHEDULE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            scheduled_daily_dir: env::var("SCHEDULED_DAILY_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduled_monthly_dir: env::var("SCHEDULED_MONTHLY_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            gridded_variable: env::var("GRIDDED_VARIABLE")
                .unwrap_or_else(|_| "ice_conc".to_string()),
        }
    }

    pub fn scheduling_enabled(&self) -> bool {
        self.schedule_interval_secs > 0
            && (self.scheduled_daily_dir.is_some() || self.scheduled_monthly_dir.is_some())
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub request_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    ValidationError(String),

    #[error("{0}")]
    InvalidFormat(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Upload exceeds the maximum allowed size of {0} bytes")]
    FileTooLarge(u64),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::InvalidFormat(_) | AppError::Shape(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Io(_) | AppError::Model(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::InvalidFormat(_) => "INVALID_FORMAT",
            AppError::Shape(_) => "SHAPE_ERROR",
            AppError::FileTooLarge(_) => "FILE_TOO_LARGE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Io(_) => "IO_ERROR",
            AppError::Model(_) => "MODEL_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_error_body(&self, request_id: &str) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            code: self.code().to_string(),
            request_id: request_id.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(request_id = %request_id, code = self.code(), error = %self, "request failed");
        }

        let mut response = (status, Json(self.to_error_body(&request_id))).into_response();
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("X-Request-Id", value);
        }
        response
    }
}

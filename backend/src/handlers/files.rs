use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::error::AppError;
use crate::AppState;

#[derive(Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    /// Filesystem location of the stored PNG; usable as a prediction input locator.
    pub image_url: String,
}

pub async fn upload_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let limit = state.config.max_upload_bytes;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, limit))?;
        if data.len() as u64 > limit {
            return Err(AppError::FileTooLarge(limit));
        }

        let stored = state.artifacts.store_upload(&filename, &data).await?;
        let message = if stored.created {
            "Image uploaded successfully"
        } else {
            "Image already exists"
        };

        return Ok(Json(UploadResponse {
            message: message.to_string(),
            image_url: stored.path.display().to_string(),
        }));
    }

    Err(AppError::ValidationError("No image file provided".to_string()))
}

/// Bodies cut off by the request limit surface as multipart errors with a 413 status.
fn multipart_error(e: MultipartError, limit: u64) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::FileTooLarge(limit)
    } else {
        AppError::ValidationError(format!("Multipart error: {}", e.body_text()))
    }
}

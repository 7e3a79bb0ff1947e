use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use crate::models::error::AppError;

pub const UPLOADS_DIR: &str = "uploads";
pub const PREDICTIONS_DIR: &str = "predictions";

/// URL prefix under which the media root is served.
pub const MEDIA_URL_PREFIX: &str = "/media";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub digest: String,
    /// Location on disk, also accepted back as an input locator.
    pub path: PathBuf,
    /// `/media/<area>/<digest>.png`
    pub url: String,
    /// False when identical content was already stored.
    pub created: bool,
}

/// Content-addressed PNG store rooted at the media directory.
pub struct ArtifactStore {
    media_root: PathBuf,
}

impl ArtifactStore {
    pub async fn new(media_root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let media_root = media_root.as_ref().to_path_buf();
        fs::create_dir_all(media_root.join(UPLOADS_DIR)).await?;
        fs::create_dir_all(media_root.join(PREDICTIONS_DIR)).await?;
        Ok(Self { media_root })
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub async fn store_upload(&self, filename: &str, data: &[u8]) -> Result<StoredArtifact, AppError> {
        if !filename.to_lowercase().ends_with(".png") {
            return Err(AppError::InvalidFormat(
                "Invalid image format. Only PNG is allowed.".to_string(),
            ));
        }
        let stored = self.store_in(UPLOADS_DIR, data).await?;
        info!(digest = %stored.digest, created = stored.created, size = data.len(), "Upload stored");
        Ok(stored)
    }

    pub async fn store_prediction(&self, png: &[u8]) -> Result<StoredArtifact, AppError> {
        self.store_in(PREDICTIONS_DIR, png).await
    }

    // Check-then-write is not atomic; a racing identical write only rewrites the same bytes.
    async fn store_in(&self, area: &str, data: &[u8]) -> Result<StoredArtifact, AppError> {
        let digest = content_digest(data);
        let filename = format!("{}.png", digest);
        let path = self.media_root.join(area).join(&filename);
        let url = format!("{}/{}/{}", MEDIA_URL_PREFIX, area, filename);

        let exists = fs::try_exists(&path).await.map_err(|e| {
            AppError::Internal(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        if exists {
            debug!(digest = %digest, area, "Artifact already stored");
            return Ok(StoredArtifact { digest, path, url, created: false });
        }

        fs::write(&path, data).await.map_err(|e| {
            AppError::Internal(format!("Failed to write artifact: {}", e))
        })?;

        Ok(StoredArtifact { digest, path, url, created: true })
    }
}

pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

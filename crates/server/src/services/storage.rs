// Blob storage for uploaded model files

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::{fs, sync::RwLock};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Storage for uploaded files, addressed by opaque storage ids.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Issue a single-use URL the client can POST file bytes to.
    async fn generate_upload_url(&self) -> Result<String>;

    /// Consume an upload token and persist `data`, returning its storage id.
    async fn store(&self, token: &str, data: &[u8]) -> Result<String>;

    /// Retrievable URL for a stored blob, or `None` if it does not exist.
    async fn get_url(&self, storage_id: &str) -> Result<Option<String>>;

    async fn fetch(&self, storage_id: &str) -> Result<Vec<u8>>;
}

pub struct LocalBlobStore {
    base_path: PathBuf,
    upload_ttl: Duration,
    // upload token -> expiry
    pending: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, upload_ttl_secs: i64) -> Self {
        Self {
            base_path: base_path.into(),
            upload_ttl: Duration::seconds(upload_ttl_secs),
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create storage directory: {e}")))?;
        Ok(())
    }

    fn blob_path(&self, storage_id: &str) -> Result<PathBuf> {
        // Only ids we minted are valid, which also keeps paths inside base_path
        let id = Uuid::parse_str(storage_id)
            .map_err(|_| AppError::NotFound(format!("File not found: {storage_id}")))?;
        Ok(self.base_path.join(id.to_string()))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn generate_upload_url(&self) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut pending = self.pending.write().await;
        pending.retain(|_, expires_at| *expires_at > now);
        pending.insert(token.clone(), now + self.upload_ttl);

        Ok(format!("/api/blobs/upload/{token}"))
    }

    async fn store(&self, token: &str, data: &[u8]) -> Result<String> {
        let expires_at = self.pending.write().await.remove(token);
        match expires_at {
            Some(expires_at) if expires_at > Utc::now() => {}
            _ => {
                return Err(AppError::BadRequest(
                    "Upload URL is invalid or expired".to_string(),
                ))
            }
        }

        let storage_id = Uuid::new_v4().to_string();
        let path = self.blob_path(&storage_id)?;

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create storage directory: {e}")))?;
        fs::write(&path, data)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write file: {e}")))?;

        tracing::debug!(%storage_id, size = data.len(), "Stored blob");

        Ok(storage_id)
    }

    async fn get_url(&self, storage_id: &str) -> Result<Option<String>> {
        let path = match self.blob_path(storage_id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };

        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to stat file: {e}")))?;

        Ok(exists.then(|| format!("/api/blobs/{storage_id}")))
    }

    async fn fetch(&self, storage_id: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(storage_id)?;

        fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                AppError::NotFound(format!("File not found: {storage_id}"))
            }
            _ => AppError::Internal(format!("Failed to read file: {e}")),
        })
    }
}

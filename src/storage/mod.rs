// dbguardian/src/storage/mod.rs
//! Where artifacts live.
//!
//! `Storage` writes to the primary object store when one is configured and reachable,
//! and to the local fallback volume otherwise. Reads and deletes never try both backends: they go
//! to whichever backend the artifact was recorded against.

pub mod local;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::utils::state_db::decode_error;

pub use local::LocalBackend;
pub use s3::S3Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Primary,
    Fallback,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Primary => "primary",
            StorageType::Fallback => "fallback",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "primary" => Ok(StorageType::Primary),
            "fallback" => Ok(StorageType::Fallback),
            other => Err(decode_error(format!("unknown storage type '{}'", other))),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Streams the file at `source` under `key` and returns the location to read it back from.
    async fn put(&self, key: &str, source: &Path) -> Result<String>;

    /// Streams the artifact at `location` into `dest`.
    /// Fails with `NotFound` when nothing is stored at `location`.
    async fn get(&self, location: &str, dest: &Path) -> Result<()>;

    /// Fails with `NotFound` when nothing is stored at `location`.
    async fn delete(&self, location: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Cheap reachability check used by the system status report.
    async fn check(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub storage_type: StorageType,
    pub location: String,
    pub size_bytes: u64,
}

/// Object key for an artifact: `<database>/<backup_name>`.
pub fn artifact_key(database_name: &str, backup_name: &str) -> String {
    format!("{}/{}", database_name, backup_name)
}

#[derive(Clone)]
pub struct Storage {
    primary: Option<Arc<dyn StorageBackend>>,
    fallback: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(
        primary: Option<Arc<dyn StorageBackend>>,
        fallback: Arc<dyn StorageBackend>,
    ) -> Self {
        Self { primary, fallback }
    }

    pub async fn from_config(config: &AppConfig) -> Self {
        let primary = match &config.s3_config {
            Some(s3_config) => {
                info!(
                    endpoint = %s3_config.endpoint_url,
                    bucket = %s3_config.bucket_name,
                    "Primary object storage configured"
                );
                Some(Arc::new(S3Backend::connect(s3_config).await) as Arc<dyn StorageBackend>)
            }
            None => {
                warn!("No primary object storage configured, all artifacts go to the fallback volume");
                None
            }
        };
        let fallback = Arc::new(LocalBackend::new(config.fallback_storage_dir.clone()));
        Self::new(primary, fallback)
    }

    pub fn primary_configured(&self) -> bool {
        self.primary.is_some()
    }

    /// Primary first; any primary failure is a degraded-mode event and the
    /// artifact goes to the fallback volume under the same key.
    pub async fn put(&self, key: &str, source: &Path) -> Result<StoredArtifact> {
        let size_bytes = tokio::fs::metadata(source)
            .await
            .map_err(|e| {
                AppError::StorageFailed(format!("artifact {} is not readable: {}", source.display(), e))
            })?
            .len();
        let primary_error = match &self.primary {
            Some(primary) => match primary.put(key, source).await {
                Ok(location) => {
                    debug!(key, %location, "Artifact stored on primary storage");
                    return Ok(StoredArtifact {
                        storage_type: StorageType::Primary,
                        location,
                        size_bytes,
                    });
                }
                Err(e) => {
                    warn!(key, error = %e, "⚠️ Primary storage failed, degrading to fallback storage");
                    e.to_string()
                }
            },
            None => "primary storage not configured".to_string(),
        };

        match self.fallback.put(key, source).await {
            Ok(location) => {
                info!(key, %location, "Artifact stored on fallback storage");
                Ok(StoredArtifact {
                    storage_type: StorageType::Fallback,
                    location,
                    size_bytes,
                })
            }
            Err(fallback_error) => Err(AppError::StorageFailed(format!(
                "primary: {}; fallback: {}",
                primary_error, fallback_error
            ))),
        }
    }

    pub async fn get(&self, storage_type: StorageType, location: &str, dest: &Path) -> Result<()> {
        self.backend(storage_type)?.get(location, dest).await
    }

    pub async fn delete(&self, storage_type: StorageType, location: &str) -> Result<()> {
        self.backend(storage_type)?.delete(location).await
    }

    pub async fn exists(&self, storage_type: StorageType, key: &str) -> Result<bool> {
        self.backend(storage_type)?.exists(key).await
    }

    /// `Ok` only when the primary store is configured and answers.
    pub async fn check_primary(&self) -> Result<()> {
        match &self.primary {
            Some(primary) => primary.check().await,
            None => Err(AppError::StorageFailed(
                "primary storage not configured".to_string(),
            )),
        }
    }

    pub async fn check_fallback(&self) -> Result<()> {
        self.fallback.check().await
    }

    fn backend(&self, storage_type: StorageType) -> Result<&Arc<dyn StorageBackend>> {
        match storage_type {
            StorageType::Primary => self.primary.as_ref().ok_or_else(|| {
                AppError::StorageFailed(
                    "artifact is on primary storage but primary storage is not configured"
                        .to_string(),
                )
            }),
            StorageType::Fallback => Ok(&self.fallback),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryBackend;
    use super::*;
    use std::path::PathBuf;

    fn artifact(dir: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = dir.join("artifact.enc");
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    async fn read_back(storage: &Storage, stored: &StoredArtifact, dir: &Path) -> Result<Vec<u8>> {
        let dest = dir.join("fetched");
        storage.get(stored.storage_type, &stored.location, &dest).await?;
        Ok(std::fs::read(&dest)?)
    }

    #[tokio::test]
    async fn test_put_prefers_primary() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let primary = Arc::new(MemoryBackend::default());
        let storage = Storage::new(
            Some(primary.clone()),
            Arc::new(LocalBackend::new(dir.path())),
        );

        let source = artifact(work.path(), b"dump")?;
        let stored = storage.put("sales/backup_sales_1.dump", &source).await?;
        assert_eq!(stored.storage_type, StorageType::Primary);
        assert_eq!(stored.size_bytes, 4);
        assert_eq!(read_back(&storage, &stored, work.path()).await?, b"dump");
        assert!(storage.exists(StorageType::Primary, "sales/backup_sales_1.dump").await?);
        assert!(!dir.path().join("sales").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_primary_falls_back_to_local() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let storage = Storage::new(
            Some(Arc::new(MemoryBackend::unreachable())),
            Arc::new(LocalBackend::new(dir.path())),
        );

        let source = artifact(work.path(), b"bytes")?;
        let stored = storage.put("sales/backup_sales_2.dump", &source).await?;
        assert_eq!(stored.storage_type, StorageType::Fallback);
        assert_eq!(read_back(&storage, &stored, work.path()).await?, b"bytes");
        // reads never fall through to the other backend
        assert!(storage
            .get(StorageType::Primary, &stored.location, &work.path().join("other"))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_primary_writes_fallback() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let storage = Storage::new(None, Arc::new(LocalBackend::new(dir.path())));
        let stored = storage.put("crm/a.dump", &artifact(work.path(), b"a")?).await?;
        assert_eq!(stored.storage_type, StorageType::Fallback);
        assert!(storage.check_primary().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_both_backends_failing_is_storage_failed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // a regular file where the fallback root directory should be
        let blocked_root = dir.path().join("not-a-dir");
        std::fs::write(&blocked_root, b"occupied")?;

        let primary = Arc::new(MemoryBackend::unreachable());
        let storage = Storage::new(
            Some(primary.clone()),
            Arc::new(LocalBackend::new(&blocked_root)),
        );

        let source = artifact(dir.path(), b"bytes")?;
        let result = storage.put("sales/backup.dump", &source).await;
        assert!(matches!(result, Err(AppError::StorageFailed(_))));
        assert_eq!(primary.len(), 0);
        assert_eq!(std::fs::read(&blocked_root)?, b"occupied");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_file_is_storage_failed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(None, Arc::new(LocalBackend::new(dir.path())));
        let result = storage.put("sales/x.dump", &dir.path().join("never-written")).await;
        assert!(matches!(result, Err(AppError::StorageFailed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let storage = Storage::new(
            Some(Arc::new(MemoryBackend::default())),
            Arc::new(LocalBackend::new(dir.path())),
        );
        let stored = storage.put("hr/x.dump", &artifact(work.path(), b"x")?).await?;
        storage.delete(stored.storage_type, &stored.location).await?;
        assert!(matches!(
            read_back(&storage, &stored, work.path()).await,
            Err(AppError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_artifact_key_layout() {
        assert_eq!(artifact_key("sales", "backup_sales_20240101_000000.dump"), "sales/backup_sales_20240101_000000.dump");
        assert_eq!(StorageType::Fallback.to_string(), "fallback");
    }
}

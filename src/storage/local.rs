// dbguardian/src/storage/local.rs
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::StorageBackend;
use crate::errors::{AppError, Result};

/// Fallback storage on a local volume. Locations are file paths under `root`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(AppError::StorageFailed(format!(
                "refusing to store artifact under unsafe key '{}'",
                key
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn not_found_or_storage(location: &str, e: std::io::Error) -> AppError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AppError::NotFound(format!("no artifact at {}", location))
    } else {
        AppError::StorageFailed(format!("{}: {}", location, e))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn put(&self, key: &str, source: &Path) -> Result<String> {
        let final_path = self.path_for_key(key)?;
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&parent).await.map_err(|e| {
            AppError::StorageFailed(format!(
                "Failed to create fallback directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial_path = parent.join(format!(".{}.partial", file_name));

        let write_result = async {
            tokio::fs::copy(source, &partial_path).await?;
            tokio::fs::File::open(&partial_path).await?.sync_all().await?;
            tokio::fs::rename(&partial_path, &final_path).await
        }
        .await;

        if let Err(e) = write_result {
            // never leave a partial artifact behind
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(AppError::StorageFailed(format!(
                "Failed to write {}: {}",
                final_path.display(),
                e
            )));
        }
        Ok(final_path.to_string_lossy().into_owned())
    }

    async fn get(&self, location: &str, dest: &Path) -> Result<()> {
        tokio::fs::copy(location, dest)
            .await
            .map(|_| ())
            .map_err(|e| not_found_or_storage(location, e))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        tokio::fs::remove_file(location)
            .await
            .map_err(|e| not_found_or_storage(location, e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for_key(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AppError::StorageFailed(format!("{}: {}", path.display(), e)))
    }

    async fn check(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            AppError::StorageFailed(format!(
                "fallback directory {} is not usable: {}",
                self.root.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let source = work.path().join("upload");
        std::fs::write(&source, b"dump")?;
        let backend = LocalBackend::new(dir.path());

        let location = backend.put("sales/backup_sales_1.dump", &source).await?;
        assert!(location.ends_with("backup_sales_1.dump"));
        assert!(backend.exists("sales/backup_sales_1.dump").await?);

        let fetched = work.path().join("download");
        backend.get(&location, &fetched).await?;
        assert_eq!(std::fs::read(&fetched)?, b"dump");

        backend.delete(&location).await?;
        assert!(!backend.exists("sales/backup_sales_1.dump").await?);
        assert!(matches!(
            backend.get(&location, &fetched).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(backend.delete(&location).await, Err(AppError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_keys_escaping_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("upload");
        std::fs::write(&source, b"x")?;
        let backend = LocalBackend::new(dir.path().join("root"));
        assert!(backend.put("../outside.dump", &source).await.is_err());
        assert!(backend.put("/etc/passwd", &source).await.is_err());
        assert!(!dir.path().join("outside.dump").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let source = work.path().join("upload");
        std::fs::write(&source, b"bytes")?;
        let backend = LocalBackend::new(dir.path());
        // the target name is occupied by a directory, so the final rename fails
        std::fs::create_dir_all(dir.path().join("sales").join("taken.dump").join("inner"))?;

        let result = backend.put("sales/taken.dump", &source).await;
        assert!(matches!(result, Err(AppError::StorageFailed(_))));
        assert!(!dir.path().join("sales").join(".taken.dump.partial").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_with_spaces_and_hashes_are_stored_verbatim() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let source = work.path().join("upload");
        std::fs::write(&source, b"eu")?;
        let backend = LocalBackend::new(dir.path());

        let location = backend.put("crm#eu/backup_crm#eu_1.dump", &source).await?;
        assert!(dir.path().join("crm#eu").join("backup_crm#eu_1.dump").exists());
        let fetched = work.path().join("download");
        backend.get(&location, &fetched).await?;
        assert_eq!(std::fs::read(&fetched)?, b"eu");
        Ok(())
    }
}

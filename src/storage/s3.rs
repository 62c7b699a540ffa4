// dbguardian/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::info;

use super::StorageBackend;
use crate::config::S3Config;
use crate::errors::{AppError, Result};

/// Primary storage on an S3-compatible object store (AWS, MinIO, DigitalOcean Spaces).
pub struct S3Backend {
    client: s3::Client,
    bucket_name: String,
    folder_prefix: Option<String>,
    bucket_ready: OnceCell<()>,
}

impl S3Backend {
    pub async fn connect(s3_config: &S3Config) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&s3_config.endpoint_url)
            .region(Region::new(s3_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &s3_config.access_key_id,
                &s3_config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        // MinIO and most self-hosted stores only speak path-style addressing
        let client_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(client_config),
            bucket_name: s3_config.bucket_name.clone(),
            folder_prefix: s3_config.folder_prefix.clone(),
            bucket_ready: OnceCell::new(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    /// Creates the bucket on first use. Failure here counts as a primary failure.
    async fn ensure_bucket(&self) -> Result<()> {
        self.bucket_ready
            .get_or_try_init(|| async {
                if self
                    .client
                    .head_bucket()
                    .bucket(&self.bucket_name)
                    .send()
                    .await
                    .is_ok()
                {
                    return Ok(());
                }
                info!(bucket = %self.bucket_name, "Bucket not found, creating it");
                self.client
                    .create_bucket()
                    .bucket(&self.bucket_name)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        AppError::StorageFailed(format!(
                            "Failed to create bucket {}: {}",
                            self.bucket_name, e
                        ))
                    })
            })
            .await
            .map(|_| ())
    }
}

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
///
/// Locations are written by `put` from raw object keys, so the key is taken
/// verbatim: no percent-decoding, and `#` or `?` are part of the key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let rest = s3_uri.strip_prefix("s3://").ok_or_else(|| {
        AppError::StorageFailed(format!("S3 URI must start with s3://, got {}", s3_uri))
    })?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(AppError::StorageFailed(format!(
            "S3 URI missing bucket name: {}",
            s3_uri
        )));
    }
    if key.is_empty() {
        return Err(AppError::StorageFailed(format!(
            "S3 URI missing key (object path): {}",
            s3_uri
        )));
    }
    Ok((bucket.to_string(), key.to_string()))
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn put(&self, key: &str, source: &Path) -> Result<String> {
        self.ensure_bucket().await?;
        let object_key = self.object_key(key);

        let body = ByteStream::from_path(source).await.map_err(|e| {
            AppError::StorageFailed(format!("Failed to open {} for upload: {}", source.display(), e))
        })?;
        let size = body.size_hint().0;

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&object_key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::StorageFailed(format!(
                    "Failed to upload to S3 bucket {} with key {}: {}",
                    self.bucket_name, object_key, e
                ))
            })?;

        info!(bucket = %self.bucket_name, key = %object_key, size, "✅ Uploaded artifact to object storage");
        Ok(format!("s3://{}/{}", self.bucket_name, object_key))
    }

    async fn get(&self, location: &str, dest: &Path) -> Result<()> {
        let (bucket, key) = parse_s3_uri(location)?;
        let object = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    AppError::NotFound(format!("no artifact at {}", location))
                } else {
                    AppError::StorageFailed(format!("Failed to get object {}: {}", location, e))
                }
            })?;

        let download = async {
            let mut body = object.body.into_async_read();
            let mut file = tokio::fs::File::create(dest).await?;
            tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await
        }
        .await;
        download.map_err(|e| {
            AppError::StorageFailed(format!("Failed to read object body {}: {}", location, e))
        })
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let (bucket, key) = parse_s3_uri(location)?;
        // DeleteObject succeeds on missing keys, so look first to report NotFound
        self.client
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    AppError::NotFound(format!("no artifact at {}", location))
                } else {
                    AppError::StorageFailed(format!("Failed to stat object {}: {}", location, e))
                }
            })?;

        self.client
            .delete_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                AppError::StorageFailed(format!("Failed to delete object {}: {}", location, e))
            })?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let object_key = self.object_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket_name)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => {
                Ok(false)
            }
            Err(e) => Err(AppError::StorageFailed(format!(
                "Failed to stat object {}: {}",
                object_key, e
            ))),
        }
    }

    async fn check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                AppError::StorageFailed(format!(
                    "Could not reach bucket {}: {}",
                    self.bucket_name, e
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri() -> anyhow::Result<()> {
        let (bucket, key) = parse_s3_uri("s3://backups/sales/backup_sales_1.dump")?;
        assert_eq!(bucket, "backups");
        assert_eq!(key, "sales/backup_sales_1.dump");
        Ok(())
    }

    #[test]
    fn test_parse_s3_uri_keeps_keys_verbatim() -> anyhow::Result<()> {
        let (bucket, key) =
            parse_s3_uri("s3://backups/sales db/backup_sales db_20240601_120000_3.dump.enc")?;
        assert_eq!(bucket, "backups");
        assert_eq!(key, "sales db/backup_sales db_20240601_120000_3.dump.enc");

        let (_, key) = parse_s3_uri("s3://backups/crm#eu/backup_crm#eu_1.dump")?;
        assert_eq!(key, "crm#eu/backup_crm#eu_1.dump");

        let (_, key) = parse_s3_uri("s3://backups/nightly/hr%20prod/a?b.dump")?;
        assert_eq!(key, "nightly/hr%20prod/a?b.dump");
        Ok(())
    }

    #[test]
    fn test_parse_s3_uri_rejects_bad_input() {
        assert!(parse_s3_uri("https://backups/sales.dump").is_err());
        assert!(parse_s3_uri("s3://backups").is_err());
        assert!(parse_s3_uri("s3://backups/").is_err());
        assert!(parse_s3_uri("s3:///sales.dump").is_err());
        assert!(parse_s3_uri("/var/fallback/sales.dump").is_err());
    }
}

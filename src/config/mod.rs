// dbguardian/src/config/mod.rs
use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::crypto::{KEY_LEN, derive_key};

const DEFAULT_FALLBACK_DIR: &str = "./fallback";
const DEFAULT_STATE_DIR: &str = "./state";
const DEFAULT_CREDENTIALS_FILE: &str = "./credentials.json";
const DEFAULT_WORKER_POOL_WIDTH: usize = 2;
const DEFAULT_TICK_SECONDS: u64 = 60;
const DEFAULT_TASK_RETENTION_HOURS: u64 = 168;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonEncryptionConfig {
    /// Base64 encoded 32 byte key.
    pub key: Option<String>,
    /// Passphrase the key is derived from when `key` is absent.
    pub password: Option<String>,
    pub allow_plaintext: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub fallback_storage_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub credentials_file: Option<PathBuf>,
    pub encryption: Option<JsonEncryptionConfig>,
    pub worker_pool_width: Option<usize>,
    pub scheduler_tick_seconds: Option<u64>,
    pub scheduler_enabled: Option<bool>,
    pub task_retention_hours: Option<u64>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Clone, Default)]
pub struct EncryptionSettings {
    pub key: Option<[u8; KEY_LEN]>,
    pub allow_plaintext: bool,
}

// Never print key material.
impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("allow_plaintext", &self.allow_plaintext)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub s3_config: Option<S3Config>,
    pub fallback_storage_dir: PathBuf,
    pub state_dir: PathBuf,
    pub credentials_file: PathBuf,
    pub encryption: EncryptionSettings,
    pub worker_pool_width: usize,
    pub scheduler_tick: Duration,
    pub scheduler_enabled: bool,
    /// How long finished task statuses stay pollable.
    pub task_retention: Duration,
}

impl AppConfig {
    /// Reads `config.json` (if present), applies environment overrides and validates.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        Self::load_with_env(config_path, |name| std::env::var(name).ok())
    }

    /// [`AppConfig::load_from_json`] with environment lookups going through `lookup`.
    pub fn load_with_env<F>(config_path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw_json_config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            serde_json::from_str::<RawJsonConfig>(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            info!(
                path = %config_path.display(),
                "No config file found, using defaults and environment"
            );
            RawJsonConfig::default()
        };

        apply_env_overrides(&mut raw_json_config, lookup)?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let s3_config = raw.s3_storage.as_ref().and_then(parse_s3_config);

        let encryption = match &raw.encryption {
            Some(enc) => {
                let key = enc.key.as_deref().filter(|k| !k.trim().is_empty());
                let password = enc.password.as_deref().filter(|p| !p.is_empty());
                let key = match (key, password) {
                    (Some(encoded), _) => Some(decode_encryption_key(encoded)?),
                    (None, Some(password)) => {
                        info!("Deriving the encryption key from the configured password");
                        Some(derive_key(password))
                    }
                    (None, None) => None,
                };
                EncryptionSettings {
                    key,
                    allow_plaintext: enc.allow_plaintext.unwrap_or(false),
                }
            }
            None => EncryptionSettings::default(),
        };
        if encryption.key.is_none() && !encryption.allow_plaintext {
            warn!("No encryption key configured and plaintext mode is not allowed; backup jobs will be rejected");
        }

        let worker_pool_width = raw.worker_pool_width.unwrap_or(DEFAULT_WORKER_POOL_WIDTH);
        if worker_pool_width == 0 {
            anyhow::bail!("worker_pool_width must be at least 1");
        }
        let tick_seconds = raw.scheduler_tick_seconds.unwrap_or(DEFAULT_TICK_SECONDS);
        if tick_seconds == 0 {
            anyhow::bail!("scheduler_tick_seconds must be at least 1");
        }
        let retention_hours = raw.task_retention_hours.unwrap_or(DEFAULT_TASK_RETENTION_HOURS);
        if retention_hours == 0 {
            anyhow::bail!("task_retention_hours must be at least 1");
        }

        Ok(AppConfig {
            s3_config,
            fallback_storage_dir: non_empty_path(raw.fallback_storage_dir, DEFAULT_FALLBACK_DIR),
            state_dir: non_empty_path(raw.state_dir, DEFAULT_STATE_DIR),
            credentials_file: non_empty_path(raw.credentials_file, DEFAULT_CREDENTIALS_FILE),
            encryption,
            worker_pool_width,
            scheduler_tick: Duration::from_secs(tick_seconds),
            scheduler_enabled: raw.scheduler_enabled.unwrap_or(true),
            task_retention: Duration::from_secs(retention_hours * 3600),
        })
    }
}

/// Secrets and tuning knobs may come from the environment instead of config.json.
/// A numeric variable that is set but does not parse is an error, not a silent default.
pub fn apply_env_overrides<F>(raw: &mut RawJsonConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = lookup("BACKUP_ENCRYPTION_KEY") {
        raw.encryption.get_or_insert_with(Default::default).key = Some(key);
    }
    if let Some(password) = lookup("BACKUP_ENCRYPTION_PASSWORD") {
        raw.encryption.get_or_insert_with(Default::default).password = Some(password);
    }
    if let Some(flag) = lookup("BACKUP_ALLOW_PLAINTEXT") {
        raw.encryption.get_or_insert_with(Default::default).allow_plaintext =
            Some(matches!(flag.trim(), "1" | "true" | "yes"));
    }
    if let Some(key_id) = lookup("S3_ACCESS_KEY_ID") {
        raw.s3_storage.get_or_insert_with(Default::default).access_key_id = Some(key_id);
    }
    if let Some(secret) = lookup("S3_SECRET_ACCESS_KEY") {
        raw.s3_storage.get_or_insert_with(Default::default).secret_access_key = Some(secret);
    }
    if let Some(dir) = lookup("FALLBACK_STORAGE_DIR") {
        raw.fallback_storage_dir = Some(PathBuf::from(dir));
    }
    if let Some(width) = parse_env(&lookup, "DBGUARDIAN_WORKERS")? {
        raw.worker_pool_width = Some(width);
    }
    if let Some(tick) = parse_env(&lookup, "DBGUARDIAN_TICK_SECONDS")? {
        raw.scheduler_tick_seconds = Some(tick);
    }
    if let Some(hours) = parse_env(&lookup, "DBGUARDIAN_TASK_RETENTION_HOURS")? {
        raw.task_retention_hours = Some(hours);
    }
    Ok(())
}

fn parse_env<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a non-negative integer, got '{}'", name, value))
        })
        .transpose()
}

fn parse_s3_config(s3_raw: &JsonS3StorageConfig) -> Option<S3Config> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(S3Config {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
        })
    } else {
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn if some S3 fields were provided but were incomplete/empty
            warn!("S3 configuration is incomplete (bucket_name, region, access_key_id, secret_access_key, endpoint_url are required). Backups will use fallback storage only.");
        }
        None
    }
}

fn decode_encryption_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("Encryption key is not valid base64")?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        anyhow::anyhow!(
            "Encryption key must decode to {} bytes, got {}",
            KEY_LEN,
            b.len()
        )
    })
}

fn non_empty_path(value: Option<PathBuf>, default: &str) -> PathBuf {
    value
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(default))
}

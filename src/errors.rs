// dbguardian/src/errors.rs
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No credentials registered for database '{0}'")]
    CredentialNotFound(String),

    #[error("A job for database '{0}' is already pending or in progress, retry later")]
    AlreadyRunning(String),

    #[error("Database dump failed: {0}")]
    DumpFailed(String),

    #[error("Database restore failed: {0}")]
    RestoreFailed(String),

    #[error("Artifact encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Artifact decryption failed: {0}")]
    DecryptionError(String),

    #[error("Integrity check failed: {0}")]
    IntegrityError(String),

    #[error("Storage operation failed: {0}")]
    StorageFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

/// Serializable discriminant of [`AppError`], recorded in terminal task statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    CredentialNotFound,
    AlreadyRunning,
    DumpFailed,
    RestoreFailed,
    EncryptionFailed,
    DecryptionError,
    IntegrityError,
    StorageFailed,
    NotFound,
    Validation,
    Cancelled,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Configuration(_) => ErrorKind::Configuration,
            AppError::CredentialNotFound(_) => ErrorKind::CredentialNotFound,
            AppError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            AppError::DumpFailed(_) => ErrorKind::DumpFailed,
            AppError::RestoreFailed(_) => ErrorKind::RestoreFailed,
            AppError::EncryptionFailed(_) => ErrorKind::EncryptionFailed,
            AppError::DecryptionError(_) => ErrorKind::DecryptionError,
            AppError::IntegrityError(_) => ErrorKind::IntegrityError,
            AppError::StorageFailed(_) => ErrorKind::StorageFailed,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
            AppError::Io(_) | AppError::Sqlx(_) | AppError::SerdeJson(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Relabels a local file error as the failure of the job step that hit it.
    pub(crate) fn io_as(self, step: fn(String) -> AppError) -> AppError {
        match self {
            AppError::Io(e) => step(e.to_string()),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

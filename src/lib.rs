//! dbguardian: scheduled and on-demand PostgreSQL backups with encrypted artifacts,
//! object storage with a local fallback, and durable job tracking.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod errors;
pub mod jobs;
pub mod restore;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod utils;

pub use errors::{AppError, Result};
pub use service::BackupService;

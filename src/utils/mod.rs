pub mod state_db;

use std::path::PathBuf;
use which::which;

use crate::errors::{AppError, Result};

/// Finds a PostgreSQL client executable (pg_dump, pg_restore, ...) in the system PATH.
pub fn find_pg_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| {
        AppError::Configuration(format!(
            "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
            name, e
        ))
    })
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `verbose`. With `DBGUARDIAN_LOG_FILE` set, logs are appended
/// to that file in a detailed format instead of going to the terminal.
pub fn setup_logging(verbose: bool) -> std::io::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Ok(log_file) = std::env::var("DBGUARDIAN_LOG_FILE") {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        fmt()
            .with_env_filter(env_filter)
            .with_writer(file)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_ansi(false)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_names(false)
            .with_line_number(false)
            .init();
    }
    Ok(())
}

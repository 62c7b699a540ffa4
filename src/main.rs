//! dbguardian command line
//!
//! Runs the scheduler service or a single backup/restore operation.

// dbguardian/src/main.rs
use anyhow::{Context, Result};
use dbguardian::BackupService;
use dbguardian::config::AppConfig;
use dbguardian::jobs::{JobState, TaskStatus};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let verbose = env::args().any(|a| a == "-v" || a == "--verbose");
    if let Err(e) = dbguardian::utils::setup_logging(verbose) {
        eprintln!("❌ Failed to set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run_app().await {
        Ok(()) => {
            info!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var("DBGUARDIAN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;
    let service = BackupService::from_config(Arc::new(config))
        .await
        .context("Failed to initialise backup service")?;

    let args: Vec<String> = env::args()
        .skip(1)
        .filter(|a| a != "-v" && a != "--verbose")
        .collect();
    let choice = match args.first() {
        Some(choice) => choice.trim().to_string(),
        None => prompt_choice()?,
    };
    let operand = |index: usize| args.get(index).map(String::as_str);

    match choice.as_str() {
        "1" | "serve" => serve(&service).await,
        "2" | "backup" => {
            info!("🚀 Starting Backup Process...");
            let tasks = service
                .create_backup(operand(1))
                .await
                .context("Backup could not be started")?;
            wait_all(&service, tasks).await
        }
        "3" | "restore" => {
            let backup_id: u64 = operand(1)
                .context("usage: restore <backup_id> [target_database]")?
                .parse()
                .context("backup_id must be a number")?;
            info!(backup_id, "🔄 Starting Restore Process...");
            let task = service
                .restore_backup(backup_id, operand(2))
                .await
                .context("Restore could not be started")?;
            wait_all(&service, vec![task]).await
        }
        "4" | "list" => {
            let backups = service.list_backups(operand(1)).await?;
            println!("{}", serde_json::to_string_pretty(&backups)?);
            Ok(())
        }
        "5" | "status" => {
            let report = serde_json::json!({
                "system": service.system_status().await,
                "config": service.config_info(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        _ => {
            anyhow::bail!(
                "Invalid operation choice '{}'. Use serve, backup [db], restore <id> [db], list [db] or status.",
                choice
            );
        }
    }
}

async fn serve(service: &BackupService) -> Result<()> {
    let shutdown = CancellationToken::new();
    let scheduler = service.start_scheduler(shutdown.clone());
    info!("⚙️ Service running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();
    if let Some(handle) = scheduler {
        handle.await.context("Scheduler task panicked")?;
    }
    Ok(())
}

/// Polls until every task is terminal; fails if any of them failed.
async fn wait_all(service: &BackupService, tasks: Vec<TaskStatus>) -> Result<()> {
    let mut failed = 0;
    for task in tasks {
        let mut last_message = String::new();
        let status = loop {
            let status = service.task_status(task.task_id).await?;
            if status.message != last_message {
                info!(task_id = %status.task_id, database = %status.database_name, "{}", status.message);
                last_message = status.message.clone();
            }
            if status.status.is_terminal() {
                break status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        match status.status {
            JobState::Success => {
                println!("{}", serde_json::to_string_pretty(&status.result)?);
            }
            _ => {
                failed += 1;
                warn!(
                    task_id = %status.task_id,
                    database = %status.database_name,
                    error = ?status.error,
                    "Job failed"
                );
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} job(s) failed", failed);
    }
    Ok(())
}

fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Run scheduler service (or type 'serve')");
    println!("2. Take Backup of every database (or type 'backup')");
    println!("3. Restore Backup (or type 'restore')");
    println!("4. List Backups (or type 'list')");
    println!("5. System Status (or type 'status')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

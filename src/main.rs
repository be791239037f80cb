use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sftp_mover::config::{AppConfig, DEFAULT_CONFIG_PATH, TaskConfig};
use sftp_mover::context::AppContext;
use sftp_mover::core::{ResultSummary, TransferResult};
use sftp_mover::fs::{Connector, SftpConnector};
use sftp_mover::logging::{self, LogConfig};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sftp-mover")]
#[command(about = "Crash-safe file mover between local folders and SFTP servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(flatten)]
    globals: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Move files for every configured task.
    Run(RunArgs),
    /// Validate the config and log in to every task's server.
    Check,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    /// Only run the task with this name.
    #[arg(long)]
    task: Option<String>,

    /// Path groups run at once, for every task.
    #[arg(long)]
    max_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = AppConfig::new(&cli.config, Some(&cli.globals))?;
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let ctx = AppContext::new(config);
    let shutdown = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            shutdown.cancel();
        }
    });

    let ok = match &cli.command {
        Commands::Run(args) => run(&ctx, args).await.context("Run failed")?,
        Commands::Check => check(&ctx).await,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn selected_tasks<'a>(config: &'a AppConfig, name: Option<&str>) -> Result<Vec<&'a TaskConfig>> {
    match name {
        Some(name) => {
            let task = config
                .task(name)
                .with_context(|| format!("No task named '{name}' in configuration"))?;
            Ok(vec![task])
        }
        None => Ok(config.tasks.iter().collect()),
    }
}

/// Run the selected tasks in turn, printing each result as a JSON line.
async fn run(ctx: &AppContext, args: &RunArgs) -> Result<bool> {
    let tasks = selected_tasks(&ctx.config, args.task.as_deref())?;
    if tasks.is_empty() {
        warn!("No tasks configured");
    }

    let results = ctx
        .run_tasks(&tasks, args.max_concurrency, sftp_connector, emit)
        .await?;

    let summary = ResultSummary::from_results(&results);
    info!(
        transferred = summary.transferred,
        resumed = summary.resumed,
        cleanups = summary.cleanups,
        failed = summary.failed,
        bytes = summary.bytes,
        "Run complete"
    );
    Ok(!summary.has_failures())
}

fn sftp_connector(task: &TaskConfig) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(SftpConnector::new(task.sftp_settings()?)))
}

fn emit(result: &TransferResult) -> Result<()> {
    let line = serde_json::to_string(result).context("Failed to serialize result")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").context("Failed to write result")?;
    Ok(())
}

/// Open and close one session per task.
async fn check(ctx: &AppContext) -> bool {
    let mut ok = true;
    for task in &ctx.config.tasks {
        let settings = match task.sftp_settings() {
            Ok(settings) => settings,
            Err(e) => {
                error!(task = %task.name, error = ?e, "Invalid server settings");
                ok = false;
                continue;
            }
        };

        let connector = SftpConnector::new(settings);
        match connector.connect().await {
            Ok(session) => {
                session.close().await;
                info!(task = %task.name, server = connector.server(), "Session OK");
            }
            Err(e) => {
                error!(task = %task.name, error = %e, "Session failed");
                ok = false;
            }
        }
    }
    ok
}

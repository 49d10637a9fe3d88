use anyhow::{Context, Result, bail};
use chainvault::core::{JobKind, JobStatus, JobView, TriggerResponse};
use chainvault::logging::{self, LogConfig};
use chainvault::web::WebServer;
use chainvault::{config::AppConfig, context::AppContext};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chainvault")]
#[command(about = "Chain-data backup and restore for a blockchain node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (defaults to /etc/chainvault/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the maintenance API
    Daemon(ConfigArgs),
    /// Archive the data directory and wait for the result
    Backup(ConfigArgs),
    /// Replace the data directory with a backup and wait for the result
    Restore {
        name: String,
        #[command(flatten)]
        args: ConfigArgs,
    },
    /// Delete a backup file
    Delete {
        name: String,
        #[command(flatten)]
        args: ConfigArgs,
    },
    /// List backups, newest first
    List(ConfigArgs),
    /// Show the job state of a running daemon
    Status(DaemonArgs),
    /// Ask a running daemon to cancel its active job
    Cancel {
        #[command(flatten)]
        daemon: DaemonArgs,
        #[arg(long)]
        container: Option<String>,
    },
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    container: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_backups: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    docker_enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct DaemonArgs {
    /// Daemon base URL (defaults to http://<http_bind>)
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    let args = match &cli.command {
        Commands::Daemon(args) | Commands::Backup(args) | Commands::List(args) => Some(args),
        Commands::Restore { args, .. } | Commands::Delete { args, .. } => Some(args),
        Commands::Status(_) | Commands::Cancel { .. } => None,
    };
    let config = AppConfig::load(config_file, args)?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Daemon(_) => run_daemon(AppContext::new(config)?)
            .await
            .context("Failed to run daemon")?,
        Commands::Backup(_) => run_job(AppContext::new(config)?, JobKind::Backup, None).await?,
        Commands::Restore { name, .. } => {
            run_job(AppContext::new(config)?, JobKind::Restore, Some(name)).await?
        }
        Commands::Delete { name, .. } => {
            run_job(AppContext::new(config)?, JobKind::Delete, Some(name)).await?
        }
        Commands::List(_) => run_list(AppContext::new(config)?).await?,
        Commands::Status(daemon) => run_status(&daemon_url(&config, daemon.url))
            .await
            .context("Failed to check status of daemon")?,
        Commands::Cancel { daemon, container } => {
            run_cancel(&daemon_url(&config, daemon.url), container)
                .await
                .context("Failed to cancel daemon job")?
        }
    }

    Ok(())
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    let server = Arc::new(WebServer::new(ctx.clone(), ctx.config.http_bind));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_server.shutdown();
        }
    });

    server.start().await?;

    // Leave the data directory consistent before exiting.
    if ctx.jobs.snapshot().active {
        warn!("Cancelling active maintenance job before exit");
        ctx.jobs.request_cancel(None);
        ctx.jobs.wait().await;
    }
    Ok(())
}

async fn run_job(ctx: AppContext, kind: JobKind, backup: Option<String>) -> Result<()> {
    let response = ctx.jobs.trigger(kind, None, backup).await;
    if !response.accepted {
        bail!(response.message);
    }

    let jobs = ctx.jobs.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling job");
            jobs.request_cancel(None);
        }
    });

    let view = ctx.jobs.wait().await;
    interrupt.abort();

    println!("{}", serde_json::to_string_pretty(&view)?);
    if view.status != JobStatus::Success {
        bail!("{} job ended with status {:?}: {}", kind, view.status, view.message);
    }
    Ok(())
}

async fn run_list(ctx: AppContext) -> Result<()> {
    let backups = ctx.jobs.list_backups().await?;
    if backups.is_empty() {
        println!("No backups in {}", ctx.config.backup_dir.display());
        return Ok(());
    }
    for backup in backups {
        println!(
            "{:<44} {:>14} {}",
            backup.name,
            backup.size,
            backup.modified_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn daemon_url(config: &AppConfig, url: Option<String>) -> String {
    url.unwrap_or_else(|| format!("http://{}", config.http_bind))
        .trim_end_matches('/')
        .to_string()
}

async fn run_status(base: &str) -> Result<()> {
    let view: JobView = reqwest::get(format!("{}/api/maintenance", base))
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn run_cancel(base: &str, container: Option<String>) -> Result<()> {
    let response: TriggerResponse = reqwest::Client::new()
        .post(format!("{}/api/maintenance", base))
        .json(&json!({ "action": "cancel", "container": container }))
        .send()
        .await?
        .json()
        .await?;

    if !response.accepted {
        bail!(response.message);
    }
    println!("{}", response.message);
    Ok(())
}

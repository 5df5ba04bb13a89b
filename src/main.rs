use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use courier_gateway::broker::JobStore;
use courier_gateway::db;
use courier_gateway::jobs::QueueKind;
use courier_gateway::session::CredsStore;
use courier_gateway::{Config, Daemon};

/// Courier - messaging orchestration gateway for service businesses
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "COURIER_PORT", default_value = "18890")]
    port: u16,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List dead-lettered jobs
    Dlq {
        /// Limit to one queue (message, automation, campaign, recovery)
        #[arg(short, long)]
        queue: Option<String>,
    },
    /// Requeue every dead-lettered job in a queue
    RetryFailed {
        /// Queue to requeue (message, automation, campaign, recovery)
        queue: String,
    },
    /// Delete finished and dead jobs older than a cutoff
    CleanJobs {
        /// Age cutoff in days
        #[arg(short, long, default_value = "7")]
        days: u64,
    },
    /// Delete credential blobs for sessions idle longer than a cutoff
    CleanSessions {
        /// Age cutoff in days
        #[arg(short, long, default_value = "30")]
        days: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,courier_gateway=info",
        1 => "info,courier_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Dlq { queue } => cmd_dlq(&config, queue.as_deref()),
            Command::RetryFailed { queue } => cmd_retry_failed(&config, &queue),
            Command::CleanJobs { days } => cmd_clean_jobs(&config, days),
            Command::CleanSessions { days } => cmd_clean_sessions(&config, days),
        };
    }

    tracing::info!(port = cli.port, "starting courier gateway");
    tracing::debug!(?config, "loaded configuration");

    let daemon = Daemon::new(config, cli.port)?;
    daemon.run().await?;

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<JobStore> {
    let pool = db::init(&config.broker_path)?;
    Ok(JobStore::new(pool))
}

fn parse_queue(name: &str) -> anyhow::Result<QueueKind> {
    QueueKind::from_str(name).ok_or_else(|| anyhow::anyhow!("unknown queue: {name}"))
}

fn cmd_dlq(config: &Config, queue: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let queue = queue.map(parse_queue).transpose()?;
    let rows = store.dead_letters(queue)?;

    if rows.is_empty() {
        println!("dead-letter queue is empty");
        return Ok(());
    }
    for dl in rows {
        println!(
            "{}  {}  tenant={}  job={}  {}",
            dl.failed_at, dl.queue, dl.tenant_id, dl.job_id, dl.error
        );
    }
    Ok(())
}

fn cmd_retry_failed(config: &Config, queue: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let queue = parse_queue(queue)?;
    let requeued = store.retry_dead(queue)?;
    println!("requeued {requeued} jobs on {queue}");
    Ok(())
}

fn cmd_clean_jobs(config: &Config, days: u64) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let removed = store.clean_old(std::time::Duration::from_secs(days * 86_400))?;
    println!("removed {removed} finished jobs older than {days}d");
    Ok(())
}

fn cmd_clean_sessions(config: &Config, days: u64) -> anyhow::Result<()> {
    let creds = CredsStore::new(&config.session_dir, &config.session_backup_dir);
    let removed = creds.clean_older_than(std::time::Duration::from_secs(days * 86_400))?;
    println!("removed {removed} credential blobs idle longer than {days}d");
    Ok(())
}

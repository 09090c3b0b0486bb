use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use hostwatch::alerter::AlertManager;
use hostwatch::history::RunHistory;
use hostwatch::storage::StateDir;
use hostwatch::{agent, collector, config};

#[derive(Parser, Debug)]
#[command(name = "hostwatch", about = "Cron-driven host health check with throttled notifications")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hostwatch/config.toml")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print the most recent delivered notifications and exit
    #[arg(long, value_name = "COUNT", num_args = 0..=1, default_missing_value = "10")]
    notifications: Option<usize>,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("hostwatch {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = config::Config::load(&cli.config)?;

    if cli.check {
        for d in &config.diagnostics {
            println!("{}", d);
        }
        println!("Configuration is valid.");
        return Ok(());
    }

    if let Some(count) = cli.notifications {
        return print_notifications(&config, count);
    }

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.agent.hostname,
        "Starting hostwatch run"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Run failed");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &config::Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

fn print_notifications(config: &config::Config, count: usize) -> Result<()> {
    let state = StateDir::open(&config.agent.state_dir)?;
    let records = RunHistory::new(state, config.history.clone()).notifications(Some(count))?;
    if records.is_empty() {
        println!("No notifications recorded.");
    }
    for r in &records {
        println!("{}", r);
    }
    Ok(())
}

async fn run(config: config::Config) -> Result<()> {
    let alerter = AlertManager::new(&config.alerting)?;
    let mut collectors = collector::create_collectors(&config);

    let report = agent::run_once(config, &mut collectors, &alerter, chrono::Utc::now()).await?;

    info!(
        dispatched = report.dispatched.len(),
        failed = report.failed.len(),
        suppressed = report.suppressed,
        diagnostics = report.diagnostics.len(),
        "Run complete"
    );

    Ok(())
}

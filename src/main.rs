//! # Chainmail — follow-up email chain scheduler
//!
//! Trigger events start multi-step email sequences; triggers landing inside a
//! user's merge window fold into one combined sequence instead of flooding
//! the inbox.
//!
//! Usage:
//!   chainmail                      # serve with ~/.chainmail/config.toml
//!   chainmail --port 8080          # override gateway port
//!   chainmail --config ./dev.toml  # explicit config file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chainmail_catalog::TemplateCatalog;
use chainmail_core::ChainmailConfig;
use chainmail_gateway::AppState;
use chainmail_ledger::JobLedger;
use chainmail_mailer::SmtpMailer;
use chainmail_queue::{DelayQueue, spawn_queue_worker};
use chainmail_scheduler::{ChainScheduler, DeliveryProcessor};

#[derive(Parser)]
#[command(
    name = "chainmail",
    version,
    about = "📧 Chainmail — follow-up email chain scheduler"
)]
struct Cli {
    /// Path to the config file (defaults to ~/.chainmail/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway host override
    #[arg(long)]
    host: Option<String>,

    /// Gateway port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory override
    #[arg(long)]
    data_dir: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "chainmail=debug,tower_http=debug"
    } else {
        "chainmail=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => ChainmailConfig::load_from(path)?,
        None => ChainmailConfig::load()?,
    };
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    std::fs::create_dir_all(&config.storage.data_dir)?;

    // Stores
    let ledger = Arc::new(JobLedger::open(&config.storage.ledger_path())?);
    let catalog = Arc::new(TemplateCatalog::open(&config.storage.catalog_path())?);
    let queue = Arc::new(DelayQueue::new());

    // Scheduler + delivery pipeline
    let scheduler = Arc::new(ChainScheduler::new(
        ledger.clone(),
        catalog.clone(),
        queue.clone(),
        config.scheduler.clone(),
    ));
    let mailer = Arc::new(SmtpMailer::new(config.smtp.clone())?);
    let processor = Arc::new(DeliveryProcessor::new(ledger, catalog, mailer));

    let worker_queue = queue.clone();
    let poll_interval = config.scheduler.poll_interval_secs;
    tokio::spawn(async move {
        spawn_queue_worker(
            worker_queue,
            move |entry| {
                let processor = processor.clone();
                async move { processor.handle(entry).await }
            },
            poll_interval,
        )
        .await;
    });

    tracing::info!("📧 Chainmail starting | data={}", config.storage.data_dir);
    chainmail_gateway::serve(
        AppState {
            scheduler,
            start_time: std::time::Instant::now(),
        },
        &config.gateway.host,
        config.gateway.port,
    )
    .await?;
    Ok(())
}

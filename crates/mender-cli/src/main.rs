//! Mender CLI - capture faults and turn them into fix pull requests
//!
//! Usage:
//!   mender init                 Write a default .mender/config.toml
//!   mender check                Validate the effective configuration
//!   mender demo                 Run the pipeline against mock collaborators

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use mender_agent::mock::{MockContextEnricher, MockFixGenerator, MockPullRequestClient};
use mender_agent::{FixGenerator, ProviderChain};
use mender_core::{FixProposal, MenderConfig};
use mender_orchestrator::{capture, Orchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mender")]
#[command(author, version, about = "Self-healing fault capture and remediation")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding .mender/config.toml
    #[arg(short = 'C', long, default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Load, overlay MENDER_* variables and validate the configuration
    Check,

    /// Capture a few faults and process them with mock providers
    Demo {
        /// Number of faults to raise
        #[arg(short = 'n', long, default_value = "3")]
        events: usize,

        /// Seconds to wait for each outcome
        #[arg(long, default_value = "30")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = load_config(&cli.repo);
    let configured = loaded
        .as_ref()
        .map(|config| config.log_level.as_str())
        .unwrap_or("info");

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        configured.parse().unwrap_or(Level::INFO)
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.repo, force),
        Commands::Check => cmd_check(loaded?),
        Commands::Demo { events, wait } => cmd_demo(loaded?, events, wait).await,
    }
}

fn load_config(repo: &Path) -> Result<MenderConfig> {
    let mut config = MenderConfig::load_or_default(repo)
        .with_context(|| format!("Failed to load configuration from {:?}", repo))?;
    config
        .apply_env()
        .context("Invalid MENDER_* environment variable")?;
    Ok(config)
}

fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    let config_path = repo.join(".mender/config.toml");
    if config_path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", config_path);
    }

    MenderConfig::write_default(repo).context("Failed to write default configuration")?;
    info!("Wrote default configuration to {:?}", config_path);

    println!("Initialized Mender in {:?}", repo);
    println!("Created:");
    println!("  .mender/config.toml");
    Ok(())
}

fn cmd_check(config: MenderConfig) -> Result<()> {
    println!("Mender Configuration");
    println!("====================");
    for line in config.status_lines() {
        println!("  {}", line);
    }

    config.validate().context("Configuration is invalid")?;
    println!("\nConfiguration OK");
    Ok(())
}

async fn cmd_demo(config: MenderConfig, events: usize, wait: u64) -> Result<()> {
    let proposal = FixProposal {
        proposed_fix: "fn average(readings: &[u32]) -> Option<u32> {\n    \
                       let sum: u32 = readings.iter().sum();\n    \
                       (!readings.is_empty()).then(|| sum / readings.len() as u32)\n}\n"
            .to_string(),
        explanation: "Return None for an empty sensor window instead of indexing into it"
            .to_string(),
        confidence: 0.85,
        is_valid: true,
        provider: String::new(),
    };

    // The primary provider fails once so the chain exercises its retry budget
    let providers: Vec<Arc<dyn FixGenerator>> = vec![
        Arc::new(
            MockFixGenerator::new("primary")
                .with_proposal(proposal.clone())
                .with_failures(1),
        ),
        Arc::new(MockFixGenerator::new("fallback").with_proposal(proposal)),
    ];
    let chain = ProviderChain::new(providers)?
        .with_attempts(2, Duration::from_millis(100))
        .with_enricher(Arc::new(
            MockContextEnricher::new().with_context("demo: sensor window is empty at startup"),
        ));
    let hosting = Arc::new(MockPullRequestClient::new());

    let orchestrator = Orchestrator::builder(config)
        .with_fix_generator(Arc::new(chain))
        .with_pull_request_client(hosting.clone())
        .install()
        .context("Failed to start orchestrator")?;
    let mut outcomes = orchestrator.subscribe();

    for i in 0..events {
        if i % 2 == 0 {
            let handle = capture::spawn_thread_guarded(move || {
                let readings: Vec<u32> = Vec::new();
                readings[i]
            });
            handle
                .join()
                .map_err(|_| anyhow!("demo thread escaped its guard"))?;
        } else {
            capture::report_fault(format!("sensor {} returned no readings", i));
        }
    }

    println!("Outcomes");
    println!("========");
    let mut received = 0;
    while received < events {
        match tokio::time::timeout(Duration::from_secs(wait), outcomes.recv()).await {
            Ok(Ok(outcome)) => {
                received += 1;
                let detail = outcome
                    .pull_request
                    .as_deref()
                    .or(outcome.error.as_deref())
                    .unwrap_or("no pull request");
                println!("  {} [{}] {}", outcome.event_id.short(), outcome.status, detail);
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!("Missed {} outcomes", skipped);
                received += skipped as usize;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                warn!("Timed out waiting for outcome {} of {}", received + 1, events);
                break;
            }
        }
    }

    println!("\nPull requests");
    println!("=============");
    for spec in hosting.created() {
        let files: Vec<&str> = spec.changes.iter().map(|c| c.path.as_str()).collect();
        println!("  {} ({})", spec.branch_name, files.join(", "));
    }

    println!("\nStatus");
    println!("======");
    println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);

    orchestrator.stop().await?;
    orchestrator.uninstall();
    capture::restore_panic_hook();
    Ok(())
}

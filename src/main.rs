use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use conductor_core::config::AppConfig;
use conductor_core::event::EventBus;
use conductor_core::types::LifecycleEvent;

use conductor::lead::{self, Lead};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Agent execution and step orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml", env = "CONDUCTOR_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lead-qualification pipeline on a JSON lead
    Lead {
        /// Lead JSON file (`-` reads stdin)
        file: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "conductor", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.config.exists() {
        info!(path = %cli.config.display(), "Loaded config");
    } else {
        debug!(path = %cli.config.display(), "No config file, using defaults");
    }

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Lead { file } => {
            let success = run_lead(&config, &file).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_lead(config: &AppConfig, file: &Path) -> anyhow::Result<bool> {
    let raw = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read lead file {}", file.display()))?
    };
    let input: Lead = serde_json::from_str(&raw).context("lead file is not a valid lead object")?;

    let bus = Arc::new(EventBus::default());
    let logger = Arc::new(|event: &LifecycleEvent| {
        debug!(event = %event.kind, source = %event.source, "Lifecycle event");
    });
    bus.add_listener(&logger);

    let mut pipeline = lead::build_pipeline(config.workflow(lead::WORKFLOW_NAME), bus);
    let result = pipeline.execute(input).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

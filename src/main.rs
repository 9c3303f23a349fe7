use std::path::{Path, PathBuf};
use std::process;

use action_flow::Outcome;
use anyhow::{Context, Result};
use clap::Parser;
use sheet_autopilot::config::{load_local_env_overrides, TaskKind, LOCAL_ENV_PATH};
use sheet_autopilot::{TaskConfig, TaskOrchestrator};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sheet Autopilot - trigger a spreadsheet action and wait for it to finish
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to config/autopilot.yaml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Job to run (overrides task.kind from the configuration file)
    #[arg(short, long, value_enum)]
    task: Option<TaskKind>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Show the browser window regardless of HEADLESS
    #[arg(long)]
    headful: bool,

    /// Where to save the failure screenshot
    #[arg(long, value_name = "PATH")]
    screenshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.debug)?;
    info!("Starting Sheet Autopilot v{}", env!("CARGO_PKG_VERSION"));

    load_local_env_overrides(Path::new(LOCAL_ENV_PATH));
    let mut config =
        TaskConfig::load(cli.config.as_deref(), cli.task).context("Failed to load configuration")?;
    if cli.headful {
        config.headless = false;
    }
    if let Some(path) = cli.screenshot {
        config.screenshot_path = path;
    }
    config.log_inputs();

    let orchestrator = TaskOrchestrator::new(config);
    let result = orchestrator
        .run()
        .await
        .context("Failed to launch the browser")?;

    match &result.outcome {
        Outcome::Success => {
            if let Some(link) = orchestrator.project_link() {
                println!("{link}");
            }
            info!(duration_ms = result.total_duration_ms, "Done!");
            Ok(())
        }
        // The failure itself was already reported with its diagnostics.
        Outcome::Failure { .. } => process::exit(result.outcome.exit_code()),
    }
}

fn init_logging(level: &str, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

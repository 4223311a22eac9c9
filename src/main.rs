// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use print_realtime::config::Settings;
use print_realtime::orchestrator::Orchestrator;
use tokio::main;

/// Keep a dashboard's realtime print-job channel connected.
#[derive(Debug, Parser)]
#[command(name = "print-realtime", version, about)]
struct Cli {
    /// Settings file (extension optional)
    #[arg(short, long, default_value = "Settings")]
    config: String,

    /// Override the dashboard origin, e.g. https://print.example.com
    #[arg(long)]
    origin: Option<String>,

    /// Session token to authenticate with instead of the credential store
    #[arg(long, env = "PRINT_REALTIME_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::from_file(&cli.config)
        .with_context(|| format!("Failed to load settings from '{}'", cli.config))?;
    if let Some(origin) = cli.origin {
        settings.realtime.origin = origin;
        settings.realtime.endpoint = None;
    }

    let orchestrator = Orchestrator::from_settings(&settings, cli.token)?;
    orchestrator.run().await?;

    Ok(())
}

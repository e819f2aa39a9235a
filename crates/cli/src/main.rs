//! Anagrafe CLI - user registry client

mod commands;
mod config;
mod logging;
mod state_dir;

use anagrafe_http::ClientError;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use commands::{App, Commands};
use config::Settings;
use state_dir::StateDir;
use std::path::PathBuf;
use tracing::{Level, error, info};

#[derive(Parser)]
#[command(name = "anagrafe")]
#[command(about = "Command-line client for the Anagrafe user registry")]
#[command(version)]
struct Cli {
    /// Set logging level
    #[arg(short = 'l', long, global = true, default_value = "warn")]
    log_level: LogLevel,

    /// Settings file (defaults to anagrafe.toml in the platform config directory)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Directory for settings, the session file and logs
    #[arg(short = 'd', long, global = true, env = "ANAGRAFE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Override the API base URL from the settings
    #[arg(long, global = true, env = "ANAGRAFE_API_URL")]
    api_url: Option<String>,

    /// Disable file logging (only log to stderr)
    #[arg(long, global = true)]
    no_file_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("Command failed: {err:#}");
            report(&err);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut state_dir = cli
        .state_dir
        .clone()
        .map_or_else(StateDir::new, StateDir::with_override);

    let mut settings = Settings::load(cli.config.as_deref(), &state_dir.config_path())?;
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    // An explicit --state-dir wins over the settings file
    if let (None, Some(dir)) = (&cli.state_dir, settings.state_dir.clone()) {
        state_dir = state_dir.with_data_dir(dir);
    }

    let log_file = (!cli.no_file_log).then(|| state_dir.log_path());
    logging::init_logging(cli.log_level.into(), log_file.as_deref())?;

    info!(api = %settings.api_base_url, "Starting Anagrafe CLI");

    match cli.command {
        Commands::Config { command } => command.execute(&state_dir),
        Commands::Session(command) => {
            let app = App::open(&settings, &state_dir).await?;
            let result = command.execute(&app).await;
            app.shutdown();
            result
        }
    }
}

/// Print a failure for the end user
fn report(err: &anyhow::Error) {
    match err.downcast_ref::<ClientError>() {
        Some(client_error) => {
            eprintln!("Error: {}", client_error.user_message());
            if client_error.requires_login() {
                eprintln!("Run `anagrafe login` to start a new session.");
            }
        }
        None => eprintln!("Error: {err:#}"),
    }
}

#[derive(Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use omnigen::config::DEFAULT_CONFIG_FILE;

mod cmd;

#[derive(Parser)]
#[command(name = "omnigen")]
#[command(version, about = "Real-time front end for a combination generator")]
pub struct Cli {
    /// Debug-level logging for omnigen (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Worker command line, e.g. "python3 -u generator.py"
        #[arg(long)]
        worker_cmd: Option<String>,

        /// Directory the worker writes output.{txt,md,pdf} into
        #[arg(long)]
        artifact_dir: Option<PathBuf>,

        /// Directory with the static UI
        #[arg(long)]
        public_dir: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,

        /// Open the UI in a browser once listening
        #[arg(long)]
        open: bool,
    },
    /// View, validate or create the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default omnigen.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose { "omnigen=debug" } else { "omnigen=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Serve {
            port,
            host,
            worker_cmd,
            artifact_dir,
            public_dir,
            dev,
            open,
        } => {
            let overrides = omnigen::config::CliOverrides {
                host: host.clone(),
                port: *port,
                worker_cmd: worker_cmd.clone(),
                artifact_dir: artifact_dir.clone(),
                public_dir: public_dir.clone(),
                dev_mode: *dev,
                open_browser: *open,
            };
            cmd::cmd_serve(&cli.config, &overrides).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}

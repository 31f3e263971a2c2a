use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forma::config::{DEFAULT_CONFIG_FILE, FormaConfig};
use forma::server;

#[derive(Parser)]
#[command(name = "forma")]
#[command(version, about = "Natural-language to 3D model orchestration service")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file (default: forma.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestration server
    Serve {
        /// Port to serve on (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Write a default forma.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("forma={}", default_level))),
        )
        .init();

    let mut config = FormaConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if *dev {
                config.server.dev_mode = true;
            }
            server::start_server(config).await?;
        }
        Commands::Config { command } => match command.clone().unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Init => {
                let path = cli
                    .config
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
                if path.exists() {
                    anyhow::bail!("{} already exists", path.display());
                }
                std::fs::write(&path, FormaConfig::default().to_toml()?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {}", path.display());
            }
        },
    }

    Ok(())
}

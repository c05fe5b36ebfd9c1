use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use roundtable::config::{CONFIG_FILE_NAME, RoundTableConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "roundtable")]
#[command(version, about = "Turn-based multi-agent round table discussions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file (defaults to ./roundtable.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

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

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables, then exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration for the selected provider
    Validate,
    /// Write a default roundtable.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let mut config = RoundTableConfig::load_or_default(&config_path)?;
    config.apply_env()?;
    roundtable::logging::init(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::apply_serve_overrides(&mut config, port, host, db_path, dev);
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb { db_path } => {
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            cmd::cmd_init_db(&config)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

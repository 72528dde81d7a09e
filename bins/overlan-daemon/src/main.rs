//! Overlan daemon
//!
//! Runs an overlan node: a TUN interface bridged onto the peer-to-peer
//! overlay. Needs permission to create TUN devices (CAP_NET_ADMIN or
//! root).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use overlan_core::{Application, Config};

/// overlan - peer-to-peer LAN overlay
#[derive(Parser)]
#[command(name = "overlan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.overlan/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node in the foreground
    Start,

    /// Create a default config and identity
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config_path = expand_path(&cli.config)?;

    match cli.command {
        Commands::Start => cmd_start(config_path).await,
        Commands::Init { force } => cmd_init(config_path, force).await,
        Commands::Config => cmd_config(config_path).await,
    }
}

async fn cmd_start(config_path: PathBuf) -> Result<()> {
    let config = Config::load_or_create(&config_path).await?;
    config.validate()?;

    let mut app = Application::new(config_path, config);
    app.init().await.context("failed to start overlan")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    app.close().await;
    Ok(())
}

async fn cmd_init(config_path: PathBuf, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "config already exists at {:?}, use --force to overwrite",
            config_path
        );
    }

    let config = Config::default();
    config.save(&config_path).await?;
    println!("config written to {}", config_path.display());
    println!("an identity will be generated on first start");
    Ok(())
}

async fn cmd_config(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path).await?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn expand_path(path: &PathBuf) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("failed to resolve home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.clone())
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//! wg-provision: one-shot provisioning for a WireGuard gateway host

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wg_provision::{executor::SystemExecutor, Config, Driver, ProvisionState};

/// wg-provision: WireGuard gateway provisioning
///
/// Installs packages, generates keys, renders the gateway, allocation daemon
/// and client configs, and brings the gateway service up.
#[derive(Parser, Debug)]
#[command(name = "wg-provision")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "wg-provision.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision this host as the WireGuard gateway
    #[command(alias = "run")]
    Provision {
        /// Public host name or address clients connect to
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Write a configuration file with the default settings
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = match cli.command {
        Commands::Provision { .. } | Commands::Config => Some(Config::load_or_default(&cli.config)),
        Commands::Init { .. } | Commands::Version => None,
    };

    // Initialize logging
    let level = if cli.debug {
        "debug".to_string()
    } else if cli.verbose {
        "info".to_string()
    } else {
        match &loaded {
            Some(Ok(config)) => config.logging.level.clone(),
            _ => "info".to_string(),
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .init();

    let config = match loaded {
        Some(Ok(config)) => Some(config),
        Some(Err(err)) => {
            error!(path = %cli.config.display(), error = %err, "Failed to load config");
            return Err(anyhow::Error::new(err)
                .context(format!("Failed to load config from {}", cli.config.display())));
        }
        None => None,
    };

    match cli.command {
        Commands::Version => {
            println!("wg-provision v{}", env!("CARGO_PKG_VERSION"));
            println!("WireGuard gateway provisioning");
            Ok(())
        }

        Commands::Init { force } => init_config(&cli.config, force),

        Commands::Config => show_config(&cli.config, &config.unwrap_or_default()),

        Commands::Provision { endpoint } => provision(config.unwrap_or_default(), endpoint).await,
    }
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let body = toml::to_string_pretty(&Config::default())?;
    let contents = format!(
        "# SPDX-License-Identifier: AGPL-3.0-or-later\n# wg-provision configuration\n\n{}",
        body
    );

    std::fs::write(config_path, contents)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

/// Show the current configuration
fn show_config(config_path: &Path, config: &Config) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("No configuration file found. Using defaults:");
        println!();
    }
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Provision the gateway
async fn provision(mut config: Config, endpoint: Option<String>) -> anyhow::Result<()> {
    if let Some(endpoint) = endpoint {
        config.gateway.public_endpoint = Some(endpoint);
    }

    let executor = SystemExecutor::new(Duration::from_secs(config.service.timeout_secs));
    let mut driver = Driver::new(&config, &executor);

    match driver.run().await {
        Ok(provisioned) => {
            println!();
            println!("Gateway provisioned successfully");
            println!();
            println!("  Gateway public key: {}", provisioned.gateway_public_key);
            println!("  Gateway config:     {}", provisioned.gateway_config.display());
            println!("  Allocation config:  {}", provisioned.allocation_config.display());
            println!("  Client config:      {}", provisioned.client_config.display());
            println!("  Allocation daemon:  pid {}", provisioned.daemon.pid);
            Ok(())
        }
        Err(err) => {
            let stage = match driver.state() {
                ProvisionState::Failed { stage, .. } => stage.to_string(),
                _ => "unknown".to_string(),
            };
            Err(anyhow::Error::new(err).context(format!("Provisioning failed at stage {}", stage)))
        }
    }
}

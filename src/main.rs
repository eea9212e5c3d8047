use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use arcsent::config::{self, DEFAULT_CONFIG_PATH};
use arcsent::daemon::{integrity, Runner};
use arcsent::scanner::Registry;
use arcsent::scheduler::Scheduler;

#[derive(Parser)]
#[command(
    name = "arcsent",
    about = "Host security monitoring daemon: scheduled scanners, baseline anomaly detection, alerting",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + detection + alerting + admin API)
    Serve {
        /// Config file path
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Run a single scanner plugin once and print the result
    Scan {
        /// Plugin name (e.g. system.disk_usage)
        #[arg(long)]
        plugin: String,

        /// Per-run timeout
        #[arg(long, default_value = "2m")]
        timeout: String,

        /// Optional config file for plugin settings
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a config file and exit
    CheckConfig {
        /// Config file path
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print the SHA-256 of a binary (for security.expected_sha256)
    Fingerprint {
        /// Path to digest; defaults to this executable
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let cfg = config::load(&config)?;
            arcsent::logging::init(&cfg.daemon.log_level, &cfg.daemon.log_format);
            tracing::debug!(config = ?cfg.redacted(), "configuration loaded");
            Runner::new(cfg, config).run().await?;
        }
        Commands::Scan {
            plugin,
            timeout,
            config,
        } => {
            arcsent::logging::init("warn", "text");
            let registry = Arc::new(Registry::new());
            arcsent::plugins::register_builtin(&registry)?;
            if let Some(path) = config {
                let cfg = config::load(&path)?;
                for sc in cfg.scanners.iter().filter(|sc| sc.plugin == plugin) {
                    registry.get(&sc.plugin)?.init(&sc.config)?;
                }
            }
            let timeout = config::parse_duration(&timeout)
                .ok_or_else(|| anyhow::anyhow!("invalid timeout {timeout:?}"))?;
            let scheduler = Scheduler::new(registry);
            let result = scheduler.run_once(&plugin, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::CheckConfig { config } => {
            config::load(&config)?;
            println!("{} OK", config.display());
        }
        Commands::Fingerprint { path } => {
            let digest = match path {
                Some(path) => integrity::file_sha256(&path)?,
                None => integrity::binary_sha256()?,
            };
            println!("{digest}");
        }
    }

    Ok(())
}

//! mathdexd - formula search daemon.
//!
//! Usage:
//!   mathdexd                         # listen on 0.0.0.0:9090
//!   mathdexd --port 8080 --ipv6      # listen on [::]:8080
//!   mathdexd --schema                # schema query dialect (JSON answers)
//!   mathdexd --config mathdex.toml   # settings from a TOML file

use anyhow::{Context, Result};
use clap::Parser;
use mathdex::{Daemon, DaemonConfig, EchoHandler, QueryDialect};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mathdexd")]
#[command(about = "mathdex - HTTP daemon for mathematical formula search", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen on the IPv6 wildcard address
    #[arg(long)]
    ipv6: bool,

    /// Accept schema queries instead of generic ones
    #[arg(long)]
    schema: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.ipv6 {
        config.enable_ipv6 = true;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level);

    let dialect = if cli.schema {
        QueryDialect::Schema
    } else {
        QueryDialect::Generic
    };

    let daemon = Daemon::builder()
        .handler(EchoHandler)
        .dialect(dialect)
        .config(config)
        .start()
        .context("starting daemon")?;

    info!(addr = %daemon.local_addr(), "ready for queries");
    daemon.wait()?;
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

//! Replication manager control tool (repmgr).
//!
//! The administrative interface for a repmgr cluster: registration
//! lifecycle, promotion and follow, switchover, node diagnostics, rejoin
//! of failed primaries, and cluster-wide views.
//!
//! # Usage
//!
//! ```text
//! repmgr [OPTIONS] <OBJECT> <VERB>
//!
//! Objects:
//!   primary   Primary node registration
//!   standby   Standby registration, promote, follow, switchover
//!   witness   Witness node registration
//!   node      Node-level status, checks, service control, rejoin
//!   cluster   Cluster-wide views and maintenance
//! ```

mod cluster;
mod common;
mod node;
mod primary;
mod rejoin;
mod standby;
mod witness;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use repmgr_core::config::Config;
use repmgr_proto::ExitCode;

/// Replication manager control tool.
#[derive(Parser)]
#[command(name = "repmgr", version, about = "Replication manager control tool")]
struct Cli {
    /// Path to the repmgr configuration file
    #[arg(short = 'f', long = "config-file", value_name = "PATH", global = true)]
    config_file: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Primary node registration
    Primary(primary::PrimaryArgs),
    /// Standby registration, promote, follow, switchover
    Standby(standby::StandbyArgs),
    /// Witness node registration
    Witness(witness::WitnessArgs),
    /// Node-level status, checks, service control, rejoin
    Node(node::NodeArgs),
    /// Cluster-wide views and maintenance
    Cluster(cluster::ClusterArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(cli.config_file.as_deref()).await;

    match cli.command {
        Commands::Primary(args) => primary::run(&config, args).await,
        Commands::Standby(args) => standby::run(&config, args).await,
        Commands::Witness(args) => witness::run(&config, args).await,
        Commands::Node(args) => node::run(&config, args).await,
        Commands::Cluster(args) => cluster::run(&config, args).await,
    }
}

/// Load the configuration file from the given path or the default
/// location, exiting on parse errors.
async fn load_config(path: Option<&std::path::Path>) -> Config {
    let path = path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("repmgr.conf"));

    match Config::load(&path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("repmgr: {}", e);
            ExitCode::BadConfig.exit();
        }
    }
}

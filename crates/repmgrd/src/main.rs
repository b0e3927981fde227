//! Replication manager monitoring daemon (repmgrd).
//!
//! One daemon runs per database node. It verifies the node is registered,
//! publishes its PID into the engine's shared state, then enters the
//! monitoring loop for the node's role. Role changes (promotion during
//! failover, an operator rejoin) re-dispatch to the matching loop without
//! restarting the process.

mod daemon;
mod failover;
mod monitor;
mod primary;
mod standby;
mod witness;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use repmgr_core::catalog::{events, nodes, rpc, status};
use repmgr_core::config::Config;
use repmgr_core::pool::DbConn;
use repmgr_core::shared_state::SharedState;
use repmgr_proto::event::event_type;
use repmgr_proto::node::{NodeType, RecordStatus, RecoveryType};
use repmgr_proto::ExitCode;

use crate::daemon::{Daemon, LoopExit, SignalFlags};

/// Replication manager monitoring daemon
#[derive(Parser, Debug)]
#[command(name = "repmgrd", version, about = "Replication manager monitoring daemon")]
struct Args {
    /// Path to the repmgr configuration file
    #[arg(short = 'f', long = "config-file", value_name = "PATH")]
    config_file: PathBuf,

    /// Do not write a PID file
    #[arg(long)]
    no_pid_file: bool,

    /// PID file location (overrides the configuration file)
    #[arg(short = 'p', long, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config_file).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("repmgrd: {}", e);
            ExitCode::BadConfig.exit();
        }
    };

    init_logging(&config, args.verbose);

    info!("repmgrd v{} starting", env!("CARGO_PKG_VERSION"));

    // one session to the local node for the life of the daemon; replaced
    // in the loops if it dies
    let mut local_conn = match DbConn::establish(&config.conninfo).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("unable to connect to local node: {}", e);
            ExitCode::DbConn.exit();
        }
    };

    // the node must be registered before the daemon will monitor it
    let (record_status, local_record) = nodes::get_node_record(&local_conn, config.node_id).await;
    let local_node = match (record_status, local_record) {
        (RecordStatus::Found, Some(record)) => record,
        (RecordStatus::NotFound, _) => {
            error!(
                "no metadata record found for node {}, is it registered?",
                config.node_id
            );
            ExitCode::BadConfig.exit();
        }
        _ => {
            error!("unable to retrieve the local node record");
            ExitCode::DbConn.exit();
        }
    };

    if !local_node.active {
        error!("node {} is marked inactive, not monitoring", local_node);
        ExitCode::BadConfig.exit();
    }

    // publish identity and PID into the engine's shared state
    rpc::set_local_node_id(&local_conn, config.node_id).await;

    let pid = std::process::id() as i32;
    let pid_file = if args.no_pid_file {
        None
    } else {
        args.pid_file
            .or_else(|| config.repmgrd_pid_file.as_ref().map(PathBuf::from))
    };

    if let Some(path) = &pid_file {
        if let Err(e) = tokio::fs::write(path, format!("{}\n", pid)).await {
            error!("unable to write PID file \"{}\": {}", path.display(), e);
            ExitCode::BadConfig.exit();
        }
    }

    rpc::set_repmgrd_pid(
        &local_conn,
        pid,
        pid_file.as_ref().and_then(|p| p.to_str()),
    )
    .await;

    let shared = Arc::new(SharedState::new());
    shared.set_local_node_id(config.node_id, None).await;

    let signals = Arc::new(SignalFlags::default());
    SignalFlags::install(&signals);

    let mut daemon = Daemon::new(
        config,
        args.config_file.clone(),
        local_node,
        shared,
        signals,
        pid_file,
    );

    events::create_event_notification(
        Some(&local_conn),
        &daemon.config,
        daemon.config.node_id,
        event_type::REPMGRD_START,
        true,
        &format!("monitoring node {}", daemon.local_node),
    )
    .await;
    daemon.startup_event_logged = true;

    // dispatch to the role loop; RoleChange re-evaluates the node's role
    loop {
        let exit = match current_role(&daemon, &local_conn).await {
            NodeType::Primary => primary::monitor_primary(&mut daemon, &mut local_conn).await,
            NodeType::Witness => witness::monitor_witness(&mut daemon, &mut local_conn).await,
            _ => standby::monitor_standby(&mut daemon, &mut local_conn).await,
        };

        match exit {
            LoopExit::Terminate => break,
            LoopExit::RoleChange => {
                info!("node role changed, re-reading node record");
                if let (RecordStatus::Found, Some(record)) =
                    nodes::get_node_record(&local_conn, daemon.config.node_id).await
                {
                    daemon.local_node = record;
                }
            }
        }
    }

    daemon.terminate(Some(&local_conn)).await;
    local_conn.finish();
}

/// The role to monitor as: the registered type, cross-checked against
/// the server's actual recovery state.
async fn current_role(daemon: &Daemon, local_conn: &DbConn) -> NodeType {
    match daemon.local_node.node_type {
        NodeType::Witness => NodeType::Witness,
        _ => match status::get_recovery_type(local_conn).await {
            RecoveryType::Primary => NodeType::Primary,
            RecoveryType::Standby => NodeType::Standby,
            RecoveryType::Unknown => {
                warn!("unable to determine recovery state, assuming registered type");
                daemon.local_node.node_type
            }
        },
    }
}

/// Initialise tracing from the configuration: level from `log_level`
/// (or `-v`), output to stderr or the configured log file.
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.log_level.to_ascii_lowercase()
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.log_file.as_deref() {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            match file {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .init();
                }
                Err(e) => {
                    eprintln!(
                        "repmgrd: unable to open log file \"{}\": {}, logging to stderr",
                        path, e
                    );
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_target(false)
                        .init();
                }
            }
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
}

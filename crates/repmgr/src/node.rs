//! Node subcommands: status, check, service, control, startup.
//!
//! `node status --is-shutdown-cleanly` and the optformat output of
//! `node check` are machine-parseable; they are invoked over SSH from
//! the remote side of a switchover and must stay stable.

use std::path::Path;

use clap::{Args, Subcommand};
use tracing::{info, warn};

use repmgr_core::catalog::{nodes, rpc, slots, status};
use repmgr_core::command::{self, local_command, ServiceAction};
use repmgr_core::config::Config;
use repmgr_core::controldata::{self, DbState};
use repmgr_core::datadir;
use repmgr_core::pool::{self, DbConn};
use repmgr_core::vip;
use repmgr_proto::node::{NodeAttached, NodeAvailability, NodeType, RecoveryType};
use repmgr_proto::ExitCode;

use crate::common::{
    establish_local_connection, exit_error, format_lsn, local_node_record, CheckResult,
    CheckStatus, OutputMode,
};
use crate::rejoin;

#[derive(Args)]
pub struct NodeArgs {
    #[command(subcommand)]
    pub command: NodeCommands,
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Show the node's role, replication state and basic statistics
    Status {
        /// Report the shutdown state in machine-parseable form
        #[arg(long)]
        is_shutdown_cleanly: bool,
    },
    /// Run diagnostic checks against the node
    Check {
        /// Check WAL archiving backlog only
        #[arg(long)]
        archive_ready: bool,
        /// Check attached downstream nodes only
        #[arg(long)]
        downstream: bool,
        /// Check upstream attachment only
        #[arg(long)]
        upstream: bool,
        /// Check replication lag only
        #[arg(long)]
        replication_lag: bool,
        /// Check declared role against observed recovery state only
        #[arg(long)]
        role: bool,
        /// Check for inactive physical slots only
        #[arg(long)]
        slots: bool,
        /// Check for missing downstream slots only
        #[arg(long)]
        missing_slots: bool,
        /// Check configured data directory against the running server only
        #[arg(long)]
        data_directory_config: bool,
        /// Check whether repmgrd is running only
        #[arg(long)]
        repmgrd: bool,
        /// CSV output
        #[arg(long)]
        csv: bool,
        /// Monitoring-plugin output
        #[arg(long)]
        nagios: bool,
        /// Option-style output for programmatic consumption
        #[arg(long)]
        optformat: bool,
    },
    /// Translate a logical action into the configured service command
    Service {
        /// Action to perform: start, stop, restart, reload or promote
        #[arg(long)]
        action: String,
        /// Issue a CHECKPOINT before stop/restart (requires superuser)
        #[arg(long)]
        checkpoint: bool,
        /// Print the command that would run for each action
        #[arg(long)]
        list_actions: bool,
        /// Print the command instead of executing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Rejoin a former primary to the cluster as a standby
    Rejoin(rejoin::RejoinArgs),
    /// Diagnostic control of the WAL receiver
    Control {
        /// Disable the WAL receiver on a running standby
        #[arg(long)]
        disable_wal_receiver: bool,
        /// Re-enable the WAL receiver
        #[arg(long)]
        enable_wal_receiver: bool,
    },
    /// Bring the node up: engine, daemon, then virtual-address arbitration
    Startup,
}

pub async fn run(config: &Config, args: NodeArgs) {
    match args.command {
        NodeCommands::Status {
            is_shutdown_cleanly,
        } => {
            if is_shutdown_cleanly {
                do_node_status_is_shutdown_cleanly(config).await;
            } else {
                do_node_status(config).await;
            }
        }
        NodeCommands::Check {
            archive_ready,
            downstream,
            upstream,
            replication_lag,
            role,
            slots,
            missing_slots,
            data_directory_config,
            repmgrd,
            csv,
            nagios,
            optformat,
        } => {
            let mode = if csv {
                OutputMode::Csv
            } else if nagios {
                OutputMode::Nagios
            } else if optformat {
                OutputMode::Optformat
            } else {
                OutputMode::Text
            };

            let single = SingleCheck {
                archive_ready,
                downstream,
                upstream,
                replication_lag,
                role,
                slots,
                missing_slots,
                data_directory_config,
                repmgrd,
            };

            do_node_check(config, mode, single).await;
        }
        NodeCommands::Service {
            action,
            checkpoint,
            list_actions,
            dry_run,
        } => do_node_service(config, &action, checkpoint, list_actions, dry_run).await,
        NodeCommands::Rejoin(rejoin_args) => rejoin::do_node_rejoin(config, rejoin_args).await,
        NodeCommands::Control {
            disable_wal_receiver,
            enable_wal_receiver,
        } => do_node_control(config, disable_wal_receiver, enable_wal_receiver).await,
        NodeCommands::Startup => do_node_startup(config).await,
    }
}

// ---------------------------------------------------------------------------
// node status
// ---------------------------------------------------------------------------

async fn do_node_status(config: &Config) {
    let conn = establish_local_connection(config).await;
    let record = local_node_record(&conn, config).await;

    let recovery_type = status::get_recovery_type(&conn).await;
    let current_lsn = status::get_node_current_lsn(&conn).await;
    let timeline = status::get_node_timeline(&conn).await;

    let mut stats = repmgr_proto::node::NodeReplicationStats::default();
    status::get_node_replication_stats(&conn, &mut stats).await;

    println!("Node {}:", record);
    println!(
        "\tRole: {} ({})",
        record.node_type,
        match recovery_type {
            RecoveryType::Primary => "not in recovery",
            RecoveryType::Standby => "in recovery",
            RecoveryType::Unknown => "recovery state unknown",
        }
    );
    println!("\tActive: {}", if record.active { "yes" } else { "no" });
    match record.upstream_node_id {
        Some(id) => println!("\tUpstream node: {}", id),
        None => println!("\tUpstream node: (none)"),
    }
    println!("\tLocation: {}", record.location);
    println!("\tPriority: {}", record.priority);
    println!("\tCurrent WAL position: {}", format_lsn(current_lsn));
    println!("\tTimeline: {}", timeline);
    println!(
        "\tMax WAL senders: {} ({} attached)",
        stats.max_wal_senders, stats.attached_wal_receivers
    );
    println!(
        "\tReplication slots: {} physical ({} active, {} inactive)",
        stats.total_replication_slots,
        stats.active_replication_slots,
        stats.inactive_replication_slots
    );
    println!(
        "\trepmgrd: {}",
        if rpc::repmgrd_is_running(&conn).await {
            "running"
        } else {
            "not running"
        }
    );

    conn.finish();
}

/// Determine the shutdown state from ping plus control file, emitting a
/// single machine-parseable line.
async fn do_node_status_is_shutdown_cleanly(config: &Config) {
    let data_directory = Path::new(&config.data_directory);
    let mut output = String::from("--state=");

    if !datadir::is_ux_dir(data_directory).await {
        println!("{}UNKNOWN", output);
        return;
    }

    let responding = pool::is_server_available(&config.conninfo).await;

    let availability = match controldata::get_db_state(data_directory) {
        Err(_) => NodeAvailability::Unknown,
        Ok(db_state) => classify_shutdown_state(db_state, responding),
    };

    let checkpoint_lsn = controldata::get_latest_checkpoint_location(data_directory);

    // an unreadable control file means we cannot say anything reliable
    let availability = if !checkpoint_lsn.is_valid() {
        NodeAvailability::Unknown
    } else {
        availability
    };

    output.push_str(availability.state_token());

    if availability == NodeAvailability::Down {
        output.push_str(&format!(" --last-checkpoint-lsn={}", checkpoint_lsn));
    }

    println!("{}", output);
}

/// Decision ladder for the shutdown-state token.
fn classify_shutdown_state(db_state: DbState, responding: bool) -> NodeAvailability {
    if db_state.is_shutdown_clean() {
        if responding {
            NodeAvailability::Up
        } else {
            NodeAvailability::Down
        }
    } else if responding {
        if db_state == DbState::Shutdowning {
            NodeAvailability::ShuttingDown
        } else {
            NodeAvailability::Up
        }
    } else {
        NodeAvailability::UncleanShutdown
    }
}

// ---------------------------------------------------------------------------
// node check
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct SingleCheck {
    archive_ready: bool,
    downstream: bool,
    upstream: bool,
    replication_lag: bool,
    role: bool,
    slots: bool,
    missing_slots: bool,
    data_directory_config: bool,
    repmgrd: bool,
}

impl SingleCheck {
    fn any(&self) -> bool {
        self.archive_ready
            || self.downstream
            || self.upstream
            || self.replication_lag
            || self.role
            || self.slots
            || self.missing_slots
            || self.data_directory_config
            || self.repmgrd
    }
}

async fn do_node_check(config: &Config, mode: OutputMode, single: SingleCheck) {
    let conn = establish_local_connection(config).await;
    let record = local_node_record(&conn, config).await;

    let mut results: Vec<CheckResult> = Vec::new();

    let run_all = !single.any();

    if run_all || single.archive_ready {
        results.push(check_archive_ready(config, mode).await);
    }
    if run_all || single.downstream {
        results.push(check_downstream(&conn, config, &record).await);
    }
    if run_all || single.upstream {
        results.push(check_upstream(&conn, &record).await);
    }
    if run_all || single.replication_lag {
        results.push(check_replication_lag(&conn, config).await);
    }
    if run_all || single.role {
        results.push(check_role(&conn, &record).await);
    }
    if run_all || single.slots {
        results.push(check_slots(&conn).await);
    }
    if run_all || single.missing_slots {
        results.push(check_missing_slots(&conn, config).await);
    }
    if run_all || single.data_directory_config {
        results.push(check_data_directory(&conn, config).await);
    }
    if run_all || single.repmgrd {
        results.push(check_repmgrd(&conn).await);
    }

    conn.finish();

    let worst = results
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(CheckStatus::Unknown);

    match mode {
        OutputMode::Text => {
            println!("Node \"{}\":", record.node_name);
            for result in &results {
                println!(
                    "\t{}: {} ({})",
                    result.name,
                    result.status.as_str(),
                    result.details
                );
            }
        }
        OutputMode::Csv => {
            for result in &results {
                println!(
                    "\"{}\",\"{}\",\"{}\"",
                    result.name,
                    result.status.as_str(),
                    result.details
                );
            }
        }
        OutputMode::Nagios => {
            for result in &results {
                println!(
                    "REPMGR_{} {}: {}",
                    result.name.to_ascii_uppercase().replace(' ', "_"),
                    result.status.as_str(),
                    result.details
                );
            }
        }
        OutputMode::Optformat => {
            for result in &results {
                println!("--status={} {}", result.status.as_str(), result.details);
            }
        }
    }

    if mode == OutputMode::Nagios {
        std::process::exit(worst.nagios_code());
    }
    if worst == CheckStatus::Critical {
        ExitCode::NodeStatus.exit();
    }
}

/// Classify an archive-ready file count against the thresholds.
fn classify_archive_ready(files: i32, warning: i32, critical: i32) -> CheckStatus {
    if files < 0 {
        CheckStatus::Unknown
    } else if files > critical {
        CheckStatus::Critical
    } else if files > warning {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

/// Details string for the archive-ready check in each output mode; the
/// nagios form carries the `files=<n>;<warn>;<crit>` performance data.
fn archive_ready_details(
    mode: OutputMode,
    status: CheckStatus,
    files: i32,
    warning: i32,
    critical: i32,
) -> String {
    if files < 0 {
        return "unable to check archive_status directory".to_string();
    }

    match mode {
        OutputMode::Nagios => format!(
            "{} pending archive ready files | files={};{};{}",
            files, files, warning, critical
        ),
        OutputMode::Optformat => match status {
            CheckStatus::Critical => format!("--files={} --threshold={}", files, critical),
            CheckStatus::Warning => format!("--files={} --threshold={}", files, warning),
            _ => format!("--files={}", files),
        },
        _ => match status {
            CheckStatus::Critical => format!(
                "{} pending archive ready files, critical threshold: {}",
                files, critical
            ),
            CheckStatus::Warning => format!(
                "{} pending archive ready files (threshold: {})",
                files, warning
            ),
            _ => format!("{} pending archive ready files", files),
        },
    }
}

async fn check_archive_ready(config: &Config, mode: OutputMode) -> CheckResult {
    let files = datadir::ready_archive_file_count(Path::new(&config.data_directory)).await;
    let status = classify_archive_ready(
        files,
        config.archive_ready_warning,
        config.archive_ready_critical,
    );

    CheckResult {
        name: "WAL archiving",
        status,
        details: archive_ready_details(
            mode,
            status,
            files,
            config.archive_ready_warning,
            config.archive_ready_critical,
        ),
    }
}

async fn check_downstream(
    conn: &DbConn,
    _config: &Config,
    record: &repmgr_proto::node::NodeRecord,
) -> CheckResult {
    let downstream = match nodes::get_downstream_node_records(conn, record.node_id).await {
        Ok(downstream) => downstream,
        Err(_) => {
            return CheckResult {
                name: "Downstream servers",
                status: CheckStatus::Unknown,
                details: "unable to retrieve downstream node records".to_string(),
            }
        }
    };

    let mut missing: Vec<String> = Vec::new();
    for node in downstream.iter().filter(|n| n.active) {
        let (attached, _) = status::is_downstream_node_attached(conn, &node.node_name).await;
        if attached != NodeAttached::Attached {
            missing.push(node.node_name.clone());
        }
    }

    if missing.is_empty() {
        CheckResult {
            name: "Downstream servers",
            status: CheckStatus::Ok,
            details: format!("{} of {} downstream nodes attached", downstream.len(), downstream.len()),
        }
    } else {
        CheckResult {
            name: "Downstream servers",
            status: CheckStatus::Critical,
            details: format!("not attached: {}", missing.join(", ")),
        }
    }
}

async fn check_upstream(conn: &DbConn, record: &repmgr_proto::node::NodeRecord) -> CheckResult {
    let Some(upstream_node_id) = record.upstream_node_id else {
        return CheckResult {
            name: "Upstream connection",
            status: CheckStatus::Ok,
            details: "node has no upstream".to_string(),
        };
    };

    let (_, upstream) = nodes::get_node_record(conn, upstream_node_id).await;
    let Some(upstream) = upstream else {
        return CheckResult {
            name: "Upstream connection",
            status: CheckStatus::Unknown,
            details: format!("unable to retrieve upstream node record {}", upstream_node_id),
        };
    };

    match DbConn::establish_quiet(&upstream.conninfo).await {
        Ok(upstream_conn) => {
            let (attached, _) =
                status::is_downstream_node_attached(&upstream_conn, &record.node_name).await;
            upstream_conn.finish();

            match attached {
                NodeAttached::Attached => CheckResult {
                    name: "Upstream connection",
                    status: CheckStatus::Ok,
                    details: format!("node attached to upstream node {}", upstream_node_id),
                },
                _ => CheckResult {
                    name: "Upstream connection",
                    status: CheckStatus::Critical,
                    details: format!("node not attached to upstream node {}", upstream_node_id),
                },
            }
        }
        Err(_) => CheckResult {
            name: "Upstream connection",
            status: CheckStatus::Critical,
            details: format!("unable to connect to upstream node {}", upstream_node_id),
        },
    }
}

/// Classify replication lag seconds against the thresholds.
fn classify_replication_lag(lag: i32, warning: i32, critical: i32) -> CheckStatus {
    if lag < 0 {
        CheckStatus::Unknown
    } else if lag > critical {
        CheckStatus::Critical
    } else if lag > warning {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

async fn check_replication_lag(conn: &DbConn, config: &Config) -> CheckResult {
    if status::get_recovery_type(conn).await == RecoveryType::Primary {
        return CheckResult {
            name: "Replication lag",
            status: CheckStatus::Ok,
            details: "node is primary, no replication lag".to_string(),
        };
    }

    let lag = status::get_replication_lag_seconds(conn).await;
    let status = classify_replication_lag(
        lag,
        config.replication_lag_warning,
        config.replication_lag_critical,
    );

    CheckResult {
        name: "Replication lag",
        status,
        details: format!(
            "{} seconds | lag={};{};{}",
            lag, lag, config.replication_lag_warning, config.replication_lag_critical
        ),
    }
}

async fn check_role(conn: &DbConn, record: &repmgr_proto::node::NodeRecord) -> CheckResult {
    let recovery_type = status::get_recovery_type(conn).await;

    let consistent = matches!(
        (record.node_type, recovery_type),
        (NodeType::Primary, RecoveryType::Primary)
            | (NodeType::Standby, RecoveryType::Standby)
            | (NodeType::Witness, _)
    );

    if consistent {
        CheckResult {
            name: "Server role",
            status: CheckStatus::Ok,
            details: format!("node is registered as {}", record.node_type),
        }
    } else {
        CheckResult {
            name: "Server role",
            status: CheckStatus::Critical,
            details: format!(
                "node is registered as {} but server is {}",
                record.node_type,
                match recovery_type {
                    RecoveryType::Primary => "a primary",
                    RecoveryType::Standby => "a standby",
                    RecoveryType::Unknown => "in an unknown state",
                }
            ),
        }
    }
}

async fn check_slots(conn: &DbConn) -> CheckResult {
    match slots::get_inactive_replication_slots(conn).await {
        Ok(inactive) if inactive.is_empty() => CheckResult {
            name: "Replication slots",
            status: CheckStatus::Ok,
            details: "no inactive physical replication slots".to_string(),
        },
        Ok(inactive) => CheckResult {
            name: "Replication slots",
            status: CheckStatus::Critical,
            details: format!(
                "{} inactive physical replication slots ({})",
                inactive.len(),
                inactive
                    .iter()
                    .map(|(name, _)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        },
        Err(_) => CheckResult {
            name: "Replication slots",
            status: CheckStatus::Unknown,
            details: "unable to query replication slots".to_string(),
        },
    }
}

async fn check_missing_slots(conn: &DbConn, config: &Config) -> CheckResult {
    match slots::get_downstream_nodes_with_missing_slot(conn, config.node_id).await {
        Ok(missing) if missing.is_empty() => CheckResult {
            name: "Missing physical replication slots",
            status: CheckStatus::Ok,
            details: "node has no missing physical replication slots".to_string(),
        },
        Ok(missing) => CheckResult {
            name: "Missing physical replication slots",
            status: CheckStatus::Critical,
            details: format!(
                "{} missing physical replication slots ({})",
                missing.len(),
                missing
                    .iter()
                    .map(|(_, _, slot)| slot.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        },
        Err(_) => CheckResult {
            name: "Missing physical replication slots",
            status: CheckStatus::Unknown,
            details: "unable to query replication slots".to_string(),
        },
    }
}

async fn check_data_directory(conn: &DbConn, config: &Config) -> CheckResult {
    let server_data_directory = status::get_ux_setting(conn, "data_directory").await;

    match server_data_directory {
        Some(server_dir) if server_dir == config.data_directory => CheckResult {
            name: "Configured data directory",
            status: CheckStatus::Ok,
            details: format!("configured \"data_directory\" is \"{}\"", server_dir),
        },
        Some(server_dir) => CheckResult {
            name: "Configured data directory",
            status: CheckStatus::Critical,
            details: format!(
                "configured \"data_directory\" is \"{}\" but server reports \"{}\"",
                config.data_directory, server_dir
            ),
        },
        None => CheckResult {
            name: "Configured data directory",
            status: CheckStatus::Unknown,
            details: "unable to determine server data directory".to_string(),
        },
    }
}

async fn check_repmgrd(conn: &DbConn) -> CheckResult {
    if rpc::repmgrd_is_running(conn).await {
        let paused = rpc::repmgrd_is_paused(conn).await;
        CheckResult {
            name: "repmgrd",
            status: CheckStatus::Ok,
            details: if paused {
                "running (paused)".to_string()
            } else {
                "running".to_string()
            },
        }
    } else {
        CheckResult {
            name: "repmgrd",
            status: CheckStatus::Critical,
            details: "not running".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// node service
// ---------------------------------------------------------------------------

async fn do_node_service(
    config: &Config,
    action_name: &str,
    checkpoint: bool,
    list_actions: bool,
    dry_run: bool,
) {
    let action = match ServiceAction::parse(action_name) {
        Some(action) => action,
        None => exit_error(
            &format!(
                "unknown value \"{}\" provided for --action; valid values are \"start\", \"stop\", \"restart\", \"reload\" and \"promote\"",
                action_name
            ),
            ExitCode::BadConfig,
        ),
    };

    if list_actions {
        for action in [
            ServiceAction::Start,
            ServiceAction::Stop,
            ServiceAction::Restart,
            ServiceAction::Reload,
            ServiceAction::Promote,
        ] {
            println!(
                "{:>8}: \"{}\"",
                action.as_str(),
                command::get_server_action(config, action)
            );
        }
        return;
    }

    // shortens recovery time on the subsequent start
    if matches!(action, ServiceAction::Stop | ServiceAction::Restart) && checkpoint {
        let conn = establish_local_connection(config).await;
        if status::is_superuser_connection(&conn).await {
            if dry_run {
                info!("a CHECKPOINT would be issued here");
            } else {
                info!("issuing CHECKPOINT on node {}", config.node_id);
                if let Err(e) = status::checkpoint(&conn).await {
                    warn!("unable to issue CHECKPOINT: {}", e);
                }
            }
        } else {
            warn!("a superuser connection is required to issue a CHECKPOINT");
        }
        conn.finish();
    }

    let server_command = command::get_server_action(config, action);

    if dry_run {
        info!("would execute server command \"{}\"", server_command);
        return;
    }

    info!("executing server command \"{}\"", server_command);

    match local_command(&server_command).await {
        Ok(output) if output.success => {}
        Ok(output) => {
            eprintln!("{}", output.stderr);
            ExitCode::LocalCommand.exit();
        }
        Err(e) => exit_error(&e.to_string(), ExitCode::LocalCommand),
    }
}

// ---------------------------------------------------------------------------
// node control
// ---------------------------------------------------------------------------

async fn do_node_control(config: &Config, disable_wal_receiver: bool, enable_wal_receiver: bool) {
    if disable_wal_receiver == enable_wal_receiver {
        exit_error(
            "provide exactly one of --disable-wal-receiver and --enable-wal-receiver",
            ExitCode::BadConfig,
        );
    }

    let conn = establish_local_connection(config).await;

    if status::get_recovery_type(&conn).await != RecoveryType::Standby {
        exit_error(
            "WAL receiver control is only possible on a running standby",
            ExitCode::NodeStatus,
        );
    }

    let query = if disable_wal_receiver {
        "SELECT repmgr.disable_wal_receiver()"
    } else {
        "SELECT repmgr.enable_wal_receiver()"
    };

    if let Err(e) = conn.client().batch_execute(query).await {
        exit_error(
            &format!("unable to control WAL receiver: {}", e),
            ExitCode::DbQuery,
        );
    }

    let wal_receiver_pid = status::get_wal_receiver_pid(&conn).await;
    if disable_wal_receiver {
        println!("WAL receiver disabled (previous pid: {})", wal_receiver_pid);
    } else {
        println!("WAL receiver enabled (pid: {})", wal_receiver_pid);
    }

    conn.finish();
}

// ---------------------------------------------------------------------------
// node startup
// ---------------------------------------------------------------------------

/// Bring the node up: wait for the engine configuration to appear, start
/// the engine and the daemon, then decide what to do with the virtual
/// address. A node that finds another primary running shuts itself down
/// so the daemon can rejoin it as a standby later.
async fn do_node_startup(config: &Config) {
    use std::time::Duration;

    info!("node startup requested");

    let data_directory = Path::new(&config.data_directory);

    // wait for the engine's main configuration file to exist
    let engine_conf = data_directory.join("uxsinodb.conf");
    while !engine_conf.exists() {
        info!(
            "\"{}\" not found, will check again in 5 seconds",
            engine_conf.display()
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    // never hold the address before we know our role
    if let (Some(virtual_ip), Some(network_card)) =
        (config.virtual_ip.as_deref(), config.network_card.as_deref())
    {
        vip::unbind_virtual_ip(config, virtual_ip, network_card).await;
    }

    // start the engine
    let start_command = command::get_server_action(config, ServiceAction::Start);
    let mut engine_started = false;
    for _ in 0..5 {
        info!("starting engine: {}", start_command);
        if let Ok(output) = local_command(&start_command).await {
            if output.success {
                engine_started = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    if !engine_started {
        exit_error("failed to start the engine", ExitCode::NoUxStart);
    }
    info!("engine started");

    // start the daemon unless one is already registered and alive
    let conn = establish_local_connection(config).await;
    if rpc::repmgrd_is_running(&conn).await {
        info!("repmgrd is already running");
    } else {
        let repmgrd_command = if config.ux_bindir.is_empty() {
            format!("repmgrd -f '{}'", config.data_directory)
        } else {
            format!(
                "{}/repmgrd -f '{}'",
                config.ux_bindir.trim_end_matches('/'),
                config.data_directory
            )
        };

        info!("starting repmgrd: {}", repmgrd_command);
        if !command::local_command_simple(&format!("{} &", repmgrd_command)).await {
            warn!("failed to start repmgrd");
        }
    }

    // a standby is done at this point
    if datadir::standby_signal_exists(data_directory).await {
        info!("standby node, startup complete");
        conn.finish();
        return;
    }

    // this node believes it is primary: if any other registered node is
    // also primary, stand down and let the daemon rejoin us later
    match nodes::get_all_node_records(&conn).await {
        Ok(records) => {
            for record in records
                .iter()
                .filter(|r| r.node_id != config.node_id && r.node_type != NodeType::Witness)
            {
                if let Ok(other_conn) = DbConn::establish_quiet(&record.conninfo).await {
                    let recovery_type = status::get_recovery_type(&other_conn).await;
                    other_conn.finish();

                    if recovery_type == RecoveryType::Primary {
                        warn!(
                            "another primary ({}) detected, stopping local engine for rejoin",
                            record
                        );
                        let stop_command =
                            command::get_server_action(config, ServiceAction::Stop);
                        command::local_command_simple(&stop_command).await;
                        conn.finish();
                        return;
                    }
                }
            }

            if vip::check_vip_conf(config.virtual_ip.as_deref(), config.network_card.as_deref())
            {
                info!("sole primary, binding virtual address");
                let virtual_ip = config.virtual_ip.as_deref().unwrap_or_default();
                let network_card = config.network_card.as_deref().unwrap_or_default();
                vip::bind_virtual_ip(config, virtual_ip, network_card).await;
            }
        }
        Err(e) => {
            conn.finish();
            exit_error(
                &format!("unable to retrieve node records: {}", e),
                ExitCode::DbQuery,
            );
        }
    }

    conn.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use repmgr_proto::constants::ARCHIVE_STATUS_DIR_ERROR;

    #[test]
    fn test_classify_archive_ready_thresholds() {
        // S4: 60 ready files, warning 10, critical 50
        assert_eq!(classify_archive_ready(60, 10, 50), CheckStatus::Critical);
        assert_eq!(classify_archive_ready(30, 10, 50), CheckStatus::Warning);
        assert_eq!(classify_archive_ready(5, 10, 50), CheckStatus::Ok);
        assert_eq!(
            classify_archive_ready(ARCHIVE_STATUS_DIR_ERROR, 10, 50),
            CheckStatus::Unknown
        );
        // boundary values are inclusive of the threshold itself
        assert_eq!(classify_archive_ready(10, 10, 50), CheckStatus::Ok);
        assert_eq!(classify_archive_ready(50, 10, 50), CheckStatus::Warning);
    }

    #[test]
    fn test_archive_ready_nagios_performance_data() {
        let status = classify_archive_ready(60, 10, 50);
        let details = archive_ready_details(OutputMode::Nagios, status, 60, 10, 50);
        assert_eq!(details, "60 pending archive ready files | files=60;10;50");
    }

    #[test]
    fn test_archive_ready_optformat_details() {
        let details =
            archive_ready_details(OutputMode::Optformat, CheckStatus::Critical, 60, 10, 50);
        assert_eq!(details, "--files=60 --threshold=50");

        let details = archive_ready_details(OutputMode::Optformat, CheckStatus::Ok, 5, 10, 50);
        assert_eq!(details, "--files=5");
    }

    #[test]
    fn test_classify_replication_lag() {
        assert_eq!(classify_replication_lag(0, 300, 600), CheckStatus::Ok);
        assert_eq!(classify_replication_lag(400, 300, 600), CheckStatus::Warning);
        assert_eq!(classify_replication_lag(700, 300, 600), CheckStatus::Critical);
        assert_eq!(classify_replication_lag(-1, 300, 600), CheckStatus::Unknown);
    }

    #[test]
    fn test_classify_shutdown_state() {
        assert_eq!(
            classify_shutdown_state(DbState::Shutdowned, false),
            NodeAvailability::Down
        );
        assert_eq!(
            classify_shutdown_state(DbState::ShutdownedInRecovery, false),
            NodeAvailability::Down
        );
        assert_eq!(
            classify_shutdown_state(DbState::Shutdowning, true),
            NodeAvailability::ShuttingDown
        );
        assert_eq!(
            classify_shutdown_state(DbState::InProduction, true),
            NodeAvailability::Up
        );
        assert_eq!(
            classify_shutdown_state(DbState::InProduction, false),
            NodeAvailability::UncleanShutdown
        );
    }
}

//! Node rejoin: reattach a former primary as a standby.
//!
//! The node must be cleanly shut down, unless `--force-rewind` is given,
//! in which case the engine's block-level resynchronisation tool runs
//! first. The resync tool starts the server single-user to finish crash
//! recovery, which fails in the presence of the standby-signal marker, so
//! the marker is removed beforehand and restored afterwards whatever the
//! outcome. Configuration files living in the data directory are archived
//! before the resync and restored after, since the tool may overwrite
//! them.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Args;
use tracing::{info, warn};

use repmgr_core::catalog::{events, nodes, slots, status};
use repmgr_core::command::{self, local_command, ServiceAction};
use repmgr_core::config::Config;
use repmgr_core::controldata;
use repmgr_core::datadir;
use repmgr_core::pool::{self, DbConn};
use repmgr_proto::event::event_type;
use repmgr_proto::node::{NodeAttached, NodeRecord, RecoveryType};
use repmgr_proto::ExitCode;

use crate::common::exit_error;

#[derive(Args)]
pub struct RejoinArgs {
    /// Conninfo string of the node to rejoin through (usually the
    /// current primary)
    #[arg(short = 'd', long = "upstream-conninfo", value_name = "CONNINFO")]
    pub upstream_conninfo: String,

    /// Run the engine's block-level resynchronisation tool first
    #[arg(long)]
    pub force_rewind: bool,

    /// Comma-separated configuration files to preserve across the resync
    #[arg(long, value_name = "FILES", default_value = "")]
    pub config_files: String,

    /// Directory used to archive configuration files during the resync
    #[arg(long, value_name = "DIR", default_value = "/tmp")]
    pub config_archive_dir: String,

    /// Do not wait for the node to reattach to the primary
    #[arg(short = 'W', long)]
    pub no_wait: bool,
}

pub async fn do_node_rejoin(config: &Config, args: RejoinArgs) {
    let data_directory = PathBuf::from(&config.data_directory);

    // the node must not be running
    if pool::is_server_available(&config.conninfo).await {
        exit_error(
            "\"repmgr node rejoin\" cannot be executed on a running node",
            ExitCode::RejoinFail,
        );
    }

    let db_state = match controldata::get_db_state(&data_directory) {
        Ok(state) => state,
        Err(e) => exit_error(
            &format!("unable to determine database state from the control file: {}", e),
            ExitCode::BadConfig,
        ),
    };

    let mut hide_standby_signal = false;

    if !db_state.is_shutdown_clean() {
        if db_state == controldata::DbState::Shutdowning {
            exit_error("database is still shutting down", ExitCode::RejoinFail);
        }

        if args.force_rewind {
            warn!("database is not shut down cleanly");
            info!("--force-rewind provided, the resync tool will perform recovery");
            // the resync tool starts the server single-user, which the
            // standby-signal marker would abort
            hide_standby_signal = true;
        } else {
            eprintln!("ERROR: database is not shut down cleanly");
            eprintln!("HINT: provide --force-rewind to run recovery");
            ExitCode::RejoinFail.exit();
        }
    }

    // locate the registered primary through the provided upstream
    let upstream_conn = match DbConn::establish(&args.upstream_conninfo).await {
        Ok(conn) => conn,
        Err(e) => exit_error(
            &format!("unable to connect to provided upstream: {}", e),
            ExitCode::DbConn,
        ),
    };

    let Some(primary_node_record) = nodes::get_primary_node_record(&upstream_conn).await else {
        upstream_conn.finish();
        exit_error(
            "unable to retrieve the primary node record; check the provided connection string points at a repmgr database",
            ExitCode::BadConfig,
        );
    };

    info!("rejoin target is node {}", primary_node_record);

    let primary_conn = match DbConn::establish(&primary_node_record.conninfo).await {
        Ok(conn) => conn,
        Err(e) => {
            if status::get_recovery_type(&upstream_conn).await == RecoveryType::Primary {
                warn!("provided upstream is not in recovery but is not registered as primary");
            }
            upstream_conn.finish();
            exit_error(
                &format!(
                    "unable to connect to current registered primary {}: {}",
                    primary_node_record, e
                ),
                ExitCode::BadConfig,
            );
        }
    };
    upstream_conn.finish();

    if status::get_recovery_type(&primary_conn).await != RecoveryType::Primary {
        primary_conn.finish();
        exit_error(
            &format!(
                "node {} is registered as primary but the server is not a primary",
                primary_node_record
            ),
            ExitCode::BadConfig,
        );
    }

    // the local node must be known to the primary
    let (record_status, local_record) =
        nodes::get_node_record(&primary_conn, config.node_id).await;
    let Some(local_record) = local_record else {
        primary_conn.finish();
        exit_error(
            &format!(
                "unable to retrieve the local node record ({:?}); check the node is registered with {}",
                record_status, primary_node_record
            ),
            ExitCode::BadConfig,
        );
    };

    // sanity-check it is actually possible to attach to the target
    if !check_node_can_attach(&data_directory, &primary_conn).await {
        primary_conn.finish();
        ExitCode::RejoinFail.exit();
    }

    if args.force_rewind {
        run_force_rewind(
            config,
            &args,
            &data_directory,
            &primary_node_record,
            &primary_conn,
            hide_standby_signal,
        )
        .await;
    }

    // a former primary must release the virtual address before it comes
    // back as a standby
    if let (Some(virtual_ip), Some(network_card)) =
        (config.virtual_ip.as_deref(), config.network_card.as_deref())
    {
        repmgr_core::vip::unbind_virtual_ip(config, virtual_ip, network_card).await;
    }

    // follow the primary: mark ourselves a standby of it, restore the
    // standby marker, start the engine
    if let Err(e) = datadir::write_standby_signal(&data_directory).await {
        primary_conn.finish();
        exit_error(&e.to_string(), ExitCode::RejoinFail);
    }

    if let Err(e) = nodes::update_node_record_status(
        &primary_conn,
        config.node_id,
        repmgr_proto::node::NodeType::Standby,
        Some(primary_node_record.node_id),
        true,
    )
    .await
    {
        warn!("unable to update the local node record: {}", e);
    }

    let start_command = command::get_server_action(config, ServiceAction::Start);
    info!("starting server: {}", start_command);
    match local_command(&start_command).await {
        Ok(output) if output.success => {}
        _ => {
            events::create_event_notification(
                Some(&primary_conn),
                config,
                config.node_id,
                event_type::NODE_REJOIN,
                false,
                "unable to start the local server",
            )
            .await;
            primary_conn.finish();
            exit_error("unable to start the local server", ExitCode::RejoinFail);
        }
    }

    // wait for the node to reappear in the primary's replication view
    let rejoined = if args.no_wait {
        let (attached, _) =
            status::is_downstream_node_attached(&primary_conn, &local_record.node_name).await;
        attached == NodeAttached::Attached
    } else {
        wait_for_standby_join(&primary_conn, &local_record, config.node_rejoin_timeout).await
    };

    events::create_event_notification(
        Some(&primary_conn),
        config,
        config.node_id,
        event_type::NODE_REJOIN,
        rejoined,
        &format!(
            "node {} rejoined the cluster below node {}",
            config.node_id, primary_node_record.node_id
        ),
    )
    .await;

    if !rejoined && !args.no_wait {
        primary_conn.finish();
        eprintln!(
            "ERROR: NODE REJOIN failed; no active record for the local node appeared in node \"{}\"'s replication view within {} seconds",
            primary_node_record.node_name, config.node_rejoin_timeout
        );
        eprintln!("HINT: check the engine log on the local node");
        ExitCode::RejoinFail.exit();
    }

    // tidy slot leftovers: the slot pointing at our new upstream is
    // obsolete on this node
    if !args.force_rewind && config.use_replication_slots {
        if let Ok(local_conn) = DbConn::establish_quiet(&config.conninfo).await {
            if let Some(slot_name) = &primary_node_record.slot_name {
                slots::drop_replication_slot_if_exists(&local_conn, slot_name).await;
            }

            if let Ok(inactive) = slots::get_inactive_replication_slots(&local_conn).await {
                if !inactive.is_empty() {
                    warn!(
                        "{} inactive replication slots detected, these may need to be removed manually",
                        inactive.len()
                    );
                }
            }
            local_conn.finish();
        } else {
            warn!("unable to connect to local node to check replication slot status");
        }
    }

    if rejoined {
        info!("NODE REJOIN successful");
    } else {
        info!("NODE REJOIN has completed but the node is not yet reattached to its upstream");
    }

    primary_conn.finish();
}

/// Compare local timeline and minimum-recovery position against the
/// rejoin target.
async fn check_node_can_attach(data_directory: &Path, primary_conn: &DbConn) -> bool {
    // a former primary may have empty minimum-recovery fields; fall back
    // to the checkpoint values
    let mut local_tli = controldata::get_min_recovery_end_timeline(data_directory);
    let mut min_recovery_location = controldata::get_min_recovery_location(data_directory);

    if !min_recovery_location.is_valid() {
        min_recovery_location = controldata::get_latest_checkpoint_location(data_directory);
    }
    if local_tli == 0 {
        local_tli = controldata::get_timeline(data_directory);
    }

    let primary_tli = status::get_node_timeline(primary_conn).await;
    let primary_lsn = status::get_node_current_lsn(primary_conn).await;

    if local_tli > primary_tli {
        eprintln!(
            "ERROR: this node's timeline ({}) is ahead of the rejoin target's timeline ({})",
            local_tli, primary_tli
        );
        return false;
    }

    if min_recovery_location > primary_lsn {
        eprintln!(
            "ERROR: this node's minimum recovery position ({}) is ahead of the rejoin target's current position ({})",
            min_recovery_location, primary_lsn
        );
        return false;
    }

    true
}

/// Execute the block-level resynchronisation tool, preserving the
/// standby-signal marker and configured configuration files around it.
async fn run_force_rewind(
    config: &Config,
    args: &RejoinArgs,
    data_directory: &Path,
    primary_node_record: &NodeRecord,
    primary_conn: &DbConn,
    hide_standby_signal: bool,
) {
    let archived = archive_config_files(args, data_directory).await;

    let rewind_tool = if config.ux_bindir.is_empty() {
        "ux_rewind".to_string()
    } else {
        format!("{}/ux_rewind", config.ux_bindir.trim_end_matches('/'))
    };

    let rewind_command = format!(
        "{} -D '{}' --source-server='{}'",
        rewind_tool,
        data_directory.display(),
        primary_node_record.conninfo
    );

    if hide_standby_signal {
        info!("temporarily removing the standby-signal marker so the resync tool can run recovery");
        if let Err(e) = datadir::remove_standby_signal(data_directory).await {
            exit_error(&e.to_string(), ExitCode::RejoinFail);
        }
    }

    info!("executing: {}", rewind_command);
    let rewind_result = local_command(&rewind_command).await;

    if hide_standby_signal {
        // restore regardless of the resync outcome
        info!("recreating the standby-signal marker");
        if let Err(e) = datadir::write_standby_signal(data_directory).await {
            warn!("unable to recreate the standby-signal marker: {}", e);
        }
    }

    match rewind_result {
        Ok(output) if output.success => {}
        Ok(output) => {
            restore_config_files(args, data_directory, &archived).await;
            events::create_event_notification(
                Some(primary_conn),
                config,
                config.node_id,
                event_type::NODE_REJOIN,
                false,
                "block-level resynchronisation failed",
            )
            .await;
            eprintln!("ERROR: block-level resynchronisation failed");
            eprintln!("{}", output.stderr);
            ExitCode::RejoinFail.exit();
        }
        Err(e) => {
            restore_config_files(args, data_directory, &archived).await;
            exit_error(&e.to_string(), ExitCode::RejoinFail);
        }
    }

    restore_config_files(args, data_directory, &archived).await;

    // the resync tool may copy a recovery-done marker in from the source
    datadir::remove_recovery_done(data_directory).await;
}

/// Copy the requested configuration files into the archive directory.
/// Returns the archived file names.
async fn archive_config_files(args: &RejoinArgs, data_directory: &Path) -> Vec<String> {
    let mut archived = Vec::new();
    let archive_dir = PathBuf::from(&args.config_archive_dir);

    if let Err(e) = tokio::fs::create_dir_all(&archive_dir).await {
        warn!(
            "unable to create archive directory \"{}\": {}",
            archive_dir.display(),
            e
        );
        return archived;
    }

    for file_name in args
        .config_files
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        let source = data_directory.join(file_name);
        let target = archive_dir.join(file_name);

        match tokio::fs::copy(&source, &target).await {
            Ok(_) => {
                info!("archived configuration file \"{}\"", file_name);
                archived.push(file_name.to_string());
            }
            Err(e) => warn!(
                "unable to archive configuration file \"{}\": {}",
                source.display(),
                e
            ),
        }
    }

    archived
}

/// Copy archived configuration files back into the data directory.
async fn restore_config_files(args: &RejoinArgs, data_directory: &Path, archived: &[String]) {
    let archive_dir = PathBuf::from(&args.config_archive_dir);

    for file_name in archived {
        let source = archive_dir.join(file_name);
        let target = data_directory.join(file_name);

        match tokio::fs::copy(&source, &target).await {
            Ok(_) => {
                info!("restored configuration file \"{}\"", file_name);
                let _ = tokio::fs::remove_file(&source).await;
            }
            Err(e) => warn!(
                "unable to restore configuration file \"{}\": {}",
                target.display(),
                e
            ),
        }
    }
}

/// Poll the primary's replication view until the node appears or the
/// budget runs out.
pub async fn wait_for_standby_join(
    primary_conn: &DbConn,
    local_record: &NodeRecord,
    timeout_secs: i32,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(1) as u64);

    loop {
        let (attached, _) =
            status::is_downstream_node_attached(primary_conn, &local_record.node_name).await;
        if attached == NodeAttached::Attached {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

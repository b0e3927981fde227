//! Standby subcommands: register, unregister, promote, follow,
//! switchover.
//!
//! Switchover is the only operation that coordinates two nodes from one
//! invocation: the demotion candidate is shut down remotely over SSH,
//! its final checkpoint position is verified against the local receive
//! position, the local node is promoted, and the former primary is
//! rejoined below it.

use std::time::{Duration, Instant};

use clap::{Args, Subcommand};
use tracing::{info, warn};

use repmgr_core::catalog::{events, nodes, slots, status, voting};
use repmgr_core::command::{self, local_command, ServiceAction};
use repmgr_core::config::Config;
use repmgr_core::conninfo;
use repmgr_core::pool::DbConn;
use repmgr_core::sshpass::{self, SshpassStatus};
use repmgr_core::vip;
use repmgr_proto::event::{event_type, EventInfo};
use repmgr_proto::node::{NodeRecord, NodeType, RecoveryType};
use repmgr_proto::{ExitCode, Lsn};

use crate::common::{
    establish_local_connection, establish_primary_connection, exit_error, local_node_record,
};
use crate::rejoin::wait_for_standby_join;

#[derive(Args)]
pub struct StandbyArgs {
    #[command(subcommand)]
    pub command: StandbyCommands,
}

#[derive(Subcommand)]
pub enum StandbyCommands {
    /// Register the standby with the cluster primary
    Register {
        /// Overwrite an existing record for this node id
        #[arg(short = 'F', long)]
        force: bool,
    },
    /// Remove the standby's record from the cluster
    Unregister,
    /// Promote this standby to primary
    Promote,
    /// Re-point this standby at the current primary (or a given upstream)
    Follow {
        /// Node id to follow instead of the current primary
        #[arg(long, value_name = "ID")]
        upstream_node_id: Option<i32>,
    },
    /// Promote this standby and demote the current primary, swapping roles
    Switchover {
        /// Instruct other standbys to follow the new primary
        #[arg(long)]
        siblings_follow: bool,
        /// Pass --force-rewind to the former primary's rejoin
        #[arg(long)]
        force_rewind: bool,
        /// User for the SSH connection to the demotion candidate
        #[arg(long, value_name = "USER")]
        remote_user: Option<String>,
    },
}

pub async fn run(config: &Config, args: StandbyArgs) {
    match args.command {
        StandbyCommands::Register { force } => do_standby_register(config, force).await,
        StandbyCommands::Unregister => do_standby_unregister(config).await,
        StandbyCommands::Promote => do_standby_promote(config).await,
        StandbyCommands::Follow { upstream_node_id } => {
            do_standby_follow(config, upstream_node_id).await
        }
        StandbyCommands::Switchover {
            siblings_follow,
            force_rewind,
            remote_user,
        } => do_standby_switchover(config, siblings_follow, force_rewind, remote_user).await,
    }
}

// ---------------------------------------------------------------------------
// standby register / unregister
// ---------------------------------------------------------------------------

async fn do_standby_register(config: &Config, force: bool) {
    let local_conn = establish_local_connection(config).await;

    if status::get_recovery_type(&local_conn).await != RecoveryType::Standby {
        exit_error(
            "this node should be a standby; is it still attached to its upstream?",
            ExitCode::BadConfig,
        );
    }

    let (primary_conn, primary_id) = establish_primary_connection(&local_conn).await;

    let mut record = NodeRecord::new(
        config.node_id,
        NodeType::Standby,
        &config.node_name,
        &config.conninfo,
    );
    record.upstream_node_id = Some(primary_id);
    record.repluser = config.replication_user.clone();
    record.location = config.location.clone();
    record.priority = config.priority;
    record.config_file = config.data_directory.clone();
    record.virtual_ip = config.virtual_ip.clone();
    record.network_card = config.network_card.clone();

    if config.use_replication_slots {
        let slot_name = slots::create_slot_name(config.node_id);
        if let Err(e) = slots::create_replication_slot_sql(&primary_conn, &slot_name).await {
            primary_conn.finish();
            exit_error(&e.to_string(), ExitCode::BadConfig);
        }
        record.slot_name = Some(slot_name);
    }

    use repmgr_proto::node::RecordStatus;
    let (existing, _) = nodes::get_node_record(&primary_conn, config.node_id).await;

    let result = match existing {
        RecordStatus::Found if !force => {
            primary_conn.finish();
            exit_error(
                &format!(
                    "a record for node {} already exists; use --force to overwrite",
                    config.node_id
                ),
                ExitCode::BadConfig,
            );
        }
        RecordStatus::Found => nodes::update_node_record(&primary_conn, &record).await,
        _ => nodes::create_node_record(&primary_conn, &record).await,
    };

    if let Err(e) = result {
        events::create_event_notification(
            Some(&primary_conn),
            config,
            config.node_id,
            event_type::STANDBY_REGISTER,
            false,
            &e.to_string(),
        )
        .await;
        primary_conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    events::create_event_notification(
        Some(&primary_conn),
        config,
        config.node_id,
        event_type::STANDBY_REGISTER,
        true,
        &format!("standby registration succeeded for node {}", record),
    )
    .await;

    println!("standby registered (node {})", record);
    primary_conn.finish();
    local_conn.finish();
}

async fn do_standby_unregister(config: &Config) {
    let local_conn = establish_local_connection(config).await;
    let (primary_conn, _) = establish_primary_connection(&local_conn).await;

    if let Err(e) = nodes::delete_node_record(&primary_conn, config.node_id).await {
        primary_conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    events::create_event_notification(
        Some(&primary_conn),
        config,
        config.node_id,
        event_type::STANDBY_UNREGISTER,
        true,
        &format!("standby unregistration succeeded for node {}", config.node_id),
    )
    .await;

    println!("standby unregistered (node {})", config.node_id);
    primary_conn.finish();
    local_conn.finish();
}

// ---------------------------------------------------------------------------
// standby promote
// ---------------------------------------------------------------------------

/// Promote the local standby and publish the new topology. Shared with
/// the switchover path.
async fn promote_local_standby(config: &Config, local_conn: &DbConn, former_primary_id: Option<i32>) {
    let local_record = local_node_record(local_conn, config).await;

    if status::get_recovery_type(local_conn).await != RecoveryType::Standby {
        exit_error("this node is not a standby", ExitCode::PromotionFail);
    }

    // promote via the configured command, or the engine procedure
    if let Some(promote_command) = config
        .service_promote_command
        .as_deref()
        .or(config.promote_command.as_deref())
    {
        info!("executing promote command \"{}\"", promote_command);
        match local_command(promote_command).await {
            Ok(output) if output.success => {}
            _ => exit_error("promote command failed", ExitCode::PromotionFail),
        }
    } else if let Err(e) = status::promote_standby(local_conn, false, 0).await {
        exit_error(&e.to_string(), ExitCode::PromotionFail);
    }

    // wait for recovery to end
    let deadline = Instant::now()
        + Duration::from_secs(config.promote_check_timeout.max(1) as u64);
    loop {
        if status::get_recovery_type(local_conn).await == RecoveryType::Primary {
            break;
        }
        if Instant::now() >= deadline {
            exit_error(
                &format!(
                    "node did not leave recovery within {} seconds",
                    config.promote_check_timeout
                ),
                ExitCode::PromotionFail,
            );
        }
        tokio::time::sleep(Duration::from_secs(
            config.promote_check_interval.max(1) as u64,
        ))
        .await;
    }

    if let Err(e) = nodes::update_node_record_set_primary(local_conn, config.node_id).await {
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    let event_info = EventInfo {
        node_name: Some(local_record.node_name.clone()),
        conninfo: Some(local_record.conninfo.clone()),
        peer_node_id: former_primary_id,
    };
    events::create_event_notification_extended(
        Some(local_conn),
        config,
        config.node_id,
        if former_primary_id.is_some() {
            event_type::STANDBY_SWITCHOVER
        } else {
            event_type::STANDBY_PROMOTE
        },
        true,
        &format!("node {} promoted to primary", config.node_id),
        &event_info,
    )
    .await;

    // catalog is updated, the address may follow
    if let (Some(virtual_ip), Some(network_card)) =
        (local_record.virtual_ip.as_deref(), local_record.network_card.as_deref())
    {
        vip::bind_virtual_ip(config, virtual_ip, network_card).await;
    }

    // push the new timeline into the control file
    if let Err(e) = status::checkpoint(local_conn).await {
        warn!("unable to execute post-promotion checkpoint: {}", e);
    }

    println!("standby promoted to primary (node {})", config.node_id);
}

async fn do_standby_promote(config: &Config) {
    let local_conn = establish_local_connection(config).await;

    // refuse while an active primary is reachable; use switchover for that
    if let Some(primary_record) = nodes::get_primary_node_record(&local_conn).await {
        if primary_record.node_id != config.node_id {
            if let Ok(conn) = DbConn::establish_quiet(&primary_record.conninfo).await {
                let recovery_type = status::get_recovery_type(&conn).await;
                conn.finish();
                if recovery_type == RecoveryType::Primary {
                    exit_error(
                        &format!(
                            "active primary {} is still reachable, use \"standby switchover\"",
                            primary_record
                        ),
                        ExitCode::PromotionFail,
                    );
                }
            }
        }
    }

    promote_local_standby(config, &local_conn, None).await;
    local_conn.finish();
}

// ---------------------------------------------------------------------------
// standby follow
// ---------------------------------------------------------------------------

async fn do_standby_follow(config: &Config, upstream_node_id: Option<i32>) {
    let local_conn = establish_local_connection(config).await;
    let local_record = local_node_record(&local_conn, config).await;

    let target = match upstream_node_id {
        Some(id) => {
            let (_, record) = nodes::get_node_record(&local_conn, id).await;
            record.unwrap_or_else(|| {
                exit_error(
                    &format!("unable to retrieve node record for node {}", id),
                    ExitCode::BadConfig,
                )
            })
        }
        None => nodes::get_primary_node_record(&local_conn)
            .await
            .unwrap_or_else(|| {
                exit_error("unable to determine the current primary", ExitCode::DbConn)
            }),
    };

    info!("follow target is node {}", target);

    let target_conn = match DbConn::establish(&target.conninfo).await {
        Ok(conn) => conn,
        Err(e) => exit_error(
            &format!("unable to connect to follow target: {}", e),
            ExitCode::DbConn,
        ),
    };

    if let Err(e) =
        nodes::update_node_record_set_upstream(&target_conn, config.node_id, target.node_id).await
    {
        target_conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    // replication restarts against the new upstream
    let restart_command = command::get_server_action(config, ServiceAction::Restart);
    info!("restarting server: {}", restart_command);
    match local_command(&restart_command).await {
        Ok(output) if output.success => {}
        _ => {
            target_conn.finish();
            exit_error("unable to restart the local server", ExitCode::LocalCommand);
        }
    }

    let attached = wait_for_standby_join(&target_conn, &local_record, config.standby_follow_timeout).await;

    // a slow standby may still attach after the budget; record that as
    // pending rather than failure
    let (event, details) = if attached {
        (
            event_type::STANDBY_FOLLOW,
            format!(
                "node {} is now attached to node {}",
                config.node_id, target.node_id
            ),
        )
    } else {
        (
            event_type::STANDBY_FOLLOW_PENDING,
            format!(
                "node {} did not attach to node {} within {} seconds, attachment pending",
                config.node_id, target.node_id, config.standby_follow_timeout
            ),
        )
    };

    events::create_event_notification(
        Some(&target_conn),
        config,
        config.node_id,
        event,
        attached,
        &details,
    )
    .await;

    if attached {
        println!("standby now following node {}", target.node_id);
    } else {
        println!(
            "follow initiated, node not yet attached to node {}",
            target.node_id
        );
    }

    target_conn.finish();
    local_conn.finish();
}

// ---------------------------------------------------------------------------
// standby switchover
// ---------------------------------------------------------------------------

/// Parse the machine-readable line emitted by
/// `node status --is-shutdown-cleanly` on the remote side.
fn parse_shutdown_status_line(line: &str) -> Option<(String, Option<Lsn>)> {
    let mut state = None;
    let mut checkpoint = None;

    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix("--state=") {
            state = Some(value.to_string());
        } else if let Some(value) = token.strip_prefix("--last-checkpoint-lsn=") {
            checkpoint = value.parse().ok();
        }
    }

    state.map(|s| (s, checkpoint))
}

/// Run a command on the demotion candidate over SSH, capturing stdout.
async fn remote_command(
    config: &Config,
    host: &str,
    remote_user: Option<&str>,
    command: &str,
) -> Option<String> {
    let target = match remote_user {
        Some(user) => format!("{}@{}", user, host),
        None => host.to_string(),
    };

    if let Some(password) = config.root_password.as_deref() {
        let options = format!("{} {}", config.ssh_options, target);
        match sshpass::run_ssh_with_password(&options, command, password).await {
            Ok(outcome) if outcome.status == SshpassStatus::Completed && outcome.exit_code == 0 => {
                Some(outcome.stdout)
            }
            Ok(outcome) => {
                warn!(
                    "remote command failed with status {:?} (exit code {})",
                    outcome.status, outcome.exit_code
                );
                None
            }
            Err(e) => {
                warn!("unable to execute remote command: {}", e);
                None
            }
        }
    } else {
        let full = format!("ssh {} {} {}", config.ssh_options, target, shell_quote(command));
        match local_command(&full).await {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                warn!("remote command failed: {}", output.stderr);
                None
            }
            Err(e) => {
                warn!("unable to execute remote command: {}", e);
                None
            }
        }
    }
}

fn shell_quote(command: &str) -> String {
    format!("'{}'", command.replace('\'', "'\\''"))
}

async fn do_standby_switchover(
    config: &Config,
    siblings_follow: bool,
    force_rewind: bool,
    remote_user: Option<String>,
) {
    let local_conn = establish_local_connection(config).await;
    let local_record = local_node_record(&local_conn, config).await;

    if status::get_recovery_type(&local_conn).await != RecoveryType::Standby {
        exit_error(
            "switchover must be executed from the standby to be promoted",
            ExitCode::SwitchoverFail,
        );
    }

    let (primary_conn, primary_id) = establish_primary_connection(&local_conn).await;
    let (_, primary_record) = nodes::get_node_record(&primary_conn, primary_id).await;
    let Some(primary_record) = primary_record else {
        primary_conn.finish();
        exit_error("unable to retrieve the primary node record", ExitCode::DbConn);
    };

    info!(
        "promoting {} and demoting current primary {}",
        local_record, primary_record
    );

    let Some(remote_host) = conninfo::get_conninfo_value(&primary_record.conninfo, "host") else {
        primary_conn.finish();
        exit_error(
            "unable to determine the demotion candidate's host",
            ExitCode::SwitchoverFail,
        );
    };

    // the primary's sessions are about to go away
    primary_conn.finish();

    // 1. shut the demotion candidate down with a checkpoint
    let stop_command = format!(
        "repmgr -f '{}' node service --action=stop --checkpoint",
        primary_record.config_file
    );
    if remote_command(config, &remote_host, remote_user.as_deref(), &stop_command)
        .await
        .is_none()
    {
        exit_error(
            "unable to shut down the demotion candidate",
            ExitCode::SwitchoverFail,
        );
    }

    // 2. wait for a clean shutdown and learn the final checkpoint
    let status_command = format!(
        "repmgr -f '{}' node status --is-shutdown-cleanly",
        primary_record.config_file
    );

    let deadline =
        Instant::now() + Duration::from_secs(config.shutdown_check_timeout.max(1) as u64);
    let shutdown_checkpoint: Lsn = loop {
        if let Some(output) =
            remote_command(config, &remote_host, remote_user.as_deref(), &status_command).await
        {
            if let Some(line) = output.lines().find(|l| l.contains("--state=")) {
                match parse_shutdown_status_line(line) {
                    Some((state, checkpoint)) if state == "SHUTDOWN" => {
                        break checkpoint.unwrap_or(Lsn::INVALID);
                    }
                    Some((state, _)) if state == "UNCLEAN_SHUTDOWN" || state == "UNKNOWN" => {
                        exit_error(
                            &format!("demotion candidate reports state {}", state),
                            ExitCode::SwitchoverFail,
                        );
                    }
                    _ => {}
                }
            }
        }

        if Instant::now() >= deadline {
            exit_error(
                &format!(
                    "demotion candidate did not shut down within {} seconds",
                    config.shutdown_check_timeout
                ),
                ExitCode::SwitchoverFail,
            );
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    };

    // 3. all WAL must have arrived here before promotion
    let local_receive = status::get_last_wal_receive_location(&local_conn).await;
    if shutdown_checkpoint.is_valid() && local_receive < shutdown_checkpoint {
        exit_error(
            &format!(
                "local receive position {} is behind the demoted primary's checkpoint {}",
                local_receive, shutdown_checkpoint
            ),
            ExitCode::SwitchoverFail,
        );
    }

    // 4. promote; records the standby_switchover event with the former
    // primary as the auxiliary node
    promote_local_standby(config, &local_conn, Some(primary_id)).await;

    // 5. rejoin the former primary below this node
    let rejoin_command = format!(
        "repmgr -f '{}' node rejoin -d '{}'{}",
        primary_record.config_file,
        local_record.conninfo,
        if force_rewind { " --force-rewind" } else { "" }
    );
    if remote_command(config, &remote_host, remote_user.as_deref(), &rejoin_command)
        .await
        .is_none()
    {
        warn!("former primary could not be rejoined automatically; run \"repmgr node rejoin\" on it manually");
    } else if let Err(e) = nodes::update_node_record_status(
        &local_conn,
        primary_id,
        NodeType::Standby,
        Some(config.node_id),
        true,
    )
    .await
    {
        warn!("unable to update the former primary's node record: {}", e);
    }

    // 6. re-point the remaining standbys
    if siblings_follow {
        match nodes::get_active_sibling_node_records(&local_conn, config.node_id, primary_id).await
        {
            Ok(siblings) => {
                for sibling in siblings
                    .iter()
                    .filter(|s| s.node_type == NodeType::Standby)
                {
                    match DbConn::establish_quiet(&sibling.conninfo).await {
                        Ok(conn) => {
                            if !voting::notify_follow_primary(&conn, config.node_id).await {
                                warn!("unable to notify node {} to follow", sibling);
                            }
                            conn.finish();
                        }
                        Err(_) => warn!("unable to connect to sibling node {}", sibling),
                    }
                }
            }
            Err(e) => warn!("unable to retrieve sibling records: {}", e),
        }
    }

    println!(
        "switchover complete: node {} is now primary, node {} is now a standby",
        config.node_id, primary_id
    );
    local_conn.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shutdown_status_line() {
        let (state, checkpoint) =
            parse_shutdown_status_line("--state=SHUTDOWN --last-checkpoint-lsn=16/B374D848")
                .unwrap();
        assert_eq!(state, "SHUTDOWN");
        assert_eq!(checkpoint, Some("16/B374D848".parse().unwrap()));
    }

    #[test]
    fn test_parse_shutdown_status_line_without_checkpoint() {
        let (state, checkpoint) = parse_shutdown_status_line("--state=RUNNING").unwrap();
        assert_eq!(state, "RUNNING");
        assert_eq!(checkpoint, None);

        let (state, _) = parse_shutdown_status_line("--state=UNCLEAN_SHUTDOWN").unwrap();
        assert_eq!(state, "UNCLEAN_SHUTDOWN");
    }

    #[test]
    fn test_parse_shutdown_status_line_rejects_noise() {
        assert!(parse_shutdown_status_line("Last login: yesterday").is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}

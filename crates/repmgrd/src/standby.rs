//! Standby monitoring loop.
//!
//! Each tick refreshes the local replication snapshot, writes a
//! monitoring record through the upstream session, and verifies the
//! upstream is still reachable. A failed check escalates into the timed
//! reconnect cycle; when that is exhausted the loop drops to degraded
//! monitoring and drives the failover protocol.

use std::time::Duration;

use tracing::{debug, info, warn};

use repmgr_core::catalog::{events, monitoring, nodes, rpc, status, voting};
use repmgr_core::command::local_command;
use repmgr_core::pool::DbConn;
use repmgr_proto::constants::ELECTION_RERUN_NOTIFICATION;
use repmgr_proto::event::event_type;
use repmgr_proto::node::{MonitoringState, NodeRecord, NodeType, ReplInfo};

use crate::daemon::{Daemon, LoopExit};
use crate::failover::{do_election, ElectionOutcome};
use crate::monitor::{check_upstream_connection, try_reconnect};

/// Run the standby loop until shutdown or a role change.
pub async fn monitor_standby(daemon: &mut Daemon, local_conn: &mut DbConn) -> LoopExit {
    let Some(upstream_node_id) = daemon.local_node.upstream_node_id else {
        warn!("standby node has no upstream node recorded, unable to monitor");
        return LoopExit::Terminate;
    };

    let (_, upstream_record) = nodes::get_node_record(local_conn, upstream_node_id).await;
    let Some(mut upstream_node) = upstream_record else {
        warn!(
            "unable to retrieve node record for upstream node {}",
            upstream_node_id
        );
        return LoopExit::Terminate;
    };

    info!(
        "monitoring connection to upstream node {}",
        upstream_node
    );

    let mut upstream_conn = match DbConn::establish_quiet(&upstream_node.conninfo).await {
        Ok(conn) => Some(conn),
        Err(_) => {
            warn!("unable to connect to upstream node {}", upstream_node);
            None
        }
    };

    let mut replication_info = ReplInfo::default();

    loop {
        if daemon.signals.terminate_requested() {
            return LoopExit::Terminate;
        }

        if daemon.signals.reload_requested() {
            if daemon.reload_config(Some(&*local_conn)).await {
                let _ = nodes::update_node_record_conn_priority(
                    local_conn,
                    daemon.config.node_id,
                    &daemon.config.conninfo,
                    daemon.config.priority,
                )
                .await;
            }
        }

        // refresh the local replication snapshot every tick
        status::get_replication_info(local_conn, NodeType::Standby, &mut replication_info).await;

        let upstream_ok = match upstream_conn.as_mut() {
            Some(conn) => check_upstream_connection(conn, &daemon.config).await,
            None => false,
        };

        if upstream_ok {
            daemon.resume_normal_monitoring();
            rpc::set_upstream_last_seen(local_conn, upstream_node.node_id).await;

            if daemon.config.monitoring_history {
                if let Some(conn) = upstream_conn.as_ref() {
                    write_monitoring_record(daemon, conn, &replication_info).await;
                }
            }
        } else {
            if let Some(conn) = upstream_conn.take() {
                warn!("unable to ping upstream node {}", upstream_node);
                conn.finish();
            }

            upstream_conn = try_reconnect(&upstream_node, &daemon.config).await;

            if upstream_conn.is_some() {
                if daemon.monitoring_state == MonitoringState::Degraded {
                    events::create_event_notification(
                        Some(&*local_conn),
                        &daemon.config,
                        daemon.config.node_id,
                        event_type::REPMGRD_UPSTREAM_RECONNECT,
                        true,
                        &format!(
                            "node {} has reconnected to upstream node {} after {} seconds",
                            daemon.config.node_id,
                            upstream_node.node_id,
                            daemon.degraded_seconds()
                        ),
                    )
                    .await;
                }
                daemon.resume_normal_monitoring();
            } else {
                if daemon.monitoring_state == MonitoringState::Normal {
                    events::create_event_notification(
                        Some(&*local_conn),
                        &daemon.config,
                        daemon.config.node_id,
                        event_type::REPMGRD_UPSTREAM_DISCONNECT,
                        true,
                        &format!(
                            "unable to connect to upstream node {}",
                            upstream_node.node_id
                        ),
                    )
                    .await;
                }
                daemon.enter_degraded_monitoring();

                match handle_degraded_state(daemon, local_conn, &upstream_node).await {
                    DegradedOutcome::Continue => {}
                    DegradedOutcome::RoleChange => return LoopExit::RoleChange,
                    DegradedOutcome::NewUpstream(record) => {
                        upstream_node = record;
                        upstream_conn =
                            DbConn::establish_quiet(&upstream_node.conninfo).await.ok();
                        daemon.resume_normal_monitoring();
                    }
                    DegradedOutcome::Terminate => return LoopExit::Terminate,
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(
            daemon.config.monitor_interval_secs as u64,
        ))
        .await;
    }
}

enum DegradedOutcome {
    Continue,
    /// This node was promoted.
    RoleChange,
    /// Followed a new primary; monitoring continues against it.
    NewUpstream(NodeRecord),
    Terminate,
}

/// One degraded-mode evaluation: act on a follow notification, otherwise
/// consider starting (or rerunning) an election.
async fn handle_degraded_state(
    daemon: &mut Daemon,
    local_conn: &DbConn,
    failed_upstream: &NodeRecord,
) -> DegradedOutcome {
    // a pause request stops the failover protocol, not monitoring
    if rpc::repmgrd_is_paused(local_conn).await {
        debug!("repmgrd is paused, not entering the failover protocol");
        return DegradedOutcome::Continue;
    }

    // has an election winner told us to follow it (or to rerun)?
    if let Some(new_primary_id) = voting::get_new_primary(local_conn).await {
        voting::reset_voting_status(local_conn).await;

        if new_primary_id == ELECTION_RERUN_NOTIFICATION {
            info!("election rerun requested");
        } else if new_primary_id == daemon.config.node_id {
            // we are the notified winner; the promotion happened in our
            // own election path, nothing to follow
            return DegradedOutcome::Continue;
        } else {
            info!("node {} is the new primary, following", new_primary_id);
            match follow_new_primary(daemon, local_conn, new_primary_id, failed_upstream).await {
                Some(record) => return DegradedOutcome::NewUpstream(record),
                None => return DegradedOutcome::Continue,
            }
        }
    }

    // degraded monitoring has a configurable overall budget
    let timeout = daemon.config.degraded_monitoring_timeout;
    if timeout >= 0 && daemon.degraded_seconds() >= timeout {
        warn!(
            "degraded monitoring timeout ({} seconds) exceeded, terminating",
            timeout
        );
        return DegradedOutcome::Terminate;
    }

    match do_election(daemon, local_conn, failed_upstream).await {
        ElectionOutcome::Promoted => DegradedOutcome::RoleChange,
        ElectionOutcome::Deferred
        | ElectionOutcome::Failed
        | ElectionOutcome::Manual
        | ElectionOutcome::NoCandidate => DegradedOutcome::Continue,
    }
}

/// Execute the follow: run the configured follow command, re-point our
/// catalog record, record the event. Returns the new upstream's record.
async fn follow_new_primary(
    daemon: &mut Daemon,
    local_conn: &DbConn,
    new_primary_id: i32,
    failed_upstream: &NodeRecord,
) -> Option<NodeRecord> {
    let (_, record) = nodes::get_node_record(local_conn, new_primary_id).await;
    let Some(new_primary) = record else {
        warn!(
            "unable to retrieve node record for new primary {}",
            new_primary_id
        );
        return None;
    };

    let new_primary_conn = match DbConn::establish_quiet(&new_primary.conninfo).await {
        Ok(conn) => conn,
        Err(_) => {
            warn!("unable to connect to new primary {}", new_primary);
            return None;
        }
    };

    let followed = match daemon.config.follow_command.as_deref() {
        Some(follow_command) => {
            info!("executing follow_command \"{}\"", follow_command);
            match local_command(follow_command).await {
                Ok(output) if output.success => true,
                Ok(output) => {
                    warn!(
                        "follow_command failed with exit code {:?}",
                        output.exit_code
                    );
                    false
                }
                Err(e) => {
                    warn!("unable to execute follow_command: {}", e);
                    false
                }
            }
        }
        None => {
            warn!("no follow_command configured, unable to re-point replication");
            false
        }
    };

    if !followed {
        events::create_event_notification(
            Some(&new_primary_conn),
            &daemon.config,
            daemon.config.node_id,
            event_type::REPMGRD_FAILOVER_FOLLOW,
            false,
            &format!(
                "node {} failed to follow new primary {}",
                daemon.config.node_id, new_primary_id
            ),
        )
        .await;
        new_primary_conn.finish();
        return None;
    }

    if let Err(e) = nodes::update_node_record_set_upstream(
        &new_primary_conn,
        daemon.config.node_id,
        new_primary_id,
    )
    .await
    {
        warn!("unable to update upstream node record: {}", e);
    }

    events::create_event_notification(
        Some(&new_primary_conn),
        &daemon.config,
        daemon.config.node_id,
        event_type::REPMGRD_FAILOVER_FOLLOW,
        true,
        &format!(
            "node {} now following new primary {} (former upstream: {})",
            daemon.config.node_id, new_primary_id, failed_upstream.node_id
        ),
    )
    .await;

    daemon.local_node.upstream_node_id = Some(new_primary_id);
    new_primary_conn.finish();

    Some(new_primary)
}

/// Write one heartbeat row through the upstream session.
async fn write_monitoring_record(
    daemon: &Daemon,
    upstream_conn: &DbConn,
    replication_info: &ReplInfo,
) {
    let primary_last_wal_location = status::get_primary_current_lsn(upstream_conn).await;

    let replication_lag_bytes = primary_last_wal_location
        .diff(replication_info.last_wal_receive_lsn) as i64;
    let apply_lag_bytes = replication_info
        .last_wal_receive_lsn
        .diff(replication_info.last_wal_replay_lsn) as i64;

    let upstream_node_id = daemon
        .local_node
        .upstream_node_id
        .unwrap_or(repmgr_proto::constants::UNKNOWN_NODE_ID);

    monitoring::add_monitoring_record(
        upstream_conn,
        upstream_node_id,
        daemon.config.node_id,
        &replication_info.current_timestamp,
        primary_last_wal_location,
        replication_info.last_wal_receive_lsn,
        &replication_info.last_xact_replay_timestamp,
        replication_lag_bytes,
        apply_lag_bytes,
    )
    .await;
}

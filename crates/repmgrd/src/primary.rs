//! Primary monitoring loop.
//!
//! The primary has no upstream to watch; the loop pings its own database,
//! keeps a compact inventory of downstream standbys to spot slot
//! anomalies, optionally vacuums the monitoring history, and makes sure
//! the configured virtual address stays bound.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};

use repmgr_core::catalog::{events, monitoring, nodes, slots, status};
use repmgr_core::pool::DbConn;
use repmgr_core::vip;
use repmgr_proto::event::event_type;
use repmgr_proto::node::{ConnectionStatus, RecoveryType};

use crate::daemon::{Daemon, LoopExit};
use crate::monitor::try_reconnect;

/// Ticks between monitoring-history vacuum passes.
const VACUUM_TICKS: u64 = 60;

/// Run the primary loop until shutdown or demotion.
pub async fn monitor_primary(daemon: &mut Daemon, local_conn: &mut DbConn) -> LoopExit {
    info!("monitoring cluster primary {}", daemon.local_node);

    let mut known_missing_slots: HashSet<i32> = HashSet::new();
    let mut tick: u64 = 0;

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

        if local_conn.ping().await != ConnectionStatus::Ok {
            warn!("unable to ping local database");
            match try_reconnect(&daemon.local_node, &daemon.config).await {
                Some(conn) => {
                    *local_conn = conn;
                    daemon.resume_normal_monitoring();

                    // the database may have come back as a standby after
                    // being rejoined by an operator
                    if status::get_recovery_type(local_conn).await == RecoveryType::Standby {
                        info!("local node is now a standby, switching monitoring mode");
                        return LoopExit::RoleChange;
                    }
                }
                None => {
                    daemon.enter_degraded_monitoring();
                    tokio::time::sleep(Duration::from_secs(
                        daemon.config.monitor_interval_secs as u64,
                    ))
                    .await;
                    continue;
                }
            }
        }

        if daemon.config.use_replication_slots {
            check_missing_slots(daemon, local_conn, &mut known_missing_slots).await;
        }

        if daemon.config.monitoring_history && tick % VACUUM_TICKS == 0 {
            if monitoring::delete_monitoring_records(local_conn, 1, None)
                .await
                .is_err()
            {
                warn!("unable to trim monitoring history");
            }
            status::vacuum_table(local_conn, "repmgr.monitoring_history").await;
        }

        // keep the virtual address bound while we hold the primary role
        if let (Some(virtual_ip), Some(network_card)) = (
            daemon.local_node.virtual_ip.clone(),
            daemon.local_node.network_card.clone(),
        ) {
            vip::bind_virtual_ip(&daemon.config, &virtual_ip, &network_card).await;
        }

        tick += 1;
        tokio::time::sleep(Duration::from_secs(
            daemon.config.monitor_interval_secs as u64,
        ))
        .await;
    }
}

/// Detect standbys whose configured replication slot is missing on this
/// node, emitting an event when an anomaly appears and when it clears.
async fn check_missing_slots(
    daemon: &Daemon,
    local_conn: &DbConn,
    known_missing: &mut HashSet<i32>,
) {
    let missing = match slots::get_downstream_nodes_with_missing_slot(
        local_conn,
        daemon.config.node_id,
    )
    .await
    {
        Ok(missing) => missing,
        Err(e) => {
            warn!("unable to check for missing replication slots: {}", e);
            return;
        }
    };

    let missing_ids: HashSet<i32> = missing.iter().map(|(id, _, _)| *id).collect();

    for (node_id, node_name, slot_name) in &missing {
        if known_missing.insert(*node_id) {
            warn!(
                "replication slot \"{}\" for node \"{}\" (ID: {}) is missing",
                slot_name, node_name, node_id
            );
            events::create_event_notification(
                Some(&*local_conn),
                &daemon.config,
                daemon.config.node_id,
                event_type::REPMGRD_SLOT_MISSING,
                false,
                &format!(
                    "replication slot \"{}\" for node \"{}\" (ID: {}) is missing",
                    slot_name, node_name, node_id
                ),
            )
            .await;
        }
    }

    let cleared: Vec<i32> = known_missing.difference(&missing_ids).copied().collect();
    for node_id in cleared {
        known_missing.remove(&node_id);
        info!(
            "replication slot for node {} is present again",
            node_id
        );
        events::create_event_notification(
            Some(&*local_conn),
            &daemon.config,
            daemon.config.node_id,
            event_type::REPMGRD_SLOT_RECREATED,
            true,
            &format!("replication slot for node {} is present again", node_id),
        )
        .await;
    }
}

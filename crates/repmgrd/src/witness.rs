//! Witness monitoring loop.
//!
//! A witness carries no replication responsibility: it keeps a local copy
//! of the nodes table so elections can consult it when the primary is
//! gone, and it votes, but it never stands as a candidate.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use repmgr_core::catalog::{nodes, rpc};
use repmgr_core::pool::{self, DbConn};

use crate::daemon::{Daemon, LoopExit};
use crate::monitor::{check_upstream_connection, try_reconnect};

/// Run the witness loop until shutdown.
pub async fn monitor_witness(daemon: &mut Daemon, local_conn: &mut DbConn) -> LoopExit {
    let (mut primary_conn, mut primary_id) = match pool::get_primary_connection(local_conn).await {
        Ok((conn, id)) => (Some(conn), id),
        Err(e) => {
            warn!("unable to connect to the primary: {}", e);
            (None, repmgr_proto::constants::UNKNOWN_NODE_ID)
        }
    };

    info!("witness monitoring primary node {}", primary_id);

    let mut last_sync: Option<Instant> = None;

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

        let primary_ok = match primary_conn.as_mut() {
            Some(conn) => check_upstream_connection(conn, &daemon.config).await,
            None => false,
        };

        if primary_ok {
            daemon.resume_normal_monitoring();
            rpc::set_upstream_last_seen(local_conn, primary_id).await;

            let sync_due = last_sync
                .map(|at| at.elapsed().as_secs() >= daemon.config.witness_sync_interval as u64)
                .unwrap_or(true);

            if sync_due {
                if let Some(conn) = primary_conn.as_ref() {
                    if let Err(e) = nodes::witness_copy_node_records(conn, local_conn).await {
                        warn!("unable to copy node records from primary: {}", e);
                    } else {
                        last_sync = Some(Instant::now());
                    }
                }
            }
        } else {
            if let Some(conn) = primary_conn.take() {
                warn!("unable to ping primary node {}", primary_id);
                conn.finish();
            }

            // reconnect to the recorded primary, then fall back to
            // whatever the (locally copied) catalog now says is primary
            let primary_record = match nodes::get_primary_node_record(local_conn).await {
                Some(record) => record,
                None => {
                    daemon.enter_degraded_monitoring();
                    tokio::time::sleep(Duration::from_secs(
                        daemon.config.monitor_interval_secs as u64,
                    ))
                    .await;
                    continue;
                }
            };

            match try_reconnect(&primary_record, &daemon.config).await {
                Some(conn) => {
                    primary_id = primary_record.node_id;
                    primary_conn = Some(conn);
                    daemon.resume_normal_monitoring();
                    info!("witness reconnected to primary node {}", primary_id);
                }
                None => {
                    daemon.enter_degraded_monitoring();
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(
            daemon.config.monitor_interval_secs as u64,
        ))
        .await;
    }
}

//! Read-only server state queries.
//!
//! None of these mutate the catalog; they report the engine's recovery
//! state, WAL positions, replication lag and downstream attachment as
//! observed through one session.

use tracing::{debug, warn};

use repmgr_proto::constants::{UNKNOWN_NODE_ID, UNKNOWN_REPLICATION_LAG, UNKNOWN_TIMELINE_ID};
use repmgr_proto::node::{NodeAttached, NodeReplicationStats, NodeType, RecoveryType, ReplInfo};
use repmgr_proto::{Lsn, RepmgrError, RepmgrResult};

use crate::pool::DbConn;

/// Determine whether the server is a primary or a replaying standby.
pub async fn get_recovery_type(conn: &DbConn) -> RecoveryType {
    match conn
        .client()
        .query_one("SELECT ux_catalog.ux_is_in_recovery()", &[])
        .await
    {
        Ok(row) => {
            if row.get::<_, bool>(0) {
                RecoveryType::Standby
            } else {
                RecoveryType::Primary
            }
        }
        Err(e) => {
            warn!("unable to determine recovery type: {}", e);
            RecoveryType::Unknown
        }
    }
}

/// Node id of the active primary according to the nodes table.
pub async fn get_primary_node_id(conn: &DbConn) -> i32 {
    match conn
        .client()
        .query_opt(
            "SELECT node_id FROM repmgr.nodes \
              WHERE type = 'primary' AND active IS TRUE",
            &[],
        )
        .await
    {
        Ok(Some(row)) => row.get(0),
        Ok(None) => UNKNOWN_NODE_ID,
        Err(e) => {
            warn!("unable to determine primary node id: {}", e);
            UNKNOWN_NODE_ID
        }
    }
}

/// Current WAL insert position on a primary.
pub async fn get_primary_current_lsn(conn: &DbConn) -> Lsn {
    lsn_query(conn, "SELECT ux_catalog.ux_current_wal_lsn()").await
}

/// Last WAL position received from the upstream on a standby.
pub async fn get_last_wal_receive_location(conn: &DbConn) -> Lsn {
    lsn_query(conn, "SELECT ux_catalog.ux_last_wal_receive_lsn()").await
}

/// Latest LSN for the node regardless of recovery state.
///
/// On a primary this is the current insert position; on a standby, the
/// later of the receive and replay positions.
pub async fn get_node_current_lsn(conn: &DbConn) -> Lsn {
    let query = " WITH lsn_states AS ( \
                    SELECT \
                      CASE WHEN ux_catalog.ux_is_in_recovery() IS FALSE \
                        THEN ux_catalog.ux_current_wal_lsn() ELSE NULL \
                      END AS current_wal_lsn, \
                      CASE WHEN ux_catalog.ux_is_in_recovery() IS TRUE \
                        THEN ux_catalog.ux_last_wal_receive_lsn() ELSE NULL \
                      END AS last_wal_receive_lsn, \
                      CASE WHEN ux_catalog.ux_is_in_recovery() IS TRUE \
                        THEN ux_catalog.ux_last_wal_replay_lsn() ELSE NULL \
                      END AS last_wal_replay_lsn \
                  ) \
                  SELECT CASE WHEN ux_catalog.ux_is_in_recovery() IS FALSE \
                           THEN current_wal_lsn \
                           ELSE CASE WHEN last_wal_receive_lsn IS NULL \
                                  THEN last_wal_replay_lsn \
                                  ELSE CASE WHEN last_wal_replay_lsn > last_wal_receive_lsn \
                                         THEN last_wal_replay_lsn \
                                         ELSE last_wal_receive_lsn \
                                       END \
                                END \
                         END::TEXT AS current_lsn \
                    FROM lsn_states ";

    lsn_query(conn, query).await
}

async fn lsn_query(conn: &DbConn, query: &str) -> Lsn {
    match conn.client().query_one(query, &[]).await {
        Ok(row) => row
            .get::<_, Option<String>>(0)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Lsn::INVALID),
        Err(e) => {
            warn!("unable to retrieve WAL location: {}", e);
            Lsn::INVALID
        }
    }
}

/// Refresh the full replication-info snapshot for one monitored server.
///
/// Witnesses read the shared-state upstream fields unconditionally; for
/// other roles the fields are only meaningful while in recovery.
pub async fn get_replication_info(
    conn: &DbConn,
    node_type: NodeType,
    replication_info: &mut ReplInfo,
) -> bool {
    let upstream_fields = if node_type == NodeType::Witness {
        "        repmgr.get_upstream_last_seen() AS upstream_last_seen, \
                 repmgr.get_upstream_node_id() AS upstream_node_id "
    } else {
        "        CASE WHEN ux_catalog.ux_is_in_recovery() IS FALSE \
                   THEN -1 ELSE repmgr.get_upstream_last_seen() \
                 END AS upstream_last_seen, \
                 CASE WHEN ux_catalog.ux_is_in_recovery() IS FALSE \
                   THEN -1 ELSE repmgr.get_upstream_node_id() \
                 END AS upstream_node_id "
    };

    let query = format!(
        " SELECT ts::TEXT, \
                 in_recovery, \
                 last_wal_receive_lsn::TEXT, \
                 last_wal_replay_lsn::TEXT, \
                 last_xact_replay_timestamp::TEXT, \
                 CASE WHEN (last_wal_receive_lsn = last_wal_replay_lsn) \
                   THEN 0::INT \
                 ELSE \
                   CASE WHEN last_xact_replay_timestamp IS NULL \
                     THEN 0::INT \
                   ELSE \
                     EXTRACT(epoch FROM (ux_catalog.clock_timestamp() - last_xact_replay_timestamp))::INT \
                   END \
                 END AS replication_lag_time, \
                 last_wal_receive_lsn >= last_wal_replay_lsn AS receiving_streamed_wal, \
                 wal_replay_paused, \
                 upstream_last_seen, \
                 upstream_node_id \
            FROM ( \
          SELECT CURRENT_TIMESTAMP AS ts, \
                 ux_catalog.ux_is_in_recovery() AS in_recovery, \
                 ux_catalog.ux_last_xact_replay_timestamp() AS last_xact_replay_timestamp, \
                 COALESCE(ux_catalog.ux_last_wal_receive_lsn(), '0/0'::UX_LSN) AS last_wal_receive_lsn, \
                 COALESCE(ux_catalog.ux_last_wal_replay_lsn(),  '0/0'::UX_LSN) AS last_wal_replay_lsn, \
                 CASE WHEN ux_catalog.ux_is_in_recovery() IS FALSE \
                   THEN FALSE \
                   ELSE ux_catalog.ux_is_wal_replay_paused() \
                 END AS wal_replay_paused, \
          {upstream_fields} \
                 ) q "
    );

    let row = match conn.client().query_one(&query, &[]).await {
        Ok(row) => row,
        Err(e) => {
            warn!("unable to retrieve replication info: {}", e);
            return false;
        }
    };

    replication_info.current_timestamp = row.get::<_, String>(0);
    replication_info.in_recovery = row.get(1);
    replication_info.last_wal_receive_lsn =
        row.get::<_, String>(2).parse().unwrap_or(Lsn::INVALID);
    replication_info.last_wal_replay_lsn =
        row.get::<_, String>(3).parse().unwrap_or(Lsn::INVALID);
    replication_info.last_xact_replay_timestamp =
        row.get::<_, Option<String>>(4).unwrap_or_default();
    replication_info.replication_lag_time = row.get(5);
    replication_info.receiving_streamed_wal = row.get(6);
    replication_info.wal_replay_paused = row.get(7);
    replication_info.upstream_last_seen = row.get(8);
    replication_info.upstream_node_id = row.get(9);

    true
}

/// Apply lag in seconds on a standby; sentinel when unknown.
pub async fn get_replication_lag_seconds(conn: &DbConn) -> i32 {
    let query = " SELECT CASE WHEN (ux_catalog.ux_last_wal_receive_lsn() = ux_catalog.ux_last_wal_replay_lsn()) \
                    THEN 0 \
                    ELSE EXTRACT(epoch FROM (ux_catalog.clock_timestamp() - ux_catalog.ux_last_xact_replay_timestamp()))::INT \
                  END AS lag_seconds";

    match conn.client().query_one(query, &[]).await {
        Ok(row) => row.get::<_, Option<i32>>(0).unwrap_or(UNKNOWN_REPLICATION_LAG),
        Err(e) => {
            warn!("unable to retrieve replication lag: {}", e);
            UNKNOWN_REPLICATION_LAG
        }
    }
}

/// Current timeline id from the engine's control checkpoint view.
pub async fn get_node_timeline(conn: &DbConn) -> u32 {
    match conn
        .client()
        .query_one(
            "SELECT timeline_id FROM ux_catalog.ux_control_checkpoint()",
            &[],
        )
        .await
    {
        Ok(row) => row.get::<_, i32>(0) as u32,
        Err(e) => {
            warn!("unable to retrieve node timeline: {}", e);
            UNKNOWN_TIMELINE_ID
        }
    }
}

/// Check whether a named downstream node is attached to this server's
/// replication view. Returns the observed state string alongside.
pub async fn is_downstream_node_attached(
    conn: &DbConn,
    node_name: &str,
) -> (NodeAttached, Option<String>) {
    let row = match conn
        .client()
        .query_opt(
            "SELECT state FROM ux_catalog.ux_stat_replication \
              WHERE application_name = $1",
            &[&node_name],
        )
        .await
    {
        Ok(row) => row,
        Err(e) => {
            warn!(
                "unable to query ux_stat_replication for node \"{}\": {}",
                node_name, e
            );
            return (NodeAttached::Unknown, None);
        }
    };

    match row {
        Some(row) => {
            let state: String = row.get(0);
            if state == "streaming" {
                (NodeAttached::Attached, Some(state))
            } else {
                (NodeAttached::NotAttached, Some(state))
            }
        }
        None => (NodeAttached::Detached, None),
    }
}

/// PID of the WAL receiver process, if one is running.
pub async fn get_wal_receiver_pid(conn: &DbConn) -> i32 {
    match conn
        .client()
        .query_one("SELECT repmgr.get_wal_receiver_pid()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<i32>>(0).unwrap_or(-1),
        Err(e) => {
            warn!("unable to retrieve WAL receiver pid: {}", e);
            -1
        }
    }
}

/// Aggregate replication statistics for `node check` / `cluster show`.
pub async fn get_node_replication_stats(conn: &DbConn, stats: &mut NodeReplicationStats) -> bool {
    let query = " SELECT ux_catalog.current_setting('max_wal_senders')::INT AS max_wal_senders, \
                         (SELECT COUNT(*)::INT FROM ux_catalog.ux_stat_replication) AS attached_wal_receivers, \
                         ux_catalog.current_setting('max_replication_slots')::INT AS max_replication_slots, \
                         (SELECT COUNT(*)::INT FROM ux_catalog.ux_replication_slots \
                           WHERE slot_type = 'physical') AS total_replication_slots, \
                         (SELECT COUNT(*)::INT FROM ux_catalog.ux_replication_slots \
                           WHERE active IS TRUE AND slot_type = 'physical') AS active_replication_slots, \
                         (SELECT COUNT(*)::INT FROM ux_catalog.ux_replication_slots \
                           WHERE active IS FALSE AND slot_type = 'physical') AS inactive_replication_slots ";

    match conn.client().query_one(query, &[]).await {
        Ok(row) => {
            stats.max_wal_senders = row.get(0);
            stats.attached_wal_receivers = row.get(1);
            stats.max_replication_slots = row.get(2);
            stats.total_replication_slots = row.get(3);
            stats.active_replication_slots = row.get(4);
            stats.inactive_replication_slots = row.get(5);
            true
        }
        Err(e) => {
            warn!("unable to retrieve node replication statistics: {}", e);
            false
        }
    }
}

/// Read a single engine setting as text.
pub async fn get_ux_setting(conn: &DbConn, setting: &str) -> Option<String> {
    match conn
        .client()
        .query_one("SELECT ux_catalog.current_setting($1)", &[&setting])
        .await
    {
        Ok(row) => Some(row.get(0)),
        Err(e) => {
            warn!("unable to retrieve setting \"{}\": {}", setting, e);
            None
        }
    }
}

pub async fn get_ux_setting_bool(conn: &DbConn, setting: &str) -> Option<bool> {
    get_ux_setting(conn, setting)
        .await
        .map(|v| v == "on" || v == "true" || v == "1")
}

pub async fn get_ux_setting_int(conn: &DbConn, setting: &str) -> Option<i64> {
    get_ux_setting(conn, setting).await.and_then(|v| v.parse().ok())
}

/// Engine version number (e.g. 120005), read from the running server.
pub async fn get_server_version_num(conn: &DbConn) -> Option<i32> {
    get_ux_setting_int(conn, "server_version_num")
        .await
        .map(|v| v as i32)
}

/// Issue a CHECKPOINT. Requires a superuser session.
pub async fn checkpoint(conn: &DbConn) -> RepmgrResult<()> {
    conn.client()
        .batch_execute("CHECKPOINT")
        .await
        .map_err(|e| RepmgrError::Protocol(format!("unable to execute CHECKPOINT: {}", e)))
}

/// Vacuum one catalog table; used for monitoring-history maintenance.
pub async fn vacuum_table(conn: &DbConn, table: &str) -> bool {
    // table names come from a fixed internal set, never from user input
    match conn
        .client()
        .batch_execute(&format!("VACUUM {}", table))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to vacuum table \"{}\": {}", table, e);
            false
        }
    }
}

/// Ask the engine to promote, optionally waiting for completion.
pub async fn promote_standby(conn: &DbConn, wait: bool, wait_seconds: i32) -> RepmgrResult<bool> {
    let row = conn
        .client()
        .query_one(
            "SELECT ux_catalog.ux_promote($1, $2)",
            &[&wait, &wait_seconds],
        )
        .await
        .map_err(|e| RepmgrError::Protocol(format!("unable to execute ux_promote(): {}", e)))?;

    Ok(row.get(0))
}

/// Resume WAL replay if it was paused; harmless when not paused.
pub async fn resume_wal_replay(conn: &DbConn) -> bool {
    match conn
        .client()
        .batch_execute("SELECT ux_catalog.ux_wal_replay_resume()")
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to resume WAL replay: {}", e);
            false
        }
    }
}

/// Check whether the session's user is a superuser.
pub async fn is_superuser_connection(conn: &DbConn) -> bool {
    match conn
        .client()
        .query_one(
            "SELECT usesuper FROM ux_catalog.ux_user WHERE usename = current_user",
            &[],
        )
        .await
    {
        Ok(row) => row.get(0),
        Err(e) => {
            debug!("unable to determine superuser status: {}", e);
            false
        }
    }
}

/// Run IDENTIFY_SYSTEM on a replication channel.
pub struct SystemIdentification {
    pub system_identifier: u64,
    pub timeline: u32,
    pub xlogpos: Lsn,
}

pub async fn identify_system(repl_conn: &DbConn) -> RepmgrResult<SystemIdentification> {
    let messages = repl_conn
        .client()
        .simple_query("IDENTIFY_SYSTEM")
        .await
        .map_err(|e| RepmgrError::Protocol(format!("unable to execute IDENTIFY_SYSTEM: {}", e)))?;

    for msg in messages {
        if let tokio_postgres::SimpleQueryMessage::Row(row) = msg {
            let system_identifier = row
                .get(0)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| RepmgrError::Protocol("malformed IDENTIFY_SYSTEM reply".into()))?;
            let timeline = row
                .get(1)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| RepmgrError::Protocol("malformed IDENTIFY_SYSTEM reply".into()))?;
            let xlogpos = row
                .get(2)
                .and_then(|v| v.parse().ok())
                .unwrap_or(Lsn::INVALID);

            return Ok(SystemIdentification {
                system_identifier,
                timeline,
                xlogpos,
            });
        }
    }

    Err(RepmgrError::Protocol(
        "IDENTIFY_SYSTEM returned no rows".into(),
    ))
}

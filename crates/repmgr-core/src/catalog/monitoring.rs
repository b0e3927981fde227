//! Standby heartbeat records.
//!
//! Each monitoring tick on a standby writes one row into
//! `repmgr.monitoring_history` on the primary; retention is enforced
//! separately by `cluster cleanup`.

use tracing::warn;

use repmgr_proto::{Lsn, RepmgrError, RepmgrResult};

use crate::pool::DbConn;

/// Write one heartbeat row via the upstream session.
#[allow(clippy::too_many_arguments)]
pub async fn add_monitoring_record(
    primary_conn: &DbConn,
    primary_node_id: i32,
    standby_node_id: i32,
    monitor_standby_timestamp: &str,
    primary_last_wal_location: Lsn,
    last_wal_receive_lsn: Lsn,
    last_xact_replay_timestamp: &str,
    replication_lag_bytes: i64,
    apply_lag_bytes: i64,
) -> bool {
    let result = primary_conn
        .client()
        .execute(
            " INSERT INTO repmgr.monitoring_history ( \
                     primary_node_id, \
                     standby_node_id, \
                     last_monitor_time, \
                     last_apply_time, \
                     last_wal_primary_location, \
                     last_wal_standby_location, \
                     replication_lag, \
                     apply_lag \
              ) VALUES ($1, $2, $3::TIMESTAMP WITH TIME ZONE, \
                        NULLIF($4, '')::TIMESTAMP WITH TIME ZONE, $5, $6, $7, $8) ",
            &[
                &primary_node_id,
                &standby_node_id,
                &monitor_standby_timestamp,
                &last_xact_replay_timestamp,
                &primary_last_wal_location.to_string(),
                &last_wal_receive_lsn.to_string(),
                &replication_lag_bytes,
                &apply_lag_bytes,
            ],
        )
        .await;

    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("unable to add monitoring record: {}", e);
            false
        }
    }
}

/// How many heartbeat rows a cleanup with the given retention would delete.
pub async fn get_number_of_monitoring_records_to_delete(
    primary_conn: &DbConn,
    keep_history_days: i32,
    node_id: Option<i32>,
) -> RepmgrResult<i64> {
    let mut query = String::from(
        "SELECT COUNT(*) FROM repmgr.monitoring_history \
          WHERE age(now(), last_monitor_time) >= $1::TEXT::INTERVAL",
    );

    let interval = format!("{} DAYS", keep_history_days);
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&interval];

    if let Some(ref node_id) = node_id {
        params.push(node_id);
        query.push_str(" AND standby_node_id = $2");
    }

    let row = primary_conn
        .client()
        .query_one(&query, &params)
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!("unable to count monitoring records: {}", e))
        })?;

    Ok(row.get(0))
}

/// Delete heartbeat rows older than the retention window.
pub async fn delete_monitoring_records(
    primary_conn: &DbConn,
    keep_history_days: i32,
    node_id: Option<i32>,
) -> RepmgrResult<u64> {
    let mut query = String::from(
        "DELETE FROM repmgr.monitoring_history \
          WHERE age(now(), last_monitor_time) >= $1::TEXT::INTERVAL",
    );

    let interval = format!("{} DAYS", keep_history_days);
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&interval];

    if let Some(ref node_id) = node_id {
        params.push(node_id);
        query.push_str(" AND standby_node_id = $2");
    }

    primary_conn
        .client()
        .execute(&query, &params)
        .await
        .map_err(|e| RepmgrError::Catalog(format!("unable to delete monitoring records: {}", e)))
}

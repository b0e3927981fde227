//! Physical replication slot management.
//!
//! Two creation paths exist because early engine versions only allowed
//! slot creation over a replication channel. Both paths first verify any
//! existing slot of the same name: a physical, inactive slot is reused
//! as-is; an active or non-physical slot is an error.
//!
//! Slot names are never user-supplied: they are derived from the node id.

use tracing::{debug, warn};

use repmgr_proto::constants::SLOT_NAME_PREFIX;
use repmgr_proto::node::{RecordStatus, ReplicationSlot, SlotStatus};
use repmgr_proto::{RepmgrError, RepmgrResult};

use crate::pool::DbConn;

/// Deterministic slot name for a node id.
pub fn create_slot_name(node_id: i32) -> String {
    format!("{}{}", SLOT_NAME_PREFIX, node_id)
}

/// Fetch the slot record for a named slot.
pub async fn get_slot_record(
    conn: &DbConn,
    slot_name: &str,
) -> (RecordStatus, Option<ReplicationSlot>) {
    match conn
        .client()
        .query_opt(
            "SELECT slot_name, slot_type, active \
               FROM ux_catalog.ux_replication_slots \
              WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
    {
        Ok(Some(row)) => (
            RecordStatus::Found,
            Some(ReplicationSlot {
                slot_name: row.get(0),
                slot_type: row.get(1),
                active: row.get(2),
            }),
        ),
        Ok(None) => (RecordStatus::NotFound, None),
        Err(e) => {
            warn!("unable to query ux_replication_slots: {}", e);
            (RecordStatus::Error, None)
        }
    }
}

/// Check whether a slot of the given name exists and in what state.
///
/// `SlotStatus::Inactive` means a physical slot exists and may be reused;
/// `NotFound` means one must be created; the remaining states are errors
/// the caller reports.
pub async fn verify_replication_slot(conn: &DbConn, slot_name: &str) -> SlotStatus {
    let (record_status, slot) = get_slot_record(conn, slot_name).await;

    match (record_status, slot) {
        (RecordStatus::Error, _) => SlotStatus::Unknown,
        (RecordStatus::NotFound, _) | (_, None) => SlotStatus::NotFound,
        (RecordStatus::Found, Some(slot)) => {
            if slot.slot_type != "physical" {
                SlotStatus::NotPhysical
            } else if slot.active {
                SlotStatus::Active
            } else {
                debug!(
                    "replication slot \"{}\" exists but is inactive; reusing",
                    slot_name
                );
                SlotStatus::Inactive
            }
        }
    }
}

/// Create (or reuse) a physical slot via the SQL function interface.
pub async fn create_replication_slot_sql(conn: &DbConn, slot_name: &str) -> RepmgrResult<()> {
    match verify_replication_slot(conn, slot_name).await {
        SlotStatus::Inactive => return Ok(()),
        SlotStatus::NotPhysical => {
            return Err(RepmgrError::Protocol(format!(
                "slot \"{}\" exists and is not a physical slot",
                slot_name
            )))
        }
        SlotStatus::Active => {
            return Err(RepmgrError::Protocol(format!(
                "slot \"{}\" already exists as an active slot",
                slot_name
            )))
        }
        _ => {}
    }

    debug!("creating replication slot \"{}\" on upstream", slot_name);

    // second argument reserves WAL immediately
    conn.client()
        .execute(
            "SELECT * FROM ux_catalog.ux_create_physical_replication_slot($1, TRUE)",
            &[&slot_name],
        )
        .await
        .map_err(|e| {
            RepmgrError::Protocol(format!(
                "unable to create replication slot \"{}\" on the upstream node: {}",
                slot_name, e
            ))
        })?;

    Ok(())
}

/// Create (or reuse) a physical slot via a replication-protocol command.
///
/// `conn` is a normal session used for the verification query; `repl_conn`
/// is the replication channel the command is issued on.
pub async fn create_replication_slot_replprot(
    conn: &DbConn,
    repl_conn: &DbConn,
    slot_name: &str,
) -> RepmgrResult<()> {
    match verify_replication_slot(conn, slot_name).await {
        SlotStatus::Inactive => return Ok(()),
        SlotStatus::NotPhysical => {
            return Err(RepmgrError::Protocol(format!(
                "slot \"{}\" exists and is not a physical slot",
                slot_name
            )))
        }
        SlotStatus::Active => {
            return Err(RepmgrError::Protocol(format!(
                "slot \"{}\" already exists as an active slot",
                slot_name
            )))
        }
        _ => {}
    }

    // replication-protocol commands take no bind parameters; the slot name
    // is internally derived and safe to interpolate
    repl_conn
        .client()
        .simple_query(&format!(
            "CREATE_REPLICATION_SLOT {} PHYSICAL RESERVE_WAL;",
            slot_name
        ))
        .await
        .map_err(|e| {
            RepmgrError::Protocol(format!(
                "unable to create replication slot \"{}\" on the upstream node: {}",
                slot_name, e
            ))
        })?;

    Ok(())
}

/// Drop a slot via the SQL function interface.
pub async fn drop_replication_slot_sql(conn: &DbConn, slot_name: &str) -> bool {
    match conn
        .client()
        .execute(
            "SELECT ux_catalog.ux_drop_replication_slot($1)",
            &[&slot_name],
        )
        .await
    {
        Ok(_) => {
            debug!("replication slot \"{}\" successfully dropped", slot_name);
            true
        }
        Err(e) => {
            warn!(
                "unable to drop replication slot \"{}\": {}",
                slot_name, e
            );
            false
        }
    }
}

/// Drop a slot via a replication-protocol command.
pub async fn drop_replication_slot_replprot(repl_conn: &DbConn, slot_name: &str) -> bool {
    match repl_conn
        .client()
        .simple_query(&format!("DROP_REPLICATION_SLOT {}", slot_name))
        .await
    {
        Ok(_) => {
            debug!("replication slot \"{}\" successfully dropped", slot_name);
            true
        }
        Err(e) => {
            warn!(
                "unable to drop replication slot \"{}\": {}",
                slot_name, e
            );
            false
        }
    }
}

/// Drop the named slot if it exists and is inactive; an active slot is
/// left alone with a warning.
pub async fn drop_replication_slot_if_exists(conn: &DbConn, slot_name: &str) -> bool {
    match verify_replication_slot(conn, slot_name).await {
        SlotStatus::NotFound => true,
        SlotStatus::Inactive => drop_replication_slot_sql(conn, slot_name).await,
        SlotStatus::Active => {
            warn!(
                "replication slot \"{}\" is still active, not dropping",
                slot_name
            );
            false
        }
        _ => false,
    }
}

/// All inactive physical slots as (name, type) pairs.
pub async fn get_inactive_replication_slots(conn: &DbConn) -> RepmgrResult<Vec<(String, String)>> {
    let rows = conn
        .client()
        .query(
            "SELECT slot_name, slot_type \
               FROM ux_catalog.ux_replication_slots \
              WHERE active IS FALSE AND slot_type = 'physical' \
           ORDER BY slot_name",
            &[],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!("unable to list inactive replication slots: {}", e))
        })?;

    Ok(rows
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect())
}

/// Free slot headroom on the upstream: (free, max_replication_slots).
pub async fn get_free_replication_slot_count(conn: &DbConn) -> RepmgrResult<(i64, i64)> {
    let row = conn
        .client()
        .query_one(
            "SELECT ux_catalog.current_setting('max_replication_slots')::BIGINT - COUNT(*), \
                    ux_catalog.current_setting('max_replication_slots')::BIGINT \
               FROM ux_catalog.ux_replication_slots",
            &[],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!("unable to count free replication slots: {}", e))
        })?;

    Ok((row.get(0), row.get(1)))
}

/// Downstream nodes of this node whose configured slot is missing on it.
pub async fn get_downstream_nodes_with_missing_slot(
    conn: &DbConn,
    this_node_id: i32,
) -> RepmgrResult<Vec<(i32, String, String)>> {
    let rows = conn
        .client()
        .query(
            "  SELECT n.node_id, n.node_name, n.slot_name \
                 FROM repmgr.nodes n \
            LEFT JOIN ux_catalog.ux_replication_slots s ON s.slot_name = n.slot_name \
                WHERE n.upstream_node_id = $1 \
                  AND n.active IS TRUE \
                  AND n.slot_name IS NOT NULL \
                  AND s.slot_name IS NULL \
             ORDER BY n.node_id",
            &[&this_node_id],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!(
                "unable to check for missing replication slots: {}",
                e
            ))
        })?;

    Ok(rows
        .iter()
        .map(|row| (row.get(0), row.get(1), row.get(2)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_name_is_deterministic() {
        assert_eq!(create_slot_name(5), "repmgr_slot_5");
        assert_eq!(create_slot_name(5), create_slot_name(5));
        assert_ne!(create_slot_name(5), create_slot_name(6));
    }
}

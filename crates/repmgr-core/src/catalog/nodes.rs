//! Node record operations on the `repmgr.nodes` table.
//!
//! Insert and update share one parameterised statement shape. Role flips
//! that must hold the primary-uniqueness invariant run as short
//! transactions: deactivate the old primary, then mark the new one, and
//! roll back on any statement failure.

use tracing::{debug, warn};

use repmgr_proto::constants::UNKNOWN_NODE_ID;
use repmgr_proto::node::{NodeRecord, NodeType, RecordStatus};
use repmgr_proto::{RepmgrError, RepmgrResult};

use crate::pool::DbConn;
use crate::catalog::status::get_primary_node_id;

const NODE_COLUMNS: &str = "n.node_id, n.type, n.upstream_node_id, n.node_name, n.conninfo, \
     n.repluser, n.slot_name, n.location, n.priority, n.active, \
     n.config_file, n.virtual_ip, n.network_card";

fn record_from_row(row: &tokio_postgres::Row) -> NodeRecord {
    NodeRecord {
        node_id: row.get(0),
        node_type: row
            .get::<_, String>(1)
            .parse()
            .unwrap_or(NodeType::Unknown),
        upstream_node_id: row.get(2),
        node_name: row.get(3),
        conninfo: row.get(4),
        repluser: row.get(5),
        slot_name: row.get::<_, Option<String>>(6).filter(|s| !s.is_empty()),
        location: row.get(7),
        priority: row.get(8),
        active: row.get(9),
        config_file: row.get(10),
        virtual_ip: row.get::<_, Option<String>>(11).filter(|s| !s.is_empty()),
        network_card: row.get::<_, Option<String>>(12).filter(|s| !s.is_empty()),
    }
}

/// Fetch one node record by id.
pub async fn get_node_record(conn: &DbConn, node_id: i32) -> (RecordStatus, Option<NodeRecord>) {
    let query = format!(
        "SELECT {NODE_COLUMNS} FROM repmgr.nodes n WHERE n.node_id = $1"
    );

    match conn.client().query_opt(&query, &[&node_id]).await {
        Ok(Some(row)) => (RecordStatus::Found, Some(record_from_row(&row))),
        Ok(None) => (RecordStatus::NotFound, None),
        Err(e) => {
            warn!("unable to retrieve node record for node {}: {}", node_id, e);
            (RecordStatus::Error, None)
        }
    }
}

/// Fetch one node record by its unique name.
pub async fn get_node_record_by_name(
    conn: &DbConn,
    node_name: &str,
) -> (RecordStatus, Option<NodeRecord>) {
    let query = format!(
        "SELECT {NODE_COLUMNS} FROM repmgr.nodes n WHERE n.node_name = $1"
    );

    match conn.client().query_opt(&query, &[&node_name]).await {
        Ok(Some(row)) => (RecordStatus::Found, Some(record_from_row(&row))),
        Ok(None) => (RecordStatus::NotFound, None),
        Err(e) => {
            warn!(
                "unable to retrieve node record for node \"{}\": {}",
                node_name, e
            );
            (RecordStatus::Error, None)
        }
    }
}

/// Fetch the record of the active primary, if any.
pub async fn get_primary_node_record(conn: &DbConn) -> Option<NodeRecord> {
    let query = format!(
        "SELECT {NODE_COLUMNS} FROM repmgr.nodes n \
          WHERE n.type = 'primary' AND n.active IS TRUE"
    );

    match conn.client().query_opt(&query, &[]).await {
        Ok(row) => row.map(|r| record_from_row(&r)),
        Err(e) => {
            warn!("unable to retrieve primary node record: {}", e);
            None
        }
    }
}

/// All node records, ordered by id.
pub async fn get_all_node_records(conn: &DbConn) -> RepmgrResult<Vec<NodeRecord>> {
    let query = format!(
        "SELECT {NODE_COLUMNS} FROM repmgr.nodes n ORDER BY n.node_id"
    );

    let rows = conn
        .client()
        .query(&query, &[])
        .await
        .map_err(|e| RepmgrError::Catalog(format!("unable to retrieve node records: {}", e)))?;

    Ok(rows.iter().map(record_from_row).collect())
}

/// Count of all node records.
pub async fn get_all_nodes_count(conn: &DbConn) -> RepmgrResult<i64> {
    let row = conn
        .client()
        .query_one("SELECT COUNT(*) FROM repmgr.nodes", &[])
        .await
        .map_err(|e| RepmgrError::Catalog(format!("unable to count node records: {}", e)))?;
    Ok(row.get(0))
}

/// Records whose upstream is the given node, ordered by id.
pub async fn get_downstream_node_records(
    conn: &DbConn,
    upstream_node_id: i32,
) -> RepmgrResult<Vec<NodeRecord>> {
    let query = format!(
        "SELECT {NODE_COLUMNS} FROM repmgr.nodes n \
          WHERE n.upstream_node_id = $1 \
       ORDER BY n.node_id"
    );

    let rows = conn
        .client()
        .query(&query, &[&upstream_node_id])
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!("unable to retrieve downstream node records: {}", e))
        })?;

    Ok(rows.iter().map(record_from_row).collect())
}

/// Active records sharing an upstream with the given node, excluding it.
pub async fn get_active_sibling_node_records(
    conn: &DbConn,
    node_id: i32,
    upstream_node_id: i32,
) -> RepmgrResult<Vec<NodeRecord>> {
    let query = format!(
        "SELECT {NODE_COLUMNS} FROM repmgr.nodes n \
          WHERE n.upstream_node_id = $1 \
            AND n.node_id != $2 \
            AND n.active IS TRUE \
       ORDER BY n.node_id"
    );

    let rows = conn
        .client()
        .query(&query, &[&upstream_node_id, &node_id])
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!("unable to retrieve sibling node records: {}", e))
        })?;

    Ok(rows.iter().map(record_from_row).collect())
}

/// Shared implementation for create / update of one node record.
async fn create_update_node_record(
    conn: &DbConn,
    action: &str,
    record: &NodeRecord,
) -> RepmgrResult<()> {
    // a standby registered without an explicit upstream attaches to the
    // current primary
    let upstream_node_id: Option<i32> = match record.upstream_node_id {
        Some(id) => Some(id),
        None if record.node_type == NodeType::Standby => {
            let primary_id = get_primary_node_id(conn).await;
            if primary_id == UNKNOWN_NODE_ID {
                None
            } else {
                Some(primary_id)
            }
        }
        None => None,
    };

    let query = if action == "create" {
        "INSERT INTO repmgr.nodes \
                (node_id, type, upstream_node_id, node_name, conninfo, repluser, \
                 slot_name, location, priority, active, config_file, virtual_ip, network_card) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    } else {
        "UPDATE repmgr.nodes SET \
                type = $2, \
                upstream_node_id = $3, \
                node_name = $4, \
                conninfo = $5, \
                repluser = $6, \
                slot_name = $7, \
                location = $8, \
                priority = $9, \
                active = $10, \
                config_file = $11, \
                virtual_ip = $12, \
                network_card = $13 \
          WHERE node_id = $1"
    };

    conn.client()
        .execute(
            query,
            &[
                &record.node_id,
                &record.node_type.as_str(),
                &upstream_node_id,
                &record.node_name,
                &record.conninfo,
                &record.repluser,
                &record.slot_name,
                &record.location,
                &record.priority,
                &record.active,
                &record.config_file,
                &record.virtual_ip,
                &record.network_card,
            ],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!(
                "unable to {} node record for node \"{}\" (ID: {}): {}",
                action, record.node_name, record.node_id, e
            ))
        })?;

    Ok(())
}

pub async fn create_node_record(conn: &DbConn, record: &NodeRecord) -> RepmgrResult<()> {
    create_update_node_record(conn, "create", record).await
}

pub async fn update_node_record(conn: &DbConn, record: &NodeRecord) -> RepmgrResult<()> {
    create_update_node_record(conn, "update", record).await
}

/// Flip the `active` flag on one record.
pub async fn update_node_record_set_active(
    conn: &DbConn,
    node_id: i32,
    active: bool,
) -> RepmgrResult<()> {
    conn.client()
        .execute(
            "UPDATE repmgr.nodes SET active = $1 WHERE node_id = $2",
            &[&active, &node_id],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!(
                "unable to set node {} active={}: {}",
                node_id, active, e
            ))
        })?;
    Ok(())
}

/// Reinstate a former primary as an active standby.
pub async fn update_node_record_set_active_standby(
    conn: &DbConn,
    node_id: i32,
) -> RepmgrResult<()> {
    conn.client()
        .execute(
            "UPDATE repmgr.nodes SET type = 'standby', active = TRUE \
              WHERE node_id = $1",
            &[&node_id],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!(
                "unable to set node {} as active standby: {}",
                node_id, e
            ))
        })?;
    Ok(())
}

/// Mark one node as the active primary, demoting any other active primary
/// in the same transaction.
///
/// This is the serialisation point for the at-most-one-active-primary
/// invariant: both statements commit or neither does.
pub async fn update_node_record_set_primary(conn: &DbConn, node_id: i32) -> RepmgrResult<()> {
    debug!(
        "setting node {} as primary and marking existing primary as failed",
        node_id
    );

    if !super::begin_transaction(conn).await {
        return Err(RepmgrError::Catalog("unable to begin transaction".into()));
    }

    if let Err(e) = conn
        .client()
        .execute(
            "UPDATE repmgr.nodes SET active = FALSE \
              WHERE type = 'primary' AND active IS TRUE AND node_id != $1",
            &[&node_id],
        )
        .await
    {
        super::rollback_transaction(conn).await;
        return Err(RepmgrError::Catalog(format!(
            "unable to set old primary node as inactive: {}",
            e
        )));
    }

    if let Err(e) = conn
        .client()
        .execute(
            "UPDATE repmgr.nodes \
                SET type = 'primary', upstream_node_id = NULL, active = TRUE \
              WHERE node_id = $1",
            &[&node_id],
        )
        .await
    {
        super::rollback_transaction(conn).await;
        return Err(RepmgrError::Catalog(format!(
            "unable to set node {} as active primary: {}",
            node_id, e
        )));
    }

    if !super::commit_transaction(conn).await {
        return Err(RepmgrError::Catalog("unable to commit transaction".into()));
    }

    Ok(())
}

/// Re-point one record at a new upstream.
pub async fn update_node_record_set_upstream(
    conn: &DbConn,
    node_id: i32,
    new_upstream_node_id: i32,
) -> RepmgrResult<()> {
    debug!(
        "updating node {}'s upstream node to {}",
        node_id, new_upstream_node_id
    );

    conn.client()
        .execute(
            "UPDATE repmgr.nodes SET upstream_node_id = $1 WHERE node_id = $2",
            &[&new_upstream_node_id, &node_id],
        )
        .await
        .map_err(|e| RepmgrError::Catalog(format!("unable to set new upstream node id: {}", e)))?;
    Ok(())
}

/// Rewrite type / upstream / active in one statement, e.g. when an
/// inactive primary is converted to a standby.
pub async fn update_node_record_status(
    conn: &DbConn,
    node_id: i32,
    node_type: NodeType,
    upstream_node_id: Option<i32>,
    active: bool,
) -> RepmgrResult<()> {
    conn.client()
        .execute(
            "UPDATE repmgr.nodes \
                SET type = $1, upstream_node_id = $2, active = $3 \
              WHERE node_id = $4",
            &[&node_type.as_str(), &upstream_node_id, &active, &node_id],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!(
                "unable to update node record status for node {}: {}",
                node_id, e
            ))
        })?;
    Ok(())
}

/// Refresh conninfo and priority after a daemon configuration reload.
pub async fn update_node_record_conn_priority(
    conn: &DbConn,
    node_id: i32,
    conninfo: &str,
    priority: i32,
) -> RepmgrResult<()> {
    conn.client()
        .execute(
            "UPDATE repmgr.nodes SET conninfo = $1, priority = $2 WHERE node_id = $3",
            &[&conninfo, &priority, &node_id],
        )
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!(
                "unable to update conninfo/priority for node {}: {}",
                node_id, e
            ))
        })?;
    Ok(())
}

pub async fn delete_node_record(conn: &DbConn, node_id: i32) -> RepmgrResult<()> {
    conn.client()
        .execute("DELETE FROM repmgr.nodes WHERE node_id = $1", &[&node_id])
        .await
        .map_err(|e| {
            RepmgrError::Catalog(format!("unable to delete node record {}: {}", node_id, e))
        })?;
    Ok(())
}

/// Replace the witness's copy of the nodes table with the primary's, in a
/// single constraint-deferred transaction. Rolls back on any failure.
pub async fn witness_copy_node_records(
    primary_conn: &DbConn,
    witness_conn: &DbConn,
) -> RepmgrResult<()> {
    let records = get_all_node_records(primary_conn).await?;

    if !super::begin_transaction(witness_conn).await {
        return Err(RepmgrError::Catalog("unable to begin transaction".into()));
    }

    if let Err(e) = witness_conn
        .client()
        .batch_execute("SET CONSTRAINTS ALL DEFERRED")
        .await
    {
        super::rollback_transaction(witness_conn).await;
        return Err(RepmgrError::Catalog(format!(
            "unable to defer constraints: {}",
            e
        )));
    }

    if let Err(e) = witness_conn
        .client()
        .batch_execute("TRUNCATE TABLE repmgr.nodes")
        .await
    {
        super::rollback_transaction(witness_conn).await;
        return Err(RepmgrError::Catalog(format!(
            "unable to truncate nodes table: {}",
            e
        )));
    }

    for record in &records {
        let insert = witness_conn
            .client()
            .execute(
                "INSERT INTO repmgr.nodes \
                        (node_id, type, upstream_node_id, node_name, conninfo, repluser, \
                         slot_name, location, priority, active, config_file, virtual_ip, network_card) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &record.node_id,
                    &record.node_type.as_str(),
                    &record.upstream_node_id,
                    &record.node_name,
                    &record.conninfo,
                    &record.repluser,
                    &record.slot_name,
                    &record.location,
                    &record.priority,
                    &record.active,
                    &record.config_file,
                    &record.virtual_ip,
                    &record.network_card,
                ],
            )
            .await;

        if let Err(e) = insert {
            super::rollback_transaction(witness_conn).await;
            return Err(RepmgrError::Catalog(format!(
                "unable to copy node record {} to witness: {}",
                record.node_id, e
            )));
        }
    }

    if !super::commit_transaction(witness_conn).await {
        return Err(RepmgrError::Catalog("unable to commit witness copy".into()));
    }

    Ok(())
}

/// Virtual address configured on a node record, if any.
pub async fn get_virtual_ip(conn: &DbConn, node_id: i32) -> Option<(String, String)> {
    match conn
        .client()
        .query_opt(
            "SELECT virtual_ip, network_card FROM repmgr.nodes WHERE node_id = $1",
            &[&node_id],
        )
        .await
    {
        Ok(Some(row)) => {
            let vip: Option<String> = row.get(0);
            let card: Option<String> = row.get(1);
            match (vip, card) {
                (Some(v), Some(c)) if !v.is_empty() && !c.is_empty() => Some((v, c)),
                _ => None,
            }
        }
        Ok(None) => None,
        Err(e) => {
            warn!("unable to retrieve virtual ip for node {}: {}", node_id, e);
            None
        }
    }
}

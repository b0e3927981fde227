//! Shared-state procedures exposed by the embedded extension.
//!
//! These wrappers call the stable procedure interface over a normal
//! session. The procedures return NULL sentinels while the segment's
//! local-node-id field is unset; callers see that as `None` / sentinel
//! values rather than errors.

use tracing::{debug, warn};

use repmgr_proto::constants::{UNKNOWN_NODE_ID, UNKNOWN_PID};
use repmgr_proto::node::NodeType;

use crate::pool::DbConn;

/// Publish the local node id into shared state. Idempotent: only the
/// first call takes effect.
pub async fn set_local_node_id(conn: &DbConn, local_node_id: i32) -> bool {
    match conn
        .client()
        .batch_execute(&format!("SELECT repmgr.set_local_node_id({})", local_node_id))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to execute repmgr.set_local_node_id(): {}", e);
            false
        }
    }
}

pub async fn get_local_node_id(conn: &DbConn) -> i32 {
    match conn
        .client()
        .query_one("SELECT repmgr.get_local_node_id()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<i32>>(0).unwrap_or(UNKNOWN_NODE_ID),
        Err(e) => {
            warn!("unable to execute repmgr.get_local_node_id(): {}", e);
            UNKNOWN_NODE_ID
        }
    }
}

/// Whether the shared segment has a local node id set at all.
pub async fn check_local_node_id(conn: &DbConn) -> bool {
    match conn
        .client()
        .query_one("SELECT repmgr.get_local_node_id()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<i32>>(0).is_some(),
        Err(e) => {
            warn!("unable to execute repmgr.get_local_node_id(): {}", e);
            false
        }
    }
}

/// Register the daemon's PID (and optionally its PID file path).
pub async fn set_repmgrd_pid(conn: &DbConn, pid: i32, pidfile: Option<&str>) {
    debug!("registering repmgrd pid {}", pid);

    let result = conn
        .client()
        .execute("SELECT repmgr.set_repmgrd_pid($1, $2)", &[&pid, &pidfile])
        .await;

    if let Err(e) = result {
        warn!("unable to execute repmgr.set_repmgrd_pid(): {}", e);
    }
}

pub async fn get_repmgrd_pid(conn: &DbConn) -> i32 {
    match conn
        .client()
        .query_one("SELECT repmgr.get_repmgrd_pid()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<i32>>(0).unwrap_or(UNKNOWN_PID),
        Err(e) => {
            warn!("unable to execute repmgr.get_repmgrd_pid(): {}", e);
            UNKNOWN_PID
        }
    }
}

/// Whether a daemon registered in shared state is still alive (the
/// extension pings the stored PID with a null signal).
pub async fn repmgrd_is_running(conn: &DbConn) -> bool {
    match conn
        .client()
        .query_one("SELECT repmgr.repmgrd_is_running()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<bool>>(0).unwrap_or(false),
        Err(e) => {
            warn!("unable to execute repmgr.repmgrd_is_running(): {}", e);
            false
        }
    }
}

pub async fn repmgrd_is_paused(conn: &DbConn) -> bool {
    match conn
        .client()
        .query_one("SELECT repmgr.repmgrd_is_paused()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<bool>>(0).unwrap_or(false),
        Err(e) => {
            warn!("unable to execute repmgr.repmgrd_is_paused(): {}", e);
            false
        }
    }
}

pub async fn repmgrd_pause(conn: &DbConn, pause: bool) -> bool {
    match conn
        .client()
        .execute("SELECT repmgr.repmgrd_pause($1)", &[&pause])
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!("unable to execute repmgr.repmgrd_pause(): {}", e);
            false
        }
    }
}

/// Refresh the "upstream last seen" timestamp for the given upstream.
pub async fn set_upstream_last_seen(conn: &DbConn, upstream_node_id: i32) {
    let result = conn
        .client()
        .execute(
            "SELECT repmgr.set_upstream_last_seen($1)",
            &[&upstream_node_id],
        )
        .await;

    if let Err(e) = result {
        warn!("unable to execute repmgr.set_upstream_last_seen(): {}", e);
    }
}

/// Seconds since the upstream was last seen; -1 if never recorded.
///
/// On a primary this is meaningless, so non-witness callers gate on the
/// recovery state inside the query.
pub async fn get_upstream_last_seen(conn: &DbConn, node_type: NodeType) -> i32 {
    let query = if node_type == NodeType::Witness {
        "SELECT repmgr.get_upstream_last_seen()".to_string()
    } else {
        "SELECT CASE WHEN ux_catalog.ux_is_in_recovery() IS FALSE \
                  THEN -1 \
                  ELSE repmgr.get_upstream_last_seen() \
                END".to_string()
    };

    match conn.client().query_one(&query, &[]).await {
        Ok(row) => row.get::<_, Option<i32>>(0).unwrap_or(-1),
        Err(e) => {
            warn!("unable to execute repmgr.get_upstream_last_seen(): {}", e);
            -1
        }
    }
}

pub async fn get_upstream_node_id(conn: &DbConn) -> i32 {
    match conn
        .client()
        .query_one("SELECT repmgr.get_upstream_node_id()", &[])
        .await
    {
        Ok(row) => row.get::<_, Option<i32>>(0).unwrap_or(UNKNOWN_NODE_ID),
        Err(e) => {
            warn!("unable to execute repmgr.get_upstream_node_id(): {}", e);
            UNKNOWN_NODE_ID
        }
    }
}

pub async fn set_upstream_node_id(conn: &DbConn, node_id: i32) -> bool {
    match conn
        .client()
        .execute("SELECT repmgr.set_upstream_node_id($1)", &[&node_id])
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!("unable to execute repmgr.set_upstream_node_id(): {}", e);
            false
        }
    }
}

/// Update the standby's "last updated" timestamp in shared state.
pub async fn standby_set_last_updated(conn: &DbConn) {
    let result = conn
        .client()
        .batch_execute("SELECT repmgr.standby_set_last_updated()")
        .await;

    if let Err(e) = result {
        warn!("unable to execute repmgr.standby_set_last_updated(): {}", e);
    }
}

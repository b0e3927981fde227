//! Typed access to the repmgr metadata tables.
//!
//! Every catalog mutation in the system goes through this module. Each
//! operation maps to one SQL statement or one short transaction; untrusted
//! inputs ride as bind parameters. Single-row fetches report
//! `Found | NotFound | Error` and leave interpretation to the caller.
//!
//! Submodules:
//! - [`nodes`]: the `repmgr.nodes` table (registration, role flips,
//!   topology queries).
//! - [`events`]: the append-only `repmgr.events` log and notification
//!   command dispatch.
//! - [`monitoring`]: standby heartbeat records and their retention.
//! - [`voting`]: the electoral term table and vote RPCs.
//! - [`rpc`]: shared-state procedures exposed by the embedded extension.
//! - [`slots`]: physical replication slot verification and management.
//! - [`status`]: read-only server state (recovery type, LSNs, lag,
//!   attachment).

pub mod events;
pub mod monitoring;
pub mod nodes;
pub mod rpc;
pub mod slots;
pub mod status;
pub mod voting;

use tracing::warn;

use crate::pool::DbConn;

/// Open a transaction on the session.
pub async fn begin_transaction(conn: &DbConn) -> bool {
    match conn.client().batch_execute("BEGIN").await {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to begin transaction: {}", e);
            false
        }
    }
}

pub async fn commit_transaction(conn: &DbConn) -> bool {
    match conn.client().batch_execute("COMMIT").await {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to commit transaction: {}", e);
            false
        }
    }
}

pub async fn rollback_transaction(conn: &DbConn) -> bool {
    match conn.client().batch_execute("ROLLBACK").await {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to rollback transaction: {}", e);
            false
        }
    }
}

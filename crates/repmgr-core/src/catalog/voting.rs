//! Electoral term table and vote RPCs.
//!
//! The voting term is a single-row table bumped by the election
//! initiator; concurrent elections serialise on that row. Candidature
//! announcements and follow notifications are stored-procedure calls
//! executed on the *other* node's session, landing in that node's shared
//! state segment.

use tracing::{debug, warn};

use repmgr_proto::constants::{ELECTION_RERUN_NOTIFICATION, UNKNOWN_NODE_ID, VOTING_TERM_NOT_SET};

use crate::pool::DbConn;

/// Current electoral term, or the unset sentinel.
pub async fn get_current_term(conn: &DbConn) -> i32 {
    match conn
        .client()
        .query("SELECT term FROM repmgr.voting_term", &[])
        .await
    {
        Ok(rows) => rows
            .first()
            .map(|row| row.get(0))
            .unwrap_or(VOTING_TERM_NOT_SET),
        Err(e) => {
            warn!("unable to query repmgr.voting_term: {}", e);
            VOTING_TERM_NOT_SET
        }
    }
}

/// Reset the term to 1, inserting the row if the table is empty.
pub async fn initialize_voting_term(conn: &DbConn) -> bool {
    let query = if get_current_term(conn).await == VOTING_TERM_NOT_SET {
        "INSERT INTO repmgr.voting_term (term) VALUES (1)"
    } else {
        "UPDATE repmgr.voting_term SET term = 1"
    };

    match conn.client().batch_execute(query).await {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to initialize repmgr.voting_term: {}", e);
            false
        }
    }
}

/// Bump the term. Read-modify-write on the single row; the second of two
/// concurrent bumps observes the other's increment.
pub async fn increment_current_term(conn: &DbConn) -> bool {
    match conn
        .client()
        .batch_execute("UPDATE repmgr.voting_term SET term = term + 1")
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to increment repmgr.voting_term: {}", e);
            false
        }
    }
}

/// Announce this node's candidature to another node for the given term.
///
/// Returns `true` if the other node endorses the candidate; `false` when
/// it could not be asked or declined.
pub async fn announce_candidature(
    other_conn: &DbConn,
    candidate_node_id: i32,
    electoral_term: i32,
) -> bool {
    match other_conn
        .client()
        .query_one(
            "SELECT repmgr.other_node_is_candidate($1, $2)",
            &[&candidate_node_id, &electoral_term],
        )
        .await
    {
        Ok(row) => row.get(0),
        Err(e) => {
            warn!("unable to execute repmgr.other_node_is_candidate(): {}", e);
            false
        }
    }
}

/// Instruct a standby to follow the given node as its new primary.
///
/// Passing [`ELECTION_RERUN_NOTIFICATION`] instead requests the target to
/// rerun its own election evaluation.
pub async fn notify_follow_primary(conn: &DbConn, primary_node_id: i32) -> bool {
    debug!("notify_follow_primary({})", primary_node_id);

    match conn
        .client()
        .batch_execute(&format!(
            "SELECT repmgr.notify_follow_primary({})",
            primary_node_id
        ))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to execute repmgr.notify_follow_primary(): {}", e);
            false
        }
    }
}

/// Ask a standby to rerun its election evaluation.
pub async fn notify_election_rerun(conn: &DbConn) -> bool {
    notify_follow_primary(conn, ELECTION_RERUN_NOTIFICATION).await
}

/// Read the follow flag: the node id this standby has been told to
/// follow, if the two-phase follow write has completed.
pub async fn get_new_primary(conn: &DbConn) -> Option<i32> {
    match conn
        .client()
        .query_one("SELECT repmgr.get_new_primary()", &[])
        .await
    {
        Ok(row) => {
            let new_primary: Option<i32> = row.get(0);
            new_primary.filter(|&id| id != UNKNOWN_NODE_ID)
        }
        Err(e) => {
            warn!("unable to execute repmgr.get_new_primary(): {}", e);
            None
        }
    }
}

/// Clear voting status, candidate and follow flag in shared state.
pub async fn reset_voting_status(conn: &DbConn) -> bool {
    match conn
        .client()
        .batch_execute("SELECT repmgr.reset_voting_status()")
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!("unable to execute repmgr.reset_voting_status(): {}", e);
            false
        }
    }
}

//! Failover engine.
//!
//! Entered from the standby loop once degraded monitoring has exhausted
//! the reconnect budget. The election runs over the voting-term table and
//! the shared state of every reachable sibling: collect candidates, rank,
//! bump the term, solicit endorsements, promote, publish, re-point the
//! survivors, reset. Any step may fail; promotion failure aborts the
//! attempt and the node falls back to degraded monitoring.

use std::cmp::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use repmgr_core::catalog::{events, nodes, status, voting};
use repmgr_core::command::local_command;
use repmgr_core::pool::DbConn;
use repmgr_core::vip;
use repmgr_proto::event::{event_type, EventInfo};
use repmgr_proto::node::{NodeRecord, NodeType, RecoveryType};
use repmgr_proto::Lsn;

use crate::daemon::Daemon;

/// How an election attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node won and was promoted.
    Promoted,
    /// Another node is the better candidate; wait for its notification.
    Deferred,
    /// Promotion was attempted and failed; remain degraded.
    Failed,
    /// Automatic failover is disabled.
    Manual,
    /// No candidate was electable.
    NoCandidate,
}

/// One ranked election participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: i32,
    pub priority: i32,
    pub location: String,
    pub last_wal_receive_lsn: Lsn,
}

/// Total order over candidates:
/// `(receive_lsn DESC, priority DESC, location preference, node_id ASC)`.
///
/// Nodes in the failed primary's failure domain are preferred between
/// otherwise equal candidates; the ascending node id makes the order
/// total and the winner deterministic.
pub fn compare_candidates(a: &Candidate, b: &Candidate, primary_location: &str) -> Ordering {
    b.last_wal_receive_lsn
        .cmp(&a.last_wal_receive_lsn)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| {
            let a_local = a.location == primary_location;
            let b_local = b.location == primary_location;
            b_local.cmp(&a_local)
        })
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Rank candidates, best first. Ineligible nodes (priority 0) are
/// excluded up front.
pub fn rank_candidates(mut candidates: Vec<Candidate>, primary_location: &str) -> Vec<Candidate> {
    candidates.retain(|c| c.priority > 0);
    candidates.sort_by(|a, b| compare_candidates(a, b, primary_location));
    candidates
}

/// Run the failover protocol from this (standby) node.
///
/// `failed_upstream` is the last known record of the lost upstream;
/// `local_conn` is a session to the local, still-replaying database.
pub async fn do_election(
    daemon: &mut Daemon,
    local_conn: &DbConn,
    failed_upstream: &NodeRecord,
) -> ElectionOutcome {
    use repmgr_core::config::FailoverMode;

    if daemon.config.failover == FailoverMode::Manual {
        warn!("a failover situation was detected, but automatic failover is disabled");
        events::create_event_notification(
            Some(local_conn),
            &daemon.config,
            daemon.config.node_id,
            event_type::REPMGRD_STANDBY_DISCONNECT_MANUAL,
            true,
            &format!(
                "node {} detected upstream failure but \"failover\" is set to \"manual\"",
                daemon.config.node_id
            ),
        )
        .await;
        return ElectionOutcome::Manual;
    }

    // 1. collect: enumerate active siblings, probe each, note LSNs
    let siblings = match nodes::get_active_sibling_node_records(
        local_conn,
        daemon.local_node.node_id,
        failed_upstream.node_id,
    )
    .await
    {
        Ok(siblings) => siblings,
        Err(e) => {
            warn!("unable to retrieve sibling node records: {}", e);
            return ElectionOutcome::Failed;
        }
    };

    daemon.sibling_conns.clear();
    let mut candidates: Vec<Candidate> = Vec::new();

    let local_lsn = status::get_last_wal_receive_location(local_conn).await;
    candidates.push(Candidate {
        node_id: daemon.local_node.node_id,
        priority: daemon.local_node.priority,
        location: daemon.local_node.location.clone(),
        last_wal_receive_lsn: local_lsn,
    });

    for sibling in &siblings {
        let conn = match DbConn::establish_quiet(&sibling.conninfo).await {
            Ok(conn) => conn,
            Err(_) => {
                warn!("unable to reach sibling node {}", sibling);
                continue;
            }
        };

        // witnesses vote but never stand
        if sibling.node_type == NodeType::Standby {
            let lsn = status::get_last_wal_receive_location(&conn).await;
            candidates.push(Candidate {
                node_id: sibling.node_id,
                priority: sibling.priority,
                location: sibling.location.clone(),
                last_wal_receive_lsn: lsn,
            });
        }

        daemon.sibling_conns.insert(sibling.node_id, conn);
    }

    // 2. rank
    let ranked = rank_candidates(candidates, &failed_upstream.location);

    let Some(best) = ranked.first() else {
        warn!("no promotion candidate found among reachable nodes");
        return ElectionOutcome::NoCandidate;
    };

    if best.node_id != daemon.local_node.node_id {
        info!(
            "node {} is the better promotion candidate, deferring",
            best.node_id
        );
        return ElectionOutcome::Deferred;
    }

    // 3. increment term
    let term_before = voting::get_current_term(local_conn).await;
    if !voting::increment_current_term(local_conn).await {
        warn!("unable to increment the voting term, aborting election");
        return ElectionOutcome::Failed;
    }
    let electoral_term = voting::get_current_term(local_conn).await;

    // concurrent elections serialise on the term row: an unexpectedly
    // high term means another initiator got there first
    if electoral_term != term_before + 1 {
        warn!(
            "voting term moved from {} to {} unexpectedly, deferring",
            term_before, electoral_term
        );
        return ElectionOutcome::Deferred;
    }

    info!(
        "this node is the best candidate, announcing candidature for term {}",
        electoral_term
    );

    // 4. collect votes from every reachable sibling (witnesses included)
    let mut all_endorsed = true;
    for entry in daemon.sibling_conns.iter() {
        let endorsed =
            voting::announce_candidature(entry.value(), daemon.local_node.node_id, electoral_term)
                .await;
        if endorsed {
            debug!("node {} endorsed our candidature", entry.key());
        } else {
            warn!("node {} did not endorse our candidature", entry.key());
            all_endorsed = false;
        }
    }

    if !all_endorsed {
        info!(
            "candidature not unanimously endorsed, rerunning election in {} seconds",
            daemon.config.election_rerun_interval
        );
        voting::reset_voting_status(local_conn).await;
        daemon.shared.reset_voting_status();
        tokio::time::sleep(Duration::from_secs(
            daemon.config.election_rerun_interval as u64,
        ))
        .await;
        return ElectionOutcome::Deferred;
    }

    // 5. promote
    if !execute_promote(daemon, local_conn).await {
        events::create_event_notification(
            Some(local_conn),
            &daemon.config,
            daemon.config.node_id,
            event_type::REPMGRD_FAILOVER_ABORT,
            false,
            "promotion did not complete within the configured timeout",
        )
        .await;
        voting::reset_voting_status(local_conn).await;
        daemon.shared.reset_voting_status();
        return ElectionOutcome::Failed;
    }

    // 6. publish the new topology
    if let Err(e) =
        nodes::update_node_record_set_primary(local_conn, daemon.local_node.node_id).await
    {
        warn!("promotion succeeded but the catalog update failed: {}", e);
    }

    let event_info = EventInfo {
        node_name: Some(daemon.local_node.node_name.clone()),
        conninfo: Some(daemon.local_node.conninfo.clone()),
        peer_node_id: Some(failed_upstream.node_id),
    };
    events::create_event_notification_extended(
        Some(local_conn),
        &daemon.config,
        daemon.config.node_id,
        event_type::REPMGRD_FAILOVER_PROMOTE,
        true,
        &format!(
            "node {} promoted to primary; old primary {} marked as failed",
            daemon.local_node.node_id, failed_upstream.node_id
        ),
        &event_info,
    )
    .await;

    // only safe after the catalog update above
    if let (Some(virtual_ip), Some(network_card)) = (
        daemon.local_node.virtual_ip.clone(),
        daemon.local_node.network_card.clone(),
    ) {
        vip::bind_virtual_ip(&daemon.config, &virtual_ip, &network_card).await;
    }

    // the new timeline must reach the control file before any standby
    // cross-checks it
    if let Err(e) = status::checkpoint(local_conn).await {
        warn!("unable to execute post-promotion checkpoint: {}", e);
    }

    // 7. re-point the surviving siblings; failures here are not fatal to
    // the new primary, the standby will observe the topology on its next
    // reconnect attempt
    for entry in daemon.sibling_conns.iter() {
        if !voting::notify_follow_primary(entry.value(), daemon.local_node.node_id).await {
            warn!(
                "unable to notify node {} to follow this node",
                entry.key()
            );
        }
    }

    // 8. reset voting state
    voting::reset_voting_status(local_conn).await;
    daemon.shared.reset_voting_status();
    daemon.sibling_conns.clear();

    ElectionOutcome::Promoted
}

/// Execute the promotion itself and wait for recovery to end.
async fn execute_promote(daemon: &Daemon, local_conn: &DbConn) -> bool {
    if let Some(promote_command) = daemon.config.promote_command.as_deref() {
        info!("executing promote_command \"{}\"", promote_command);
        match local_command(promote_command).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                warn!(
                    "promote_command failed with exit code {:?}",
                    output.exit_code
                );
                return false;
            }
            Err(e) => {
                warn!("unable to execute promote_command: {}", e);
                return false;
            }
        }
    } else {
        match status::promote_standby(local_conn, false, 0).await {
            Ok(_) => {}
            Err(e) => {
                warn!("engine promotion call failed: {}", e);
                return false;
            }
        }
    }

    // wait for in_recovery to flip
    let deadline = daemon.config.promote_check_timeout.max(1);
    let interval = daemon.config.promote_check_interval.max(1);
    let mut waited = 0;

    while waited < deadline {
        if status::get_recovery_type(local_conn).await == RecoveryType::Primary {
            info!("promotion complete after {} seconds", waited);
            return true;
        }
        tokio::time::sleep(Duration::from_secs(interval as u64)).await;
        waited += interval;
    }

    warn!(
        "node did not leave recovery within {} seconds",
        deadline
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(node_id: i32, priority: i32, location: &str, lsn: u64) -> Candidate {
        Candidate {
            node_id,
            priority,
            location: location.to_string(),
            last_wal_receive_lsn: Lsn(lsn),
        }
    }

    #[test]
    fn test_highest_lsn_wins() {
        let ranked = rank_candidates(
            vec![
                candidate(2, 100, "default", 0x2000),
                candidate(3, 100, "default", 0x3000),
            ],
            "default",
        );
        assert_eq!(ranked[0].node_id, 3);
    }

    #[test]
    fn test_priority_breaks_lsn_ties() {
        let ranked = rank_candidates(
            vec![
                candidate(2, 50, "default", 0x3000),
                candidate(3, 150, "default", 0x3000),
            ],
            "default",
        );
        assert_eq!(ranked[0].node_id, 3);
    }

    #[test]
    fn test_location_preference() {
        // equal LSN and priority: the candidate in the failed primary's
        // failure domain is preferred
        let ranked = rank_candidates(
            vec![
                candidate(2, 100, "dc2", 0x3000),
                candidate(3, 100, "dc1", 0x3000),
            ],
            "dc1",
        );
        assert_eq!(ranked[0].node_id, 3);
    }

    #[test]
    fn test_node_id_is_the_final_tiebreak() {
        // S2: equal receive LSN, equal priority, same location
        let ranked = rank_candidates(
            vec![
                candidate(3, 100, "default", 0x3000),
                candidate(2, 100, "default", 0x3000),
            ],
            "default",
        );
        assert_eq!(ranked[0].node_id, 2);
    }

    #[test]
    fn test_order_is_stable_under_swap() {
        let a = candidate(2, 100, "default", 0x3000);
        let b = candidate(3, 100, "default", 0x3000);

        let first = rank_candidates(vec![a.clone(), b.clone()], "default");
        let second = rank_candidates(vec![b, a], "default");
        assert_eq!(first, second);
    }

    #[test]
    fn test_priority_zero_is_ineligible() {
        let ranked = rank_candidates(
            vec![
                candidate(2, 0, "default", 0x9000),
                candidate(3, 100, "default", 0x1000),
            ],
            "default",
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node_id, 3);
    }

    #[test]
    fn test_comparison_is_a_total_order() {
        let candidates = vec![
            candidate(1, 100, "dc1", 0x3000),
            candidate(2, 100, "dc2", 0x3000),
            candidate(3, 50, "dc1", 0x3000),
            candidate(4, 100, "dc1", 0x2000),
            candidate(5, 100, "dc1", 0x3000),
        ];

        // antisymmetry and totality over all pairs
        for a in &candidates {
            for b in &candidates {
                let ab = compare_candidates(a, b, "dc1");
                let ba = compare_candidates(b, a, "dc1");
                assert_eq!(ab, ba.reverse());
                if a.node_id == b.node_id {
                    assert_eq!(ab, Ordering::Equal);
                } else {
                    assert_ne!(ab, Ordering::Equal);
                }
            }
        }
    }
}

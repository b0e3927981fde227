//! Cluster shared state.
//!
//! Inside the engine this lives in a preload-allocated shared segment
//! manipulated through the extension's stored procedures; the Rust
//! rendition is one owned record behind a single reader-writer lock,
//! shared between the daemon's loop and the failover state machine.
//!
//! Rules carried over from the segment:
//! - every field starts as a sentinel;
//! - accessors return `None` while the local node id is unset, so callers
//!   never act on uninitialised state;
//! - `(candidate_node_id, follow_new_primary)` are written and read
//!   together under one lock acquisition (the follow transition is
//!   two-phase);
//! - `set_local_node_id` is idempotent and rehydrates the pause flag from
//!   the state file when the stored id matches.

use std::path::Path;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use repmgr_proto::constants::{UNKNOWN_NODE_ID, UNKNOWN_PID, VOTING_TERM_NOT_SET};

/// Voting status of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotingStatus {
    NoVote,
    Voted,
}

/// The per-node shared record.
#[derive(Debug)]
struct NodeState {
    local_node_id: i32,
    repmgrd_pid: i32,
    repmgrd_pidfile: Option<String>,
    paused: bool,
    upstream_last_seen: Option<Instant>,
    upstream_node_id: i32,
    voting_status: VotingStatus,
    current_electoral_term: i32,
    candidate_node_id: i32,
    follow_new_primary: bool,
}

impl NodeState {
    fn new() -> Self {
        Self {
            local_node_id: UNKNOWN_NODE_ID,
            repmgrd_pid: UNKNOWN_PID,
            repmgrd_pidfile: None,
            paused: false,
            upstream_last_seen: None,
            upstream_node_id: UNKNOWN_NODE_ID,
            voting_status: VotingStatus::NoVote,
            current_electoral_term: VOTING_TERM_NOT_SET,
            candidate_node_id: UNKNOWN_NODE_ID,
            follow_new_primary: false,
        }
    }
}

/// Result of reading the two-phase follow flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowState {
    pub candidate_node_id: i32,
    pub follow_new_primary: bool,
}

/// Shared state segment. One per daemon process.
pub struct SharedState {
    state: RwLock<NodeState>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(NodeState::new()),
        }
    }

    /// Set the local node id. Only the first call takes effect; the pause
    /// flag is rehydrated from the state file when its stored id matches.
    pub async fn set_local_node_id(&self, node_id: i32, state_file: Option<&Path>) -> bool {
        // read the state file outside the lock
        let recovered = match state_file {
            Some(path) => crate::datadir::read_daemon_state_file(path).await.ok(),
            None => None,
        };

        let mut state = self.state.write();

        if state.local_node_id != UNKNOWN_NODE_ID {
            debug!(
                "local node id already set to {}, ignoring {}",
                state.local_node_id, node_id
            );
            return false;
        }

        state.local_node_id = node_id;

        if let Some(recovered) = recovered {
            if recovered.node_id == node_id {
                state.paused = recovered.paused;
                debug!("recovered pause flag: {}", recovered.paused);
            }
        }

        true
    }

    pub fn local_node_id(&self) -> Option<i32> {
        let state = self.state.read();
        (state.local_node_id != UNKNOWN_NODE_ID).then_some(state.local_node_id)
    }

    fn initialised(&self, state: &NodeState) -> bool {
        state.local_node_id != UNKNOWN_NODE_ID
    }

    pub fn set_repmgrd_pid(&self, pid: i32, pidfile: Option<&str>) {
        let mut state = self.state.write();
        state.repmgrd_pid = pid;
        state.repmgrd_pidfile = pidfile.map(|s| s.to_string());
    }

    pub fn repmgrd_pid(&self) -> Option<i32> {
        let state = self.state.read();
        self.initialised(&state).then_some(state.repmgrd_pid)
    }

    pub fn repmgrd_pidfile(&self) -> Option<String> {
        let state = self.state.read();
        state.repmgrd_pidfile.clone()
    }

    /// Whether the registered daemon is alive, checked with a null signal.
    pub fn repmgrd_is_running(&self) -> bool {
        let pid = {
            let state = self.state.read();
            state.repmgrd_pid
        };

        if pid == UNKNOWN_PID {
            return false;
        }

        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.write().paused = paused;
    }

    pub fn is_paused(&self) -> Option<bool> {
        let state = self.state.read();
        self.initialised(&state).then_some(state.paused)
    }

    /// Record that the given upstream was just seen.
    pub fn set_upstream_last_seen(&self, upstream_node_id: i32) {
        let mut state = self.state.write();
        state.upstream_last_seen = Some(Instant::now());
        state.upstream_node_id = upstream_node_id;
    }

    /// Seconds since the upstream was last seen; -1 when never recorded.
    pub fn upstream_last_seen(&self) -> i32 {
        let state = self.state.read();
        if !self.initialised(&state) {
            return -1;
        }
        match state.upstream_last_seen {
            Some(instant) => instant.elapsed().as_secs() as i32,
            None => -1,
        }
    }

    pub fn upstream_node_id(&self) -> Option<i32> {
        let state = self.state.read();
        (self.initialised(&state) && state.upstream_node_id != UNKNOWN_NODE_ID)
            .then_some(state.upstream_node_id)
    }

    pub fn set_upstream_node_id(&self, node_id: i32) {
        self.state.write().upstream_node_id = node_id;
    }

    pub fn current_electoral_term(&self) -> i32 {
        self.state.read().current_electoral_term
    }

    /// Record a vote for a candidate in the given term.
    ///
    /// Updates the local term when the announced term is greater. Returns
    /// false when this node has already voted in the term.
    pub fn record_vote(&self, candidate_node_id: i32, electoral_term: i32) -> bool {
        let mut state = self.state.write();

        if electoral_term > state.current_electoral_term {
            state.current_electoral_term = electoral_term;
            state.voting_status = VotingStatus::NoVote;
        } else if state.voting_status == VotingStatus::Voted {
            return false;
        }

        state.voting_status = VotingStatus::Voted;
        state.candidate_node_id = candidate_node_id;
        true
    }

    pub fn voting_status(&self) -> VotingStatus {
        self.state.read().voting_status
    }

    /// Phase-two follow write: candidate and flag set under one exclusive
    /// acquisition.
    pub fn notify_follow_primary(&self, primary_node_id: i32) {
        let mut state = self.state.write();
        state.candidate_node_id = primary_node_id;
        state.follow_new_primary = true;
    }

    /// Read candidate and follow flag under one shared acquisition.
    pub fn follow_state(&self) -> Option<FollowState> {
        let state = self.state.read();
        self.initialised(&state).then_some(FollowState {
            candidate_node_id: state.candidate_node_id,
            follow_new_primary: state.follow_new_primary,
        })
    }

    /// Clear voting status, candidate and follow flag together.
    pub fn reset_voting_status(&self) {
        let mut state = self.state.write();
        state.voting_status = VotingStatus::NoVote;
        state.candidate_node_id = UNKNOWN_NODE_ID;
        state.follow_new_primary = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datadir::DaemonStateFile;

    #[tokio::test]
    async fn test_accessors_return_none_until_initialised() {
        let shared = SharedState::new();
        assert_eq!(shared.local_node_id(), None);
        assert_eq!(shared.is_paused(), None);
        assert_eq!(shared.repmgrd_pid(), None);
        assert_eq!(shared.follow_state(), None);
        assert_eq!(shared.upstream_last_seen(), -1);

        shared.set_local_node_id(3, None).await;
        assert_eq!(shared.local_node_id(), Some(3));
        assert_eq!(shared.is_paused(), Some(false));
        assert!(shared.follow_state().is_some());
    }

    #[tokio::test]
    async fn test_set_local_node_id_is_idempotent() {
        let shared = SharedState::new();
        assert!(shared.set_local_node_id(3, None).await);
        assert!(!shared.set_local_node_id(4, None).await);
        assert_eq!(shared.local_node_id(), Some(3));
    }

    #[tokio::test]
    async fn test_pause_flag_rehydration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repmgrd.state");
        crate::datadir::write_daemon_state_file(
            &path,
            DaemonStateFile {
                node_id: 5,
                paused: true,
            },
        )
        .await
        .unwrap();

        let shared = SharedState::new();
        shared.set_local_node_id(5, Some(&path)).await;
        assert_eq!(shared.is_paused(), Some(true));

        // mismatched id leaves the pause flag unchanged
        let other = SharedState::new();
        other.set_local_node_id(6, Some(&path)).await;
        assert_eq!(other.is_paused(), Some(false));
    }

    #[tokio::test]
    async fn test_two_phase_follow() {
        let shared = SharedState::new();
        shared.set_local_node_id(2, None).await;

        let follow = shared.follow_state().unwrap();
        assert!(!follow.follow_new_primary);
        assert_eq!(follow.candidate_node_id, UNKNOWN_NODE_ID);

        shared.notify_follow_primary(7);
        let follow = shared.follow_state().unwrap();
        assert!(follow.follow_new_primary);
        assert_eq!(follow.candidate_node_id, 7);

        shared.reset_voting_status();
        let follow = shared.follow_state().unwrap();
        assert!(!follow.follow_new_primary);
        assert_eq!(follow.candidate_node_id, UNKNOWN_NODE_ID);
    }

    #[tokio::test]
    async fn test_vote_recording_tracks_terms() {
        let shared = SharedState::new();
        shared.set_local_node_id(2, None).await;

        // first vote in a new term is accepted
        assert!(shared.record_vote(3, 1));
        assert_eq!(shared.current_electoral_term(), 1);

        // second vote in the same term is rejected
        assert!(!shared.record_vote(4, 1));

        // a higher term resets voting status
        assert!(shared.record_vote(4, 2));
        assert_eq!(shared.current_electoral_term(), 2);
    }

    #[tokio::test]
    async fn test_upstream_last_seen() {
        let shared = SharedState::new();
        shared.set_local_node_id(2, None).await;
        assert_eq!(shared.upstream_last_seen(), -1);

        shared.set_upstream_last_seen(1);
        assert!(shared.upstream_last_seen() >= 0);
        assert_eq!(shared.upstream_node_id(), Some(1));
    }
}

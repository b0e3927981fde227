/// Node and cluster state types.
///
/// `NodeRecord` mirrors one row of the `repmgr.nodes` catalog table; the
/// remaining enums describe states observed at runtime (recovery type,
/// monitoring state, attachment, slot status) and are never persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::defaults::{DEFAULT_LOCATION, DEFAULT_PRIORITY};
use crate::lsn::Lsn;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Primary,
    Standby,
    Witness,
    Unknown,
}

impl NodeType {
    /// Whether this node type carries streaming replication responsibility.
    pub fn is_streaming_replication(self) -> bool {
        matches!(self, NodeType::Primary | NodeType::Standby)
    }

    /// The catalog's textual representation of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Primary => "primary",
            NodeType::Standby => "standby",
            NodeType::Witness => "witness",
            NodeType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(NodeType::Primary),
            "standby" => Ok(NodeType::Standby),
            "witness" => Ok(NodeType::Witness),
            _ => Err(format!("unknown node type \"{}\"", s)),
        }
    }
}

/// Outcome of a single-row catalog fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Found,
    NotFound,
    Error,
}

/// Recovery state of a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryType {
    /// Not in recovery (read-write).
    Primary,
    /// In recovery, replaying WAL.
    Standby,
    /// Could not be determined.
    Unknown,
}

/// Monitoring mode of the daemon's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringState {
    Normal,
    Degraded,
}

impl fmt::Display for MonitoringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoringState::Normal => f.write_str("normal"),
            MonitoringState::Degraded => f.write_str("degraded"),
        }
    }
}

/// Running state of a server, as determined by ping plus control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAvailability {
    Unknown,
    Up,
    ShuttingDown,
    Down,
    UncleanShutdown,
    /// Server responded but rejected the connection attempt.
    Rejected,
}

impl NodeAvailability {
    /// Machine-parseable token used by `node status --is-shutdown-cleanly`.
    pub fn state_token(self) -> &'static str {
        match self {
            NodeAvailability::Up | NodeAvailability::Rejected => "RUNNING",
            NodeAvailability::ShuttingDown => "SHUTTING_DOWN",
            NodeAvailability::Down => "SHUTDOWN",
            NodeAvailability::UncleanShutdown => "UNCLEAN_SHUTDOWN",
            NodeAvailability::Unknown => "UNKNOWN",
        }
    }
}

/// Health of an open connection after a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    Bad,
    /// The session returned an error; the connection must be discarded.
    Error,
    Unknown,
}

/// Whether a downstream node is attached to its upstream's replication view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAttached {
    /// Present in the replication view with state "streaming".
    Attached,
    /// Present in the replication view but not streaming.
    NotAttached,
    /// No entry in the replication view.
    Detached,
    /// The replication view could not be queried.
    Unknown,
}

/// Status of a named physical replication slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    NotFound,
    NotPhysical,
    /// Exists, physical and inactive: may be reused as-is.
    Inactive,
    Active,
    Unknown,
}

/// One row of `ux_replication_slots`, as much as repmgr needs of it.
#[derive(Debug, Clone, Default)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub slot_type: String,
    pub active: bool,
}

/// One row of the `repmgr.nodes` catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: i32,
    pub node_type: NodeType,
    /// Upstream node id; `None` for primaries, required for standbys.
    pub upstream_node_id: Option<i32>,
    pub node_name: String,
    pub conninfo: String,
    pub repluser: String,
    /// Physical slot name; when set, equals `repmgr_slot_<node_id>`.
    pub slot_name: Option<String>,
    /// Failure-domain label used in election tie-breaking.
    pub location: String,
    /// Promotion priority; 0 disables candidacy.
    pub priority: i32,
    pub active: bool,
    pub config_file: String,
    /// When both are set on a primary record, the arbitrator binds the
    /// address on that interface after promotion.
    pub virtual_ip: Option<String>,
    pub network_card: Option<String>,
}

impl NodeRecord {
    pub fn new(node_id: i32, node_type: NodeType, node_name: &str, conninfo: &str) -> Self {
        Self {
            node_id,
            node_type,
            upstream_node_id: None,
            node_name: node_name.to_string(),
            conninfo: conninfo.to_string(),
            repluser: String::new(),
            slot_name: None,
            location: DEFAULT_LOCATION.to_string(),
            priority: DEFAULT_PRIORITY,
            active: true,
            config_file: String::new(),
            virtual_ip: None,
            network_card: None,
        }
    }

    /// Whether this node may stand in an election.
    pub fn is_promotion_candidate(&self) -> bool {
        self.node_type == NodeType::Standby && self.priority > 0 && self.active
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" (ID: {}, type: {})",
            self.node_name, self.node_id, self.node_type
        )
    }
}

/// Point-in-time replication status of a monitored server.
///
/// Refreshed every monitoring tick; never persisted.
#[derive(Debug, Clone)]
pub struct ReplInfo {
    pub current_timestamp: String,
    pub in_recovery: bool,
    pub timeline_id: u32,
    pub last_wal_receive_lsn: Lsn,
    pub last_wal_replay_lsn: Lsn,
    pub last_xact_replay_timestamp: String,
    pub replication_lag_time: i32,
    pub receiving_streamed_wal: bool,
    pub wal_replay_paused: bool,
    /// Seconds since the upstream was last seen, -1 if never.
    pub upstream_last_seen: i32,
    pub upstream_node_id: i32,
}

impl Default for ReplInfo {
    fn default() -> Self {
        Self {
            current_timestamp: String::new(),
            in_recovery: false,
            timeline_id: UNKNOWN_TIMELINE_ID,
            last_wal_receive_lsn: Lsn::INVALID,
            last_wal_replay_lsn: Lsn::INVALID,
            last_xact_replay_timestamp: String::new(),
            replication_lag_time: 0,
            receiving_streamed_wal: true,
            wal_replay_paused: false,
            upstream_last_seen: -1,
            upstream_node_id: UNKNOWN_NODE_ID,
        }
    }
}

/// Replication statistics collected for `node check` / `cluster show`.
#[derive(Debug, Clone)]
pub struct NodeReplicationStats {
    pub max_wal_senders: i32,
    pub attached_wal_receivers: i32,
    pub max_replication_slots: i32,
    pub total_replication_slots: i32,
    pub active_replication_slots: i32,
    pub inactive_replication_slots: i32,
}

impl Default for NodeReplicationStats {
    fn default() -> Self {
        Self {
            max_wal_senders: -1,
            attached_wal_receivers: -1,
            max_replication_slots: -1,
            total_replication_slots: -1,
            active_replication_slots: -1,
            inactive_replication_slots: -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_roundtrip() {
        for t in [NodeType::Primary, NodeType::Standby, NodeType::Witness] {
            assert_eq!(t.as_str().parse::<NodeType>().unwrap(), t);
        }
        assert!("coordinator".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_promotion_candidate() {
        let mut rec = NodeRecord::new(2, NodeType::Standby, "node2", "host=n2");
        assert!(rec.is_promotion_candidate());

        rec.priority = 0;
        assert!(!rec.is_promotion_candidate());

        rec.priority = 100;
        rec.active = false;
        assert!(!rec.is_promotion_candidate());

        let witness = NodeRecord::new(4, NodeType::Witness, "witness", "host=w");
        assert!(!witness.is_promotion_candidate());
    }

    #[test]
    fn test_state_tokens() {
        assert_eq!(NodeAvailability::Up.state_token(), "RUNNING");
        assert_eq!(NodeAvailability::Down.state_token(), "SHUTDOWN");
        assert_eq!(
            NodeAvailability::UncleanShutdown.state_token(),
            "UNCLEAN_SHUTDOWN"
        );
    }
}

/// Event log types.
///
/// Events are append-only rows in `repmgr.events`; they are never updated
/// and double as the audit trail consumed by notification commands.

use serde::{Deserialize, Serialize};

/// One row of the `repmgr.events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub node_id: i32,
    /// Node name at query time; empty if the node record was removed.
    pub node_name: String,
    pub event: String,
    pub successful: bool,
    pub event_timestamp: String,
    pub details: String,
}

/// Context passed to the event-notification command expander.
#[derive(Debug, Clone, Default)]
pub struct EventInfo {
    /// Substituted for `%a`.
    pub node_name: Option<String>,
    /// Substituted for `%c` (conninfo of the next available node).
    pub conninfo: Option<String>,
    /// Substituted for `%p` (e.g. former primary id during switchover).
    pub peer_node_id: Option<i32>,
}

/// Event types recorded by the daemon and control tool.
pub mod event_type {
    pub const CLUSTER_CREATED: &str = "cluster_created";
    pub const PRIMARY_REGISTER: &str = "primary_register";
    pub const PRIMARY_UNREGISTER: &str = "primary_unregister";
    pub const STANDBY_REGISTER: &str = "standby_register";
    pub const STANDBY_UNREGISTER: &str = "standby_unregister";
    pub const STANDBY_PROMOTE: &str = "standby_promote";
    pub const STANDBY_FOLLOW: &str = "standby_follow";
    pub const STANDBY_FOLLOW_PENDING: &str = "standby_follow_pending";
    pub const STANDBY_SWITCHOVER: &str = "standby_switchover";
    pub const WITNESS_REGISTER: &str = "witness_register";
    pub const WITNESS_UNREGISTER: &str = "witness_unregister";
    pub const NODE_REJOIN: &str = "node_rejoin";
    pub const REPMGRD_START: &str = "repmgrd_start";
    pub const REPMGRD_SHUTDOWN: &str = "repmgrd_shutdown";
    pub const REPMGRD_RELOAD: &str = "repmgrd_reload";
    pub const REPMGRD_FAILOVER_PROMOTE: &str = "repmgrd_failover_promote";
    pub const REPMGRD_FAILOVER_FOLLOW: &str = "repmgrd_failover_follow";
    pub const REPMGRD_FAILOVER_ABORT: &str = "repmgrd_failover_abort";
    pub const REPMGRD_STANDBY_DISCONNECT_MANUAL: &str = "repmgrd_standby_disconnect_manual";
    pub const REPMGRD_SLOT_MISSING: &str = "repmgrd_slot_missing";
    pub const REPMGRD_SLOT_RECREATED: &str = "repmgrd_slot_recreated";
    pub const REPMGRD_UPSTREAM_DISCONNECT: &str = "repmgrd_upstream_disconnect";
    pub const REPMGRD_UPSTREAM_RECONNECT: &str = "repmgrd_upstream_reconnect";
}

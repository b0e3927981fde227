/// Default values for configuration file settings.
///
/// These match the behaviour of a freshly installed node with a minimal
/// configuration file containing only `node_id`, `node_name`, `conninfo`
/// and `data_directory`.

/// Seconds between monitoring ticks.
pub const DEFAULT_MONITOR_INTERVAL_SECS: i32 = 2;

/// Number of reconnection attempts before declaring the upstream failed.
pub const DEFAULT_RECONNECT_ATTEMPTS: i32 = 6;

/// Seconds between reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL: i32 = 10;

/// Seconds of degraded monitoring before giving up entirely (-1 = forever).
pub const DEFAULT_DEGRADED_MONITORING_TIMEOUT: i32 = -1;

/// Seconds to wait for an asynchronous query to return.
pub const DEFAULT_ASYNC_QUERY_TIMEOUT: i32 = 60;

/// Default promotion candidate priority (0 disables candidacy).
pub const DEFAULT_PRIORITY: i32 = 100;

/// Default failure-domain location label.
pub const DEFAULT_LOCATION: &str = "default";

/// Archive-ready file count thresholds.
pub const DEFAULT_ARCHIVE_READY_WARNING: i32 = 16;
pub const DEFAULT_ARCHIVE_READY_CRITICAL: i32 = 128;

/// Replication lag thresholds (seconds).
pub const DEFAULT_REPLICATION_LAG_WARNING: i32 = 300;
pub const DEFAULT_REPLICATION_LAG_CRITICAL: i32 = 600;

/// Seconds between witness copies of the nodes table.
pub const DEFAULT_WITNESS_SYNC_INTERVAL: i32 = 15;

/// Seconds to wait for a rejoined node to reappear in the replication view.
pub const DEFAULT_NODE_REJOIN_TIMEOUT: i32 = 60;

/// Promotion completion check budget.
pub const DEFAULT_PROMOTE_CHECK_TIMEOUT: i32 = 60;
pub const DEFAULT_PROMOTE_CHECK_INTERVAL: i32 = 1;

/// Seconds between election reruns requested via the rerun sentinel.
pub const DEFAULT_ELECTION_RERUN_INTERVAL: i32 = 15;

/// Seconds a standby waits for the new primary to appear after failover.
pub const DEFAULT_PRIMARY_NOTIFICATION_TIMEOUT: i32 = 60;

/// Default `connect_timeout` injected into conninfo strings (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: &str = "2";

/// Default number of event rows shown by `cluster event`.
pub const DEFAULT_CLUSTER_EVENT_LIMIT: i32 = 20;

/// Default shutdown check budget during switchover (seconds).
pub const DEFAULT_SHUTDOWN_CHECK_TIMEOUT: i32 = 60;

/// Default follow budget (seconds).
pub const DEFAULT_STANDBY_FOLLOW_TIMEOUT: i32 = 60;

/// Protocol-level constants shared by all repmgr components.

/// Schema holding the repmgr metadata tables inside the monitored database.
pub const REPMGR_SCHEMA: &str = "repmgr";

/// Application name reported by every connection this system opens.
pub const REPMGR_APPLICATION_NAME: &str = "repmgr";

/// Prefix for deterministically derived physical replication slot names.
pub const SLOT_NAME_PREFIX: &str = "repmgr_slot_";

/// Sentinel node id meaning "no node" / "not known".
pub const UNKNOWN_NODE_ID: i32 = -1;

/// Sentinel for a standby record with no explicit upstream.
pub const NO_UPSTREAM_NODE: i32 = -1;

/// Sentinel PID meaning "no daemon registered".
pub const UNKNOWN_PID: i32 = -1;

/// Sentinel for the voting term before the term table has been initialised.
pub const VOTING_TERM_NOT_SET: i32 = -1;

/// Value returned by a vote solicitation when the recipient believes it has
/// a strictly better candidate and the election should be rerun.
pub const ELECTION_RERUN_NOTIFICATION: i32 = -2;

/// Sentinel timeline id.
pub const UNKNOWN_TIMELINE_ID: u32 = 0;

/// Sentinel for "replication lag unknown" (seconds).
pub const UNKNOWN_REPLICATION_LAG: i32 = -1;

/// Sentinel returned by the archive-status walker when the directory
/// cannot be opened.
pub const ARCHIVE_STATUS_DIR_ERROR: i32 = -1;

/// Files the engine always keeps at the top level of a valid data directory.
pub const UX_DATADIR_REQUIRED_FILES: &[&str] = &["UX_VERSION", "base", "global"];

/// Name of the engine's standby marker file.
pub const STANDBY_SIGNAL_FILE: &str = "standby.signal";

/// Name of the recovery-completed marker the resync tool may copy in.
pub const RECOVERY_DONE_FILE: &str = "recovery.done";

/// Control file path relative to the data directory.
pub const CONTROL_FILE_PATH: &str = "global/ux_control";

/// Engine version file relative to the data directory.
pub const UX_VERSION_FILE: &str = "UX_VERSION";

/// Archive status directory relative to the data directory.
pub const ARCHIVE_STATUS_DIR: &str = "ux_wal/archive_status";

/// Suffix marking a WAL segment as ready to be archived.
pub const ARCHIVE_READY_SUFFIX: &str = ".ready";

//! Shared helpers for the repmgr CLI.
//!
//! Connection wrappers that exit with the right code on failure, output
//! mode handling for `node check`, and small formatting utilities used
//! across the subcommands.

use repmgr_core::catalog::nodes;
use repmgr_core::config::Config;
use repmgr_core::pool::{self, DbConn};
use repmgr_proto::node::NodeRecord;
use repmgr_proto::{ExitCode, Lsn};

/// Output formats for `node check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Csv,
    Nagios,
    Optformat,
}

/// Result classification for one check, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Critical => "CRITICAL",
            CheckStatus::Unknown => "UNKNOWN",
        }
    }

    /// Conventional monitoring-plugin exit code.
    pub fn nagios_code(self) -> i32 {
        match self {
            CheckStatus::Ok => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
            CheckStatus::Unknown => 3,
        }
    }
}

/// One named check outcome, collected for text/CSV output.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub details: String,
}

/// Connect to the local node or exit with `DbConn`.
pub async fn establish_local_connection(config: &Config) -> DbConn {
    match DbConn::establish(&config.conninfo).await {
        Ok(conn) => conn,
        Err(e) => exit_error(&format!("unable to connect to local node: {}", e), ExitCode::DbConn),
    }
}

/// Connect to the cluster primary starting from any member session, or
/// exit with `DbConn`.
pub async fn establish_primary_connection(conn: &DbConn) -> (DbConn, i32) {
    match pool::get_primary_connection(conn).await {
        Ok(result) => result,
        Err(e) => exit_error(
            &format!("unable to connect to the cluster primary: {}", e),
            ExitCode::DbConn,
        ),
    }
}

/// Fetch this node's record from the given session or exit.
pub async fn local_node_record(conn: &DbConn, config: &Config) -> NodeRecord {
    use repmgr_proto::node::RecordStatus;

    match nodes::get_node_record(conn, config.node_id).await {
        (RecordStatus::Found, Some(record)) => record,
        (RecordStatus::NotFound, _) => exit_error(
            &format!(
                "no metadata record found for node {}, is it registered?",
                config.node_id
            ),
            ExitCode::BadConfig,
        ),
        _ => exit_error("unable to retrieve the local node record", ExitCode::DbConn),
    }
}

/// Print an error and terminate with the given exit code.
pub fn exit_error(msg: &str, code: ExitCode) -> ! {
    eprintln!("ERROR: {}", msg);
    code.exit()
}

/// Format an LSN for display, showing a dash for the invalid sentinel.
pub fn format_lsn(lsn: Lsn) -> String {
    if lsn.is_valid() {
        lsn.to_string()
    } else {
        "-".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_strings_and_codes() {
        assert_eq!(CheckStatus::Ok.as_str(), "OK");
        assert_eq!(CheckStatus::Critical.as_str(), "CRITICAL");
        assert_eq!(CheckStatus::Ok.nagios_code(), 0);
        assert_eq!(CheckStatus::Warning.nagios_code(), 1);
        assert_eq!(CheckStatus::Critical.nagios_code(), 2);
        assert_eq!(CheckStatus::Unknown.nagios_code(), 3);
    }

    #[test]
    fn test_check_status_severity_order() {
        assert!(CheckStatus::Critical > CheckStatus::Warning);
        assert!(CheckStatus::Warning > CheckStatus::Ok);
    }

    #[test]
    fn test_format_lsn() {
        assert_eq!(format_lsn(Lsn::INVALID), "-");
        assert_eq!(format_lsn("16/B374D848".parse().unwrap()), "16/B374D848");
    }
}

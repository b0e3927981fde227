/// Error types for all repmgr operations.
///
/// Failures are grouped by the layer that produced them; callers decide
/// whether a failure is fatal to the process, fatal to the current attempt,
/// or merely worth logging. The exit-code mapping is applied once, at the
/// binary boundary.

use serde::{Deserialize, Serialize};

/// Unified error type for repmgr operations.
#[derive(Debug, thiserror::Error)]
pub enum RepmgrError {
    /// Malformed configuration: bad conninfo, unknown setting value, missing
    /// required key.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database unreachable or the connection died mid-session.
    #[error("database connection error: {0}")]
    Connection(String),

    /// A catalog query failed outright (as opposed to returning no rows).
    #[error("catalog query failed: {0}")]
    Catalog(String),

    /// The engine refused an operation (promote, slot drop, etc.).
    #[error("engine refused operation: {0}")]
    Protocol(String),

    /// Data directory, control file, or state file could not be read.
    #[error("file system error: {0}")]
    FileSystem(String),

    /// Cluster metadata contradicts itself (e.g. two reachable primaries).
    #[error("cluster consistency error: {0}")]
    Consistency(String),

    /// A local or remote shell command failed.
    #[error("command execution failed: {0}")]
    Command(String),
}

impl RepmgrError {
    /// The exit code a one-shot command should terminate with when this
    /// error is fatal to it.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RepmgrError::Config(_) => ExitCode::BadConfig,
            RepmgrError::Connection(_) => ExitCode::DbConn,
            RepmgrError::Catalog(_) => ExitCode::DbQuery,
            RepmgrError::Protocol(_) => ExitCode::DbQuery,
            RepmgrError::FileSystem(_) => ExitCode::BadConfig,
            RepmgrError::Consistency(_) => ExitCode::NodeStatus,
            RepmgrError::Command(_) => ExitCode::LocalCommand,
        }
    }
}

impl From<std::io::Error> for RepmgrError {
    fn from(e: std::io::Error) -> Self {
        RepmgrError::FileSystem(e.to_string())
    }
}

/// Result type alias for repmgr operations.
pub type RepmgrResult<T> = Result<T, RepmgrError>;

/// Process exit codes for the control tool and daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    BadConfig = 1,
    OutOfMemory = 2,
    DbQuery = 5,
    DbConn = 6,
    PromotionFail = 8,
    NoUxStart = 15,
    SwitchoverFail = 18,
    RejoinFail = 24,
    NodeStatus = 25,
    LocalCommand = 30,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Terminate the current process with this code.
    pub fn exit(self) -> ! {
        std::process::exit(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            RepmgrError::Config("x".into()).exit_code(),
            ExitCode::BadConfig
        );
        assert_eq!(
            RepmgrError::Connection("x".into()).exit_code(),
            ExitCode::DbConn
        );
        assert_eq!(
            RepmgrError::Command("x".into()).exit_code(),
            ExitCode::LocalCommand
        );
        assert_eq!(ExitCode::Success.code(), 0);
        assert_ne!(ExitCode::RejoinFail.code(), ExitCode::SwitchoverFail.code());
    }
}

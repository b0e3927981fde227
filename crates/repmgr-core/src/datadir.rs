//! Data-directory inspection and small state files.
//!
//! The core only ever reads the data directory; the engine is the sole
//! writer. The exceptions are the standby-signal marker (removed and
//! restored around block-level resync) and the daemon's own state file.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use repmgr_proto::constants::{
    ARCHIVE_READY_SUFFIX, ARCHIVE_STATUS_DIR, ARCHIVE_STATUS_DIR_ERROR, RECOVERY_DONE_FILE,
    STANDBY_SIGNAL_FILE, UX_DATADIR_REQUIRED_FILES,
};
use repmgr_proto::{RepmgrError, RepmgrResult};

/// Check whether a directory looks like an engine data directory.
///
/// True only when every well-known top-level entry is present.
pub async fn is_ux_dir(data_directory: &Path) -> bool {
    for entry in UX_DATADIR_REQUIRED_FILES {
        if !data_directory.join(entry).exists() {
            return false;
        }
    }
    true
}

/// Count files in the archive-status directory whose name carries the
/// ready-to-archive marker. Returns the error sentinel if the directory
/// cannot be opened or does not exist.
pub async fn ready_archive_file_count(data_directory: &Path) -> i32 {
    let dir = data_directory.join(ARCHIVE_STATUS_DIR);

    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "unable to open archive status directory \"{}\": {}",
                dir.display(),
                e
            );
            return ARCHIVE_STATUS_DIR_ERROR;
        }
    };

    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(ARCHIVE_READY_SUFFIX) {
                count += 1;
            }
        }
    }
    count
}

pub fn standby_signal_path(data_directory: &Path) -> PathBuf {
    data_directory.join(STANDBY_SIGNAL_FILE)
}

pub async fn standby_signal_exists(data_directory: &Path) -> bool {
    standby_signal_path(data_directory).exists()
}

/// Create an empty standby-signal marker.
pub async fn write_standby_signal(data_directory: &Path) -> RepmgrResult<()> {
    let path = standby_signal_path(data_directory);
    fs::write(&path, b"")
        .await
        .map_err(|e| {
            RepmgrError::FileSystem(format!("unable to write \"{}\": {}", path.display(), e))
        })
}

/// Remove the standby-signal marker; absence is not an error.
pub async fn remove_standby_signal(data_directory: &Path) -> RepmgrResult<()> {
    let path = standby_signal_path(data_directory);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RepmgrError::FileSystem(format!(
            "unable to remove \"{}\": {}",
            path.display(),
            e
        ))),
    }
}

/// Remove the recovery-done marker the resync tool may have copied in.
pub async fn remove_recovery_done(data_directory: &Path) {
    let path = data_directory.join(RECOVERY_DONE_FILE);
    match fs::remove_file(&path).await {
        Ok(()) => debug!("deleted \"{}\"", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("unable to delete \"{}\": {}", path.display(), e),
    }
}

/// Daemon state persisted across engine restarts: the local node id and
/// the pause flag, as one ASCII line `<node_id>:<0|1>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStateFile {
    pub node_id: i32,
    pub paused: bool,
}

impl DaemonStateFile {
    pub fn parse(contents: &str) -> RepmgrResult<Self> {
        let line = contents.trim();
        let (node_id, paused) = line
            .split_once(':')
            .ok_or_else(|| RepmgrError::FileSystem(format!("malformed state file \"{}\"", line)))?;

        let node_id = node_id
            .parse()
            .map_err(|_| RepmgrError::FileSystem(format!("malformed state file \"{}\"", line)))?;

        let paused = match paused {
            "0" => false,
            "1" => true,
            _ => {
                return Err(RepmgrError::FileSystem(format!(
                    "malformed state file \"{}\"",
                    line
                )))
            }
        };

        Ok(Self { node_id, paused })
    }

    pub fn format(&self) -> String {
        format!("{}:{}\n", self.node_id, if self.paused { 1 } else { 0 })
    }
}

pub async fn read_daemon_state_file(path: &Path) -> RepmgrResult<DaemonStateFile> {
    let contents = fs::read_to_string(path).await.map_err(|e| {
        RepmgrError::FileSystem(format!("unable to read \"{}\": {}", path.display(), e))
    })?;
    DaemonStateFile::parse(&contents)
}

pub async fn write_daemon_state_file(path: &Path, state: DaemonStateFile) -> RepmgrResult<()> {
    fs::write(path, state.format()).await.map_err(|e| {
        RepmgrError::FileSystem(format!("unable to write \"{}\": {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_is_ux_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_ux_dir(dir.path()).await);

        std::fs::write(dir.path().join("UX_VERSION"), "12\n").unwrap();
        std::fs::create_dir(dir.path().join("base")).unwrap();
        assert!(!is_ux_dir(dir.path()).await);

        std::fs::create_dir(dir.path().join("global")).unwrap();
        assert!(is_ux_dir(dir.path()).await);
    }

    #[tokio::test]
    async fn test_ready_archive_file_count() {
        let dir = tempfile::tempdir().unwrap();

        // missing directory: error sentinel
        assert_eq!(
            ready_archive_file_count(dir.path()).await,
            ARCHIVE_STATUS_DIR_ERROR
        );

        let status_dir = dir.path().join(ARCHIVE_STATUS_DIR);
        std::fs::create_dir_all(&status_dir).unwrap();
        assert_eq!(ready_archive_file_count(dir.path()).await, 0);

        for i in 0..60 {
            std::fs::write(
                status_dir.join(format!("00000001000000160000{:04X}.ready", i)),
                b"",
            )
            .unwrap();
        }
        std::fs::write(status_dir.join("000000010000001600000000.done"), b"").unwrap();

        assert_eq!(ready_archive_file_count(dir.path()).await, 60);
    }

    #[tokio::test]
    async fn test_standby_signal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!standby_signal_exists(dir.path()).await);

        write_standby_signal(dir.path()).await.unwrap();
        assert!(standby_signal_exists(dir.path()).await);

        remove_standby_signal(dir.path()).await.unwrap();
        assert!(!standby_signal_exists(dir.path()).await);

        // removing an absent marker is not an error
        remove_standby_signal(dir.path()).await.unwrap();
    }

    #[test]
    fn test_daemon_state_file_parse() {
        let state = DaemonStateFile::parse("7:1\n").unwrap();
        assert_eq!(state.node_id, 7);
        assert!(state.paused);

        let state = DaemonStateFile::parse("12:0").unwrap();
        assert_eq!(state.node_id, 12);
        assert!(!state.paused);

        assert!(DaemonStateFile::parse("12").is_err());
        assert!(DaemonStateFile::parse("12:2").is_err());
        assert!(DaemonStateFile::parse("abc:0").is_err());
    }

    #[test]
    fn test_daemon_state_file_roundtrip() {
        let state = DaemonStateFile {
            node_id: 3,
            paused: true,
        };
        assert_eq!(DaemonStateFile::parse(&state.format()).unwrap(), state);
    }
}

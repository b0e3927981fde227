//! On-disk control file inspection.
//!
//! The engine maintains a versioned binary control file at
//! `global/ux_control` in the data directory. Four layouts exist,
//! discriminated by the engine major version (read from the `UX_VERSION`
//! file); fields were appended or replaced across versions and their
//! offsets are fixed by the engine's C struct layout: native endianness,
//! natural alignment. Unknown majors are rejected rather than parsed
//! best-effort.
//!
//! Layout differences:
//! - v9.4: baseline.
//! - v9.5–10: `track_commit_timestamp` added after the lock settings;
//!   checkpoint copy gains the commit-timestamp xid pair.
//! - v11: `prevCheckPoint` removed from the header.
//! - v12+: 64-bit `nextFullXid` replaces the epoch/xid pair in the
//!   checkpoint copy; `max_wal_senders` added after
//!   `max_worker_processes`; `enableIntTimes` removed.

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::debug;

use repmgr_proto::constants::{CONTROL_FILE_PATH, UX_VERSION_FILE};
use repmgr_proto::{Lsn, RepmgrError, RepmgrResult};

/// Database state recorded in the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Startup,
    Shutdowned,
    ShutdownedInRecovery,
    Shutdowning,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
}

impl DbState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DbState::Startup),
            1 => Some(DbState::Shutdowned),
            2 => Some(DbState::ShutdownedInRecovery),
            3 => Some(DbState::Shutdowning),
            4 => Some(DbState::InCrashRecovery),
            5 => Some(DbState::InArchiveRecovery),
            6 => Some(DbState::InProduction),
            _ => None,
        }
    }

    /// Whether the server reached a clean shutdown in this state.
    pub fn is_shutdown_clean(self) -> bool {
        matches!(self, DbState::Shutdowned | DbState::ShutdownedInRecovery)
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbState::Startup => "starting up",
            DbState::Shutdowned => "shut down",
            DbState::ShutdownedInRecovery => "shut down in recovery",
            DbState::Shutdowning => "shutting down",
            DbState::InCrashRecovery => "in crash recovery",
            DbState::InArchiveRecovery => "in archive recovery",
            DbState::InProduction => "in production",
        };
        f.write_str(s)
    }
}

/// The control-file fields repmgr needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileInfo {
    pub system_identifier: u64,
    pub state: DbState,
    pub checkpoint: Lsn,
    pub data_checksum_version: u32,
    pub timeline: u32,
    pub min_recovery_point_tli: u32,
    pub min_recovery_point: Lsn,
}

/// Control-file layout generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    V94,
    V95,
    V11,
    V12,
}

impl Layout {
    fn for_version(version_num: i32) -> RepmgrResult<Self> {
        match version_num {
            v if v >= 120_000 => Ok(Layout::V12),
            v if v >= 110_000 => Ok(Layout::V11),
            v if v >= 90_500 => Ok(Layout::V95),
            v if v >= 90_400 => Ok(Layout::V94),
            v => Err(RepmgrError::FileSystem(format!(
                "unsupported engine version {} for control file parsing",
                v
            ))),
        }
    }
}

/// Sequential reader applying the engine's C struct layout rules.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn align(&mut self, alignment: usize) {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.pos += alignment - rem;
        }
    }

    fn take(&mut self, len: usize) -> RepmgrResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(RepmgrError::FileSystem(format!(
                "control file too short: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u64(&mut self) -> RepmgrResult<u64> {
        self.align(8);
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> RepmgrResult<u32> {
        self.align(4);
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_bool(&mut self) -> RepmgrResult<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    fn skip_u32(&mut self, count: usize) -> RepmgrResult<()> {
        for _ in 0..count {
            self.read_u32()?;
        }
        Ok(())
    }
}

/// Decode the checkpoint copy embedded in the header, returning the
/// current timeline. Leaves the reader positioned after the copy.
fn read_checkpoint_copy(r: &mut FieldReader<'_>, layout: Layout) -> RepmgrResult<u32> {
    r.read_u64()?; // redo
    let timeline = r.read_u32()?; // ThisTimeLineID
    r.read_u32()?; // PrevTimeLineID
    r.read_bool()?; // fullPageWrites

    match layout {
        Layout::V12 => {
            r.read_u64()?; // nextFullXid
            r.skip_u32(7)?; // nextOid .. oldestMultiDB
        }
        _ => {
            r.skip_u32(9)?; // nextXidEpoch .. oldestMultiDB
        }
    }

    r.read_u64()?; // checkpoint timestamp

    match layout {
        Layout::V94 => {
            r.read_u32()?; // oldestActiveXid
        }
        _ => {
            r.skip_u32(3)?; // oldestCommitTsXid, newestCommitTsXid, oldestActiveXid
        }
    }

    // the copy is 8-aligned within the header struct
    r.align(8);
    Ok(timeline)
}

/// Parse a control file buffer according to the engine version.
fn parse_control_file(buf: &[u8], version_num: i32) -> RepmgrResult<ControlFileInfo> {
    let layout = Layout::for_version(version_num)?;
    let mut r = FieldReader::new(buf);

    let system_identifier = r.read_u64()?;
    r.read_u32()?; // ux_control_version
    r.read_u32()?; // catalog_version_no

    let state_raw = r.read_u32()?;
    let state = DbState::from_raw(state_raw).ok_or_else(|| {
        RepmgrError::FileSystem(format!("unrecognised database state {}", state_raw))
    })?;

    r.read_u64()?; // control file update timestamp
    let checkpoint = Lsn(r.read_u64()?);

    if matches!(layout, Layout::V94 | Layout::V95) {
        r.read_u64()?; // prevCheckPoint
    }

    let timeline = read_checkpoint_copy(&mut r, layout)?;

    r.read_u64()?; // unloggedLSN
    let min_recovery_point = Lsn(r.read_u64()?);
    let min_recovery_point_tli = r.read_u32()?;
    r.read_u64()?; // backupStartPoint
    r.read_u64()?; // backupEndPoint
    r.read_bool()?; // backupEndRequired

    r.read_u32()?; // wal_level
    r.read_bool()?; // wal_log_hints
    r.read_u32()?; // MaxConnections
    r.read_u32()?; // max_worker_processes
    if layout == Layout::V12 {
        r.read_u32()?; // max_wal_senders
    }
    r.read_u32()?; // max_prepared_xacts
    r.read_u32()?; // max_locks_per_xact
    if layout != Layout::V94 {
        r.read_bool()?; // track_commit_timestamp
    }

    r.read_u32()?; // maxAlign
    r.read_u64()?; // floatFormat (f64, same width)

    r.skip_u32(8)?; // blcksz .. loblksize

    if layout != Layout::V12 {
        r.read_bool()?; // enableIntTimes
    }
    r.read_bool()?; // float4ByVal
    r.read_bool()?; // float8ByVal

    let data_checksum_version = r.read_u32()?;

    Ok(ControlFileInfo {
        system_identifier,
        state,
        checkpoint,
        data_checksum_version,
        timeline,
        min_recovery_point_tli,
        min_recovery_point,
    })
}

/// Engine major version as a version number (e.g. `120000`), read from
/// the `UX_VERSION` file in the data directory.
pub fn get_ux_version(data_directory: &Path) -> RepmgrResult<i32> {
    let path = data_directory.join(UX_VERSION_FILE);
    let contents = fs::read_to_string(&path).map_err(|e| {
        RepmgrError::FileSystem(format!("unable to read \"{}\": {}", path.display(), e))
    })?;

    parse_version_string(contents.trim())
}

fn parse_version_string(version: &str) -> RepmgrResult<i32> {
    let mut parts = version.split('.');
    let major: i32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| RepmgrError::FileSystem(format!("unparseable version \"{}\"", version)))?;

    // two-component majors up to 9.6, single-component from 10
    if major >= 10 {
        Ok(major * 10_000)
    } else {
        let minor: i32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                RepmgrError::FileSystem(format!("unparseable version \"{}\"", version))
            })?;
        Ok(major * 10_000 + minor * 100)
    }
}

/// Read and parse the control file from a data directory.
pub fn get_control_file_info(data_directory: &Path) -> RepmgrResult<ControlFileInfo> {
    let version_num = get_ux_version(data_directory)?;

    let path = data_directory.join(CONTROL_FILE_PATH);
    let buf = fs::read(&path).map_err(|e| {
        RepmgrError::FileSystem(format!("unable to read \"{}\": {}", path.display(), e))
    })?;

    debug!(
        "parsing control file \"{}\" (version {})",
        path.display(),
        version_num
    );

    parse_control_file(&buf, version_num)
}

pub fn get_db_state(data_directory: &Path) -> RepmgrResult<DbState> {
    Ok(get_control_file_info(data_directory)?.state)
}

pub fn get_system_identifier(data_directory: &Path) -> RepmgrResult<u64> {
    Ok(get_control_file_info(data_directory)?.system_identifier)
}

pub fn get_latest_checkpoint_location(data_directory: &Path) -> Lsn {
    get_control_file_info(data_directory)
        .map(|info| info.checkpoint)
        .unwrap_or(Lsn::INVALID)
}

pub fn get_timeline(data_directory: &Path) -> u32 {
    get_control_file_info(data_directory)
        .map(|info| info.timeline)
        .unwrap_or(0)
}

pub fn get_min_recovery_end_timeline(data_directory: &Path) -> u32 {
    get_control_file_info(data_directory)
        .map(|info| info.min_recovery_point_tli)
        .unwrap_or(0)
}

pub fn get_min_recovery_location(data_directory: &Path) -> Lsn {
    get_control_file_info(data_directory)
        .map(|info| info.min_recovery_point)
        .unwrap_or(Lsn::INVALID)
}

pub fn get_data_checksum_version(data_directory: &Path) -> RepmgrResult<u32> {
    Ok(get_control_file_info(data_directory)?.data_checksum_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer mirroring the engine's struct layout rules, used to build
    /// reference control files for each supported layout.
    struct FieldWriter {
        buf: Vec<u8>,
    }

    impl FieldWriter {
        fn new() -> Self {
            Self { buf: Vec::new() }
        }

        fn align(&mut self, alignment: usize) {
            while self.buf.len() % alignment != 0 {
                self.buf.push(0);
            }
        }

        fn write_u64(&mut self, v: u64) {
            self.align(8);
            self.buf.extend_from_slice(&v.to_ne_bytes());
        }

        fn write_u32(&mut self, v: u32) {
            self.align(4);
            self.buf.extend_from_slice(&v.to_ne_bytes());
        }

        fn write_bool(&mut self, v: bool) {
            self.buf.push(v as u8);
        }

        fn offset(&self) -> usize {
            self.buf.len()
        }
    }

    struct Reference {
        system_identifier: u64,
        state: u32,
        checkpoint: u64,
        timeline: u32,
        min_recovery_point: u64,
        min_recovery_point_tli: u32,
        data_checksum_version: u32,
    }

    fn build_control_file(version_num: i32, r: &Reference) -> Vec<u8> {
        let layout = Layout::for_version(version_num).unwrap();
        let mut w = FieldWriter::new();

        w.write_u64(r.system_identifier);
        w.write_u32(1201); // ux_control_version
        w.write_u32(202307071); // catalog_version_no
        assert_eq!(w.offset(), 16);
        w.write_u32(r.state);
        w.write_u64(1_700_000_000); // update time
        w.write_u64(r.checkpoint);
        assert_eq!(w.offset(), 40);

        if matches!(layout, Layout::V94 | Layout::V95) {
            w.write_u64(r.checkpoint - 0x100); // prevCheckPoint
        }

        // checkpoint copy
        w.write_u64(r.checkpoint - 0x28); // redo
        w.write_u32(r.timeline);
        w.write_u32(r.timeline); // PrevTimeLineID
        w.write_bool(true); // fullPageWrites
        match layout {
            Layout::V12 => {
                w.write_u64(0x0000_0003_0000_07d0); // nextFullXid
                for _ in 0..7 {
                    w.write_u32(1);
                }
            }
            _ => {
                for _ in 0..9 {
                    w.write_u32(1);
                }
            }
        }
        w.write_u64(1_700_000_000); // checkpoint time
        match layout {
            Layout::V94 => w.write_u32(7),
            _ => {
                for _ in 0..3 {
                    w.write_u32(7);
                }
            }
        }
        w.align(8);

        w.write_u64(1); // unloggedLSN
        w.write_u64(r.min_recovery_point);
        w.write_u32(r.min_recovery_point_tli);
        w.write_u64(0); // backupStartPoint
        w.write_u64(0); // backupEndPoint
        w.write_bool(false); // backupEndRequired

        w.write_u32(2); // wal_level
        w.write_bool(false); // wal_log_hints
        w.write_u32(100); // MaxConnections
        w.write_u32(8); // max_worker_processes
        if layout == Layout::V12 {
            w.write_u32(10); // max_wal_senders
        }
        w.write_u32(0); // max_prepared_xacts
        w.write_u32(64); // max_locks_per_xact
        if layout != Layout::V94 {
            w.write_bool(false); // track_commit_timestamp
        }

        w.write_u32(8); // maxAlign
        w.write_u64(1234567.0f64.to_bits()); // floatFormat
        for v in [8192u32, 131072, 8192, 16 * 1024 * 1024, 64, 32, 1996, 2048] {
            w.write_u32(v); // blcksz .. loblksize
        }
        if layout != Layout::V12 {
            w.write_bool(true); // enableIntTimes
        }
        w.write_bool(true); // float4ByVal
        w.write_bool(true); // float8ByVal
        w.write_u32(r.data_checksum_version);

        w.buf
    }

    fn reference() -> Reference {
        Reference {
            system_identifier: 0x6f1e_22ab_cd01_2345,
            state: 1, // shut down
            checkpoint: (0x16u64 << 32) | 0xB374_D848,
            timeline: 4,
            min_recovery_point: (0x17u64 << 32) | 0x10_0000,
            min_recovery_point_tli: 4,
            data_checksum_version: 1,
        }
    }

    #[test]
    fn test_parse_all_supported_layouts() {
        let r = reference();

        for version in [90_400, 90_600, 110_000, 120_005] {
            let buf = build_control_file(version, &r);
            let info = parse_control_file(&buf, version)
                .unwrap_or_else(|e| panic!("version {}: {}", version, e));

            assert_eq!(info.system_identifier, r.system_identifier, "v{}", version);
            assert_eq!(info.state, DbState::Shutdowned, "v{}", version);
            assert_eq!(info.checkpoint, Lsn(r.checkpoint), "v{}", version);
            assert_eq!(info.timeline, r.timeline, "v{}", version);
            assert_eq!(info.min_recovery_point, Lsn(r.min_recovery_point), "v{}", version);
            assert_eq!(info.min_recovery_point_tli, r.min_recovery_point_tli, "v{}", version);
            assert_eq!(info.data_checksum_version, r.data_checksum_version, "v{}", version);
        }
    }

    #[test]
    fn test_reject_unknown_major() {
        let r = reference();
        let buf = build_control_file(120_000, &r);
        assert!(parse_control_file(&buf, 90_300).is_err());
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let r = reference();
        let buf = build_control_file(120_000, &r);
        assert!(parse_control_file(&buf[..40], 120_000).is_err());
    }

    #[test]
    fn test_bad_state_is_an_error() {
        let r = Reference {
            state: 99,
            ..reference()
        };
        let buf = build_control_file(120_000, &r);
        assert!(parse_control_file(&buf, 120_000).is_err());
    }

    #[test]
    fn test_version_string_parsing() {
        assert_eq!(parse_version_string("9.4").unwrap(), 90_400);
        assert_eq!(parse_version_string("9.6").unwrap(), 90_600);
        assert_eq!(parse_version_string("11").unwrap(), 110_000);
        assert_eq!(parse_version_string("12").unwrap(), 120_000);
        assert!(parse_version_string("devel").is_err());
        assert!(parse_version_string("9").is_err());
    }

    #[test]
    fn test_db_state_classification() {
        assert!(DbState::Shutdowned.is_shutdown_clean());
        assert!(DbState::ShutdownedInRecovery.is_shutdown_clean());
        assert!(!DbState::Shutdowning.is_shutdown_clean());
        assert!(!DbState::InProduction.is_shutdown_clean());
    }

    #[test]
    fn test_read_from_data_directory() {
        let r = reference();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UX_VERSION"), "12\n").unwrap();
        std::fs::create_dir(dir.path().join("global")).unwrap();
        std::fs::write(
            dir.path().join("global/ux_control"),
            build_control_file(120_000, &r),
        )
        .unwrap();

        let info = get_control_file_info(dir.path()).unwrap();
        assert_eq!(info.system_identifier, r.system_identifier);
        assert_eq!(get_db_state(dir.path()).unwrap(), DbState::Shutdowned);
        assert_eq!(get_latest_checkpoint_location(dir.path()), Lsn(r.checkpoint));
        assert_eq!(get_timeline(dir.path()), r.timeline);
    }
}

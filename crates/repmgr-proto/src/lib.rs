//! # repmgr-proto
//!
//! Shared types, constants, and data structures for the repmgr
//! replication manager.
//!
//! This crate defines the cluster data model (node records, events,
//! replication info), the WAL position type, error types, and the
//! sentinel/default constants shared by the daemon and the control tool.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod event;
pub mod lsn;
pub mod node;

// Re-export commonly used types at the crate root
pub use error::{ExitCode, RepmgrError, RepmgrResult};
pub use event::EventRecord;
pub use lsn::Lsn;
pub use node::{NodeRecord, NodeType, RecordStatus, ReplInfo};

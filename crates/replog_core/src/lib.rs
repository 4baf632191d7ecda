//! # Replog Core
//!
//! Persistent storage of directory replication changelogs.
//!
//! This crate provides:
//! - Block framing: length-prefixed records with a back-offset at every
//!   256-byte block boundary, so a file can be binary searched by key
//! - Log files with reader pools and recovery of torn tails
//! - Multi-file logs with rotation, purge and cursors surviving rotation
//! - Composite cursors merging the logs of several replicas and domains
//! - Replica DBs keyed by CSN and the change number index
//! - The replication environment managing the on-disk layout
//!
//! ## Example
//!
//! ```rust
//! use replog_core::{
//!     ChangelogConfig, Csn, CursorOptions, DbCursor, FileChangelogDb, ReplicationEnvironment,
//!     ServerState, UpdateMsg,
//! };
//!
//! let dir = tempfile::tempdir().unwrap();
//! let env = ReplicationEnvironment::open(dir.path(), ChangelogConfig::default()).unwrap();
//! let changelog = FileChangelogDb::open(env).unwrap();
//!
//! let msg = UpdateMsg::new(Csn::new(1_000, 0, 1), b"add cn=foo".to_vec());
//! changelog.publish_update_msg("dc=example,dc=com", 42, &msg).unwrap();
//!
//! let mut cursor = changelog
//!     .domain_cursor("dc=example,dc=com", &ServerState::new(), CursorOptions::after())
//!     .unwrap();
//! assert!(cursor.next().unwrap());
//! assert_eq!(cursor.record(), Some(&msg));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod block;
pub mod change_number;
mod changelog_db;
mod config;
mod csn;
pub mod cursor;
pub mod environment;
mod error;
pub mod log;
mod parser;
mod record;
pub mod replica;
mod time;

pub use change_number::{
    ChangeNumberIndexRecord, ChangeNumberIndexRecordParser, FileChangeNumberIndexDb,
};
pub use changelog_db::FileChangelogDb;
pub use config::{ChangelogConfig, LogRotationParameters};
pub use csn::{Csn, ServerState};
pub use cursor::{
    CompositeCursor, CursorOptions, DbCursor, DomainCursor, KeyMatchingStrategy,
    MultiDomainCursor, PositionStrategy, RepositionableCursor,
};
pub use environment::{ChangelogState, ReplicationEnvironment};
pub use error::{ChangelogError, ChangelogResult};
pub use log::{Log, LogCursor, LogOptions, LogRegistry};
pub use parser::{LogKey, LogValue, RecordParser};
pub use record::{Keyed, Record};
pub use replica::{CsnLimits, FileReplicaDb, ReplicaCursor, UpdateMsg, UpdateMsgParser};
pub use time::{ManualTimeService, SystemTimeService, TimeService};

//! Per-replica logs of update messages, keyed by CSN.

mod cursor;
mod replica_db;
mod update;

pub use cursor::ReplicaCursor;
pub use replica_db::{CsnLimits, FileReplicaDb};
pub use update::{UpdateMsg, UpdateMsgParser};

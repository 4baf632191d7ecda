//! The change number index: one log numbering every change of every
//! domain.

mod index_db;
mod record;

pub use index_db::FileChangeNumberIndexDb;
pub use record::{ChangeNumberIndexRecord, ChangeNumberIndexRecordParser};

//! Cursor over the update messages of one replica.

use super::UpdateMsg;
use crate::csn::Csn;
use crate::cursor::{DbCursor, KeyMatchingStrategy, PositionStrategy, RepositionableCursor};
use crate::error::ChangelogResult;
use crate::log::LogCursor;

/// Reads the update messages of one replica in CSN order.
///
/// Like the log cursor it wraps, it keeps returning messages appended after
/// it was exhausted.
#[derive(Debug)]
pub struct ReplicaCursor {
    cursor: LogCursor<Csn, UpdateMsg>,
    server_id: u16,
}

impl ReplicaCursor {
    pub(crate) fn new(cursor: LogCursor<Csn, UpdateMsg>, server_id: u16) -> Self {
        Self { cursor, server_id }
    }

    /// Returns the id of the replica read.
    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Returns the CSN of the current message.
    pub fn csn(&self) -> Option<Csn> {
        self.record().map(UpdateMsg::csn)
    }
}

impl DbCursor for ReplicaCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.cursor.record().map(|record| record.value())
    }

    fn next(&mut self) -> ChangelogResult<bool> {
        self.cursor.next()
    }
}

impl RepositionableCursor for ReplicaCursor {
    type Key = Csn;

    fn position_to(
        &mut self,
        key: Option<&Csn>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<bool> {
        self.cursor.position_to(key, matching, position)
    }
}

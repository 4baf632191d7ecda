//! Cursors over a whole [`Log`].

use super::log_file::{LogFile, LogFileCursor};
use super::segmented::Log;
use crate::cursor::{DbCursor, KeyMatchingStrategy, PositionStrategy, RepositionableCursor};
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::{LogKey, LogValue};
use crate::record::Record;
use parking_lot::Mutex;
use std::sync::Arc;

/// State of a cursor as seen by the log that owns it.
pub(super) enum CursorSlot<K: LogKey, V: LogValue> {
    /// Reading a file.
    Active(LogFileCursor<K, V>),
    /// Taken off its file while the head is being rotated.
    Detached,
    /// The log was cleared, or nothing matched an exact key.
    Empty,
    /// The file being read was purged.
    Aborted,
}

impl<K: LogKey, V: LogValue> CursorSlot<K, V> {
    pub(super) fn reads(&self, file: &Arc<LogFile<K, V>>) -> bool {
        matches!(self, Self::Active(cursor) if Arc::ptr_eq(cursor.file(), file))
    }
}

/// A cursor reading the records of a [`Log`] in key order, moving from one
/// file to the next.
///
/// The cursor stays valid across rotations of the head file. It becomes
/// empty when the log is cleared and fails with
/// [`ChangelogError::CursorAborted`] once the file it reads is purged.
/// Dropping the cursor unregisters it from the log.
pub struct LogCursor<K: LogKey, V: LogValue> {
    log: Arc<Log<K, V>>,
    id: Option<u64>,
    slot: Arc<Mutex<CursorSlot<K, V>>>,
    record: Option<Record<K, V>>,
}

impl<K: LogKey, V: LogValue> LogCursor<K, V> {
    pub(super) fn registered(log: Arc<Log<K, V>>, id: u64, slot: Arc<Mutex<CursorSlot<K, V>>>) -> Self {
        Self {
            log,
            id: Some(id),
            slot,
            record: None,
        }
    }

    pub(super) fn empty(log: Arc<Log<K, V>>) -> Self {
        Self {
            log,
            id: None,
            slot: Arc::new(Mutex::new(CursorSlot::Empty)),
            record: None,
        }
    }

    fn aborted(&self) -> ChangelogError {
        ChangelogError::CursorAborted {
            path: self.log.path().to_path_buf(),
        }
    }
}

impl<K: LogKey, V: LogValue> DbCursor for LogCursor<K, V> {
    type Item = Record<K, V>;

    fn record(&self) -> Option<&Record<K, V>> {
        self.record.as_ref()
    }

    fn next(&mut self) -> ChangelogResult<bool> {
        let state = self.log.state.read();
        if state.is_closed() {
            self.record = None;
            return Ok(false);
        }
        let mut slot = self.slot.lock();
        let cursor = match &mut *slot {
            CursorSlot::Active(cursor) => cursor,
            CursorSlot::Empty => {
                self.record = None;
                return Ok(false);
            }
            CursorSlot::Aborted => return Err(self.aborted()),
            CursorSlot::Detached => {
                return Err(ChangelogError::invalid_operation(
                    "cursor lost its log file during a failed rotation",
                ))
            }
        };

        loop {
            if cursor.next()? {
                self.record = cursor.record().cloned();
                return Ok(true);
            }
            match state.next_file(cursor.file()) {
                Some(next) => *cursor = next.cursor()?,
                None => {
                    self.record = None;
                    return Ok(false);
                }
            }
        }
    }
}

impl<K: LogKey, V: LogValue> RepositionableCursor for LogCursor<K, V> {
    type Key = K;

    fn position_to(
        &mut self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<bool> {
        let state = self.log.state.read();
        if state.is_closed() {
            return Ok(false);
        }
        let mut slot = self.slot.lock();
        match &mut *slot {
            CursorSlot::Active(cursor) => {
                let file = state.find_log_file_for(key, matching)?;
                let mut repositioned = file.cursor()?;
                let found = match key {
                    Some(key) => repositioned.position_to(key, matching, position)?,
                    None => true,
                };
                *cursor = repositioned;
                self.record = None;
                Ok(found)
            }
            CursorSlot::Empty => Ok(false),
            CursorSlot::Aborted => Err(self.aborted()),
            CursorSlot::Detached => Err(ChangelogError::invalid_operation(
                "cursor lost its log file during a failed rotation",
            )),
        }
    }
}

impl<K: LogKey, V: LogValue> Drop for LogCursor<K, V> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.log.cursors.lock().remove(id);
        }
    }
}

impl<K: LogKey, V: LogValue> std::fmt::Debug for LogCursor<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCursor")
            .field("log", &self.log.path())
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

//! The change number index DB.

use super::ChangeNumberIndexRecord;
use crate::csn::Csn;
use crate::cursor::CursorOptions;
use crate::environment::ReplicationEnvironment;
use crate::error::{ChangelogError, ChangelogResult};
use crate::log::{Log, LogCursor};
use crate::record::Record;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Numbers every change of every domain with a sequential change number.
///
/// A change number is taken before its record is written and is never
/// given back: if the write fails, the number is skipped.
pub struct FileChangeNumberIndexDb {
    env: Arc<ReplicationEnvironment>,
    log: Arc<Log<u64, ChangeNumberIndexRecord>>,
    last_generated: AtomicU64,
    shutdown: AtomicBool,
}

impl FileChangeNumberIndexDb {
    /// Opens the index, numbering new changes after the newest one stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened.
    pub fn open(env: Arc<ReplicationEnvironment>) -> ChangelogResult<Self> {
        let log = env.get_or_create_cn_index_log()?;
        let last_generated = log.newest_record().map_or(0, |r| *r.key());
        tracing::debug!(last_generated, "opened change number index");
        Ok(Self {
            env,
            log,
            last_generated: AtomicU64::new(last_generated),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Assigns the next change number to the change `csn` of `base_dn` and
    /// records it. Returns the change number.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Shutdown`] once the index is shut down, or
    /// an error if the write fails.
    pub fn add_record(&self, base_dn: &str, csn: Csn) -> ChangelogResult<u64> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ChangelogError::Shutdown);
        }
        let change_number = self.last_generated.fetch_add(1, Ordering::AcqRel) + 1;
        let record = ChangeNumberIndexRecord::new(change_number, base_dn, csn);
        self.log.append(&Record::new(change_number, record))?;
        tracing::trace!(change_number, base_dn, %csn, "indexed change");
        Ok(change_number)
    }

    /// Returns the last change number handed out.
    pub fn last_generated_change_number(&self) -> u64 {
        self.last_generated.load(Ordering::Acquire)
    }

    /// Returns the oldest record.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn oldest_record(&self) -> ChangelogResult<Option<ChangeNumberIndexRecord>> {
        Ok(self.log.oldest_record()?.map(|r| r.into_parts().1))
    }

    /// Returns the newest record.
    pub fn newest_record(&self) -> Option<ChangeNumberIndexRecord> {
        self.log.newest_record().map(|r| r.into_parts().1)
    }

    /// Returns true if no record is stored.
    pub fn is_empty(&self) -> bool {
        self.log.newest_record().is_none()
    }

    /// Counts the records stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn number_of_records(&self) -> ChangelogResult<u64> {
        self.log.number_of_records()
    }

    /// Returns a cursor positioned on `start` with the given strategies, or
    /// before the oldest record if `start` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn cursor_from(
        &self,
        start: Option<u64>,
        options: CursorOptions,
    ) -> ChangelogResult<LogCursor<u64, ChangeNumberIndexRecord>> {
        self.log.cursor_from(start.as_ref(), options)
    }

    /// Deletes the records of the files holding only changes older than
    /// `purge_csn`. Returns the CSN of the oldest record left, `None` if
    /// nothing was purged.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or some files could not
    /// be deleted.
    pub fn purge_up_to(&self, purge_csn: &Csn) -> ChangelogResult<Option<Csn>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(None);
        }
        let Some(boundary) = self
            .log
            .find_boundary_key_from_record(ChangeNumberIndexRecord::csn, purge_csn)?
        else {
            return Ok(None);
        };
        tracing::trace!(boundary, %purge_csn, "purging change number index");
        Ok(self.log.purge_up_to(&boundary)?.map(|r| r.value().csn()))
    }

    /// Deletes every record and numbers the next change 1.
    ///
    /// # Errors
    ///
    /// Returns an error if some files could not be deleted.
    pub fn clear(&self) -> ChangelogResult<()> {
        self.log.clear()?;
        self.last_generated.store(0, Ordering::Release);
        Ok(())
    }

    /// Returns the log holding the records.
    pub fn log(&self) -> &Arc<Log<u64, ChangeNumberIndexRecord>> {
        &self.log
    }

    /// Releases the log. Later additions fail.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.env.close_log(&self.log);
    }
}

impl std::fmt::Debug for FileChangeNumberIndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeNumberIndexDb")
            .field("last_generated", &self.last_generated_change_number())
            .finish_non_exhaustive()
    }
}

//! The multi-file log.

use super::cursor::{CursorSlot, LogCursor};
use super::log_file::{LogFile, LogFileCursor, LogFileCursorState};
use super::{LogOptions, LogRotationNotifier, HEAD_LOG_FILE_NAME, LOG_FILE_NAME_SEPARATOR, LOG_FILE_SUFFIX};
use crate::config::LogRotationParameters;
use crate::cursor::{CursorOptions, KeyMatchingStrategy};
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::{LogKey, LogValue, RecordParser};
use crate::record::Record;
use crate::time::TimeService;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A log of records stored in several files.
///
/// Log files are indexed by the highest key they contain; the head file is
/// indexed by the parser's maximum key so that it always sorts last.
///
/// Appending a record whose key is not strictly greater than the last key
/// appended is silently ignored, as is any operation on a closed log.
///
/// Logs shared between components are opened and released through a
/// [`super::LogRegistry`].
pub struct Log<K: LogKey, V: LogValue> {
    path: PathBuf,
    parser: Arc<dyn RecordParser<K, V>>,
    recover_on_open: bool,
    time_service: Arc<dyn TimeService>,
    rotation_notifier: Option<Arc<dyn LogRotationNotifier>>,
    pub(super) state: RwLock<LogState<K, V>>,
    pub(super) cursors: Mutex<OpenCursors<K, V>>,
}

pub(super) struct LogState<K: LogKey, V: LogValue> {
    files: BTreeMap<K, Arc<LogFile<K, V>>>,
    closed: bool,
    last_appended_key: Option<K>,
    rotation: LogRotationParameters,
}

/// Cursors registered on a log, so that rotation, purge and clear can
/// update them.
pub(super) struct OpenCursors<K: LogKey, V: LogValue> {
    next_id: u64,
    slots: HashMap<u64, Arc<Mutex<CursorSlot<K, V>>>>,
}

impl<K: LogKey, V: LogValue> OpenCursors<K, V> {
    pub(super) fn remove(&mut self, id: u64) {
        self.slots.remove(&id);
    }
}

impl<K: LogKey, V: LogValue> LogState<K, V> {
    pub(super) fn is_closed(&self) -> bool {
        self.closed
    }

    fn head(&self) -> ChangelogResult<&Arc<LogFile<K, V>>> {
        self.files
            .values()
            .next_back()
            .ok_or_else(|| ChangelogError::invalid_operation("log has no head file"))
    }

    fn oldest(&self) -> ChangelogResult<&Arc<LogFile<K, V>>> {
        self.files
            .values()
            .next()
            .ok_or_else(|| ChangelogError::invalid_operation("log has no head file"))
    }

    /// Returns the file following `file`, `None` if `file` is the head.
    pub(super) fn next_file(&self, file: &LogFile<K, V>) -> Option<Arc<LogFile<K, V>>> {
        let (_, highest) = file.key_bounds()?;
        self.files
            .range((Bound::Excluded(highest), Bound::Unbounded))
            .next()
            .map(|(_, next)| Arc::clone(next))
    }

    /// Returns the file to read to position a cursor on `key`.
    pub(super) fn find_log_file_for(
        &self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
    ) -> ChangelogResult<Arc<LogFile<K, V>>> {
        let Some(key) = key else {
            return self.oldest().cloned();
        };
        if self.files.range(..key).next().is_none() {
            return self.oldest().cloned();
        }
        let Some((_, candidate)) = self.files.range(key..).next() else {
            return self.head().cloned();
        };
        if matching == KeyMatchingStrategy::LessThanOrEqualToKey {
            let starts_after_key = candidate
                .oldest_record()?
                .map_or(true, |oldest| oldest.key() > key);
            if starts_after_key {
                if let Some((_, floor)) = self.files.range(..=key).next_back() {
                    return Ok(Arc::clone(floor));
                }
            }
        }
        Ok(Arc::clone(candidate))
    }

    fn oldest_record(&self) -> ChangelogResult<Option<Record<K, V>>> {
        self.oldest()?.oldest_record()
    }

    fn newest_record(&self) -> Option<Record<K, V>> {
        self.files.values().rev().find_map(|file| file.newest_record())
    }
}

impl<K: LogKey, V: LogValue> Log<K, V> {
    /// Opens the log stored in directory `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read, a file name does
    /// not hold valid keys, or a file cannot be opened.
    pub fn open(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        options: LogOptions,
    ) -> ChangelogResult<Arc<Self>> {
        fs::create_dir_all(path).map_err(|e| ChangelogError::io("create directory", path, e))?;

        let mut files = BTreeMap::new();
        let head = LogFile::open_write_enabled(
            &path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&parser),
            options.recover_on_open,
        )?;
        files.insert(parser.max_key(), Arc::new(head));

        let entries = fs::read_dir(path).map_err(|e| ChangelogError::io("list", path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ChangelogError::io("list", path, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == HEAD_LOG_FILE_NAME {
                continue;
            }
            let Some(stem) = name.strip_suffix(LOG_FILE_SUFFIX) else {
                continue;
            };
            let (lowest, highest) = parse_key_bounds(parser.as_ref(), stem)?;
            let file = LogFile::open_read_only(&entry.path(), Arc::clone(&parser), lowest, highest.clone())?;
            files.insert(highest, Arc::new(file));
        }

        let mut state = LogState {
            files,
            closed: false,
            last_appended_key: None,
            rotation: options.rotation,
        };
        state.last_appended_key = state.newest_record().map(|r| r.key().clone());

        tracing::debug!(
            path = %path.display(),
            files = state.files.len(),
            "opened log"
        );

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            parser,
            recover_on_open: options.recover_on_open,
            time_service: options.time_service,
            rotation_notifier: options.rotation_notifier,
            state: RwLock::new(state),
            cursors: Mutex::new(OpenCursors {
                next_id: 0,
                slots: HashMap::new(),
            }),
        }))
    }

    /// Returns the directory of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the codec of the log.
    pub fn parser(&self) -> &Arc<dyn RecordParser<K, V>> {
        &self.parser
    }

    /// Returns true once the log is closed.
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Appends a record to the head file, rotating it first if needed.
    ///
    /// A record whose key is not strictly greater than the last key appended
    /// is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if rotation or the write fails.
    pub fn append(&self, record: &Record<K, V>) -> ChangelogResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        if let Some(last) = &state.last_appended_key {
            if record.key() <= last {
                tracing::warn!(
                    path = %self.path.display(),
                    key = ?record.key(),
                    last = ?last,
                    "ignoring record appended out of order"
                );
                return Ok(());
            }
        }
        if !state.head()?.is_write_enabled() {
            return Err(ChangelogError::invalid_operation(format!(
                "log {} was opened over an invalid tail and is read-only",
                self.path.display()
            )));
        }
        if self.must_rotate(&state)? {
            self.rotate_head_log_file(&mut state)?;
        }
        state.head()?.append(record)?;
        state.last_appended_key = Some(record.key().clone());
        Ok(())
    }

    fn must_rotate(&self, state: &LogState<K, V>) -> ChangelogResult<bool> {
        let head = state.head()?;
        if head.is_empty() {
            return Ok(false);
        }
        if head.size_in_bytes()? > state.rotation.size_limit_per_file {
            return Ok(true);
        }
        let interval = state.rotation.rotation_interval_millis;
        Ok(interval > 0 && self.time_service.since(state.rotation.last_rotation_time) > interval)
    }

    /// Turns the head file into a read-only file and opens a new empty head.
    /// Cursors reading the head are moved to the read-only file.
    fn rotate_head_log_file(&self, state: &mut LogState<K, V>) -> ChangelogResult<()> {
        let head = Arc::clone(state.head()?);
        let Some(newest) = head.newest_record() else {
            return Ok(());
        };
        let oldest = head
            .oldest_record()?
            .ok_or_else(|| ChangelogError::invalid_operation("non-empty head has no oldest record"))?;
        let (lowest, _) = oldest.into_parts();
        let highest = newest.key().clone();

        let detached = self.detach_cursors_on(&head);
        head.close();

        let rotated_path = self.path.join(format!(
            "{}{LOG_FILE_NAME_SEPARATOR}{}{LOG_FILE_SUFFIX}",
            self.parser.encode_key_to_string(&lowest),
            self.parser.encode_key_to_string(&highest)
        ));
        fs::rename(head.path(), &rotated_path)
            .map_err(|e| ChangelogError::io("rename", head.path(), e))?;

        let new_head = LogFile::open_write_enabled(
            &self.path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&self.parser),
            self.recover_on_open,
        )?;
        state.files.insert(self.parser.max_key(), Arc::new(new_head));

        let rotated = Arc::new(LogFile::open_read_only(
            &rotated_path,
            Arc::clone(&self.parser),
            lowest,
            highest.clone(),
        )?);
        state.files.insert(highest, Arc::clone(&rotated));

        for (slot, saved) in detached {
            *slot.lock() = CursorSlot::Active(rotated.cursor_from_state(saved)?);
        }

        let now = self.time_service.now_millis();
        state.rotation.last_rotation_time = now;
        if let Some(notifier) = &self.rotation_notifier {
            notifier.log_file_rotated(&self.path, now);
        }

        tracing::trace!(
            path = %self.path.display(),
            rotated = %rotated_path.display(),
            "rotated head log file"
        );
        Ok(())
    }

    /// Detaches the cursors reading `file`, returning their saved state.
    fn detach_cursors_on(
        &self,
        file: &Arc<LogFile<K, V>>,
    ) -> Vec<(Arc<Mutex<CursorSlot<K, V>>>, LogFileCursorState<K, V>)> {
        let cursors = self.cursors.lock();
        let mut detached = Vec::new();
        for slot in cursors.slots.values() {
            let mut guard = slot.lock();
            if guard.reads(file) {
                if let CursorSlot::Active(cursor) =
                    std::mem::replace(&mut *guard, CursorSlot::Detached)
                {
                    detached.push((Arc::clone(slot), cursor.state()));
                }
            }
        }
        detached
    }

    fn abort_cursors_on(&self, file: &Arc<LogFile<K, V>>) {
        let cursors = self.cursors.lock();
        for slot in cursors.slots.values() {
            let mut guard = slot.lock();
            if guard.reads(file) {
                *guard = CursorSlot::Aborted;
            }
        }
    }

    /// Syncs the head file to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync_to_file_system(&self) -> ChangelogResult<()> {
        let state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.head()?.sync_to_file_system()
    }

    /// Returns the oldest record of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn oldest_record(&self) -> ChangelogResult<Option<Record<K, V>>> {
        let state = self.state.read();
        if state.closed {
            return Ok(None);
        }
        state.oldest_record()
    }

    /// Returns the newest record of the log.
    pub fn newest_record(&self) -> Option<Record<K, V>> {
        let state = self.state.read();
        if state.closed {
            return None;
        }
        state.newest_record()
    }

    /// Counts the records of all files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn number_of_records(&self) -> ChangelogResult<u64> {
        let state = self.state.read();
        if state.closed {
            return Ok(0);
        }
        state
            .files
            .values()
            .try_fold(0, |count, file| Ok(count + file.number_of_records()?))
    }

    /// Returns the number of files, head included.
    pub fn number_of_files(&self) -> usize {
        self.state.read().files.len()
    }

    /// Returns the paths of the files, oldest first.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.state
            .read()
            .files
            .values()
            .map(|file| file.path().to_path_buf())
            .collect()
    }

    /// Changes the time interval after which the head is rotated.
    pub fn set_rotation_interval(&self, interval: Duration) {
        self.state.write().rotation.rotation_interval_millis = crate::config::duration_millis(interval);
    }

    /// Returns a cursor positioned before the oldest record.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn cursor(self: &Arc<Self>) -> ChangelogResult<LogCursor<K, V>> {
        self.cursor_from(None, CursorOptions::default())
    }

    /// Returns a cursor whose first record is the one with `key`, or an
    /// empty cursor if there is no such record.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn cursor_at(self: &Arc<Self>, key: &K) -> ChangelogResult<LogCursor<K, V>> {
        self.cursor_from(Some(key), CursorOptions::default())
    }

    /// Returns a cursor positioned on `key` with the given strategies.
    ///
    /// When nothing matches, an [`KeyMatchingStrategy::EqualToKey`] request
    /// returns an empty cursor, while the other strategies return a cursor
    /// positioned at the end of the log that will see future appends.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn cursor_from(
        self: &Arc<Self>,
        key: Option<&K>,
        options: CursorOptions,
    ) -> ChangelogResult<LogCursor<K, V>> {
        let state = self.state.read();
        if state.closed {
            return Ok(LogCursor::empty(Arc::clone(self)));
        }

        let file = state.find_log_file_for(key, options.matching)?;
        let mut cursor = file.cursor()?;
        if let Some(key) = key {
            if !cursor.position_to(key, options.matching, options.position)? {
                if options.matching == KeyMatchingStrategy::EqualToKey {
                    return Ok(LogCursor::empty(Arc::clone(self)));
                }
                cursor = state.head()?.cursor()?;
                cursor.position_to_end()?;
            }
        }
        Ok(self.register_cursor(cursor))
    }

    fn register_cursor(self: &Arc<Self>, cursor: LogFileCursor<K, V>) -> LogCursor<K, V> {
        let slot = Arc::new(Mutex::new(CursorSlot::Active(cursor)));
        let mut cursors = self.cursors.lock();
        let id = cursors.next_id;
        cursors.next_id += 1;
        cursors.slots.insert(id, Arc::clone(&slot));
        LogCursor::registered(Arc::clone(self), id, slot)
    }

    /// Deletes the read-only files whose keys are all lower than `key`.
    ///
    /// Purge works on whole files: records lower than `key` stored in the
    /// same file as greater records are kept. Cursors reading a deleted file
    /// are aborted. Returns the oldest record left, or `None` if nothing was
    /// purged.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::UndeletableFiles`] after trying every file
    /// if some could not be deleted.
    pub fn purge_up_to(&self, key: &K) -> ChangelogResult<Option<Record<K, V>>> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(None);
        }

        let purged: Vec<K> = state.files.range(..key).map(|(k, _)| k.clone()).collect();
        if purged.is_empty() {
            return Ok(None);
        }
        tracing::trace!(path = %self.path.display(), files = purged.len(), "purging log files");
        let mut undeletable = Vec::new();
        for highest in purged {
            let Some(file) = state.files.remove(&highest) else {
                continue;
            };
            self.abort_cursors_on(&file);
            file.close();
            if let Err(e) = file.delete() {
                tracing::warn!(path = %file.path().display(), error = %e, "unable to delete purged log file");
                undeletable.push(file.path().to_path_buf());
            }
        }
        if !undeletable.is_empty() {
            return Err(ChangelogError::UndeletableFiles {
                operation: "purge",
                paths: undeletable,
            });
        }
        state.oldest_record()
    }

    /// Deletes every record. Open cursors become empty.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::UndeletableFiles`] after trying every file
    /// if some could not be deleted, or an error if the new head cannot be
    /// created.
    pub fn clear(&self) -> ChangelogResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }

        {
            let cursors = self.cursors.lock();
            for slot in cursors.slots.values() {
                *slot.lock() = CursorSlot::Empty;
            }
        }

        let mut undeletable = Vec::new();
        for (_, file) in std::mem::take(&mut state.files) {
            file.close();
            if let Err(e) = file.delete() {
                tracing::warn!(path = %file.path().display(), error = %e, "unable to delete cleared log file");
                undeletable.push(file.path().to_path_buf());
            }
        }

        let head = LogFile::open_write_enabled(
            &self.path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&self.parser),
            self.recover_on_open,
        )?;
        state.last_appended_key = head.newest_record().map(|r| r.key().clone());
        state.files.insert(self.parser.max_key(), Arc::new(head));

        if !undeletable.is_empty() {
            return Err(ChangelogError::UndeletableFiles {
                operation: "clear",
                paths: undeletable,
            });
        }
        Ok(())
    }

    /// Returns the oldest key of the last file whose oldest record, mapped
    /// through `mapper`, is not above `limit`.
    ///
    /// Files are visited oldest first, so the key returned is a purge
    /// boundary deleting only files that start at or below `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn find_boundary_key_from_record<T: PartialOrd>(
        &self,
        mapper: impl Fn(&V) -> T,
        limit: &T,
    ) -> ChangelogResult<Option<K>> {
        let state = self.state.read();
        if state.closed {
            return Ok(None);
        }
        let mut boundary = None;
        for file in state.files.values() {
            let Some(oldest) = file.oldest_record()? else {
                break;
            };
            if mapper(oldest.value()) > *limit {
                break;
            }
            boundary = Some(oldest.key().clone());
        }
        Ok(boundary)
    }

    /// Dumps every file of the log into `dir`, one text file per log file.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or written.
    pub fn dump_as_text_file(&self, dir: &Path) -> ChangelogResult<()> {
        let state = self.state.read();
        fs::create_dir_all(dir).map_err(|e| ChangelogError::io("create directory", dir, e))?;
        for file in state.files.values() {
            let name = file
                .path()
                .file_name()
                .map(|n| format!("{}.txt", n.to_string_lossy()))
                .unwrap_or_else(|| "log.txt".to_string());
            file.dump_as_text_file(&dir.join(name))?;
        }
        Ok(())
    }

    /// Closes the log and all its files. Later operations are no-ops.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        let open_cursors = self.cursors.lock().slots.len();
        if open_cursors > 0 {
            tracing::error!(
                path = %self.path.display(),
                open_cursors,
                "closing log with cursors still open"
            );
        }
        for file in state.files.values() {
            file.close();
        }
        state.closed = true;
        tracing::debug!(path = %self.path.display(), "closed log");
    }
}

impl<K: LogKey, V: LogValue> std::fmt::Debug for Log<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").field("path", &self.path).finish_non_exhaustive()
    }
}

fn parse_key_bounds<K, V>(parser: &dyn RecordParser<K, V>, stem: &str) -> ChangelogResult<(K, K)> {
    let (lowest, highest) = stem.split_once(LOG_FILE_NAME_SEPARATOR).ok_or_else(|| {
        ChangelogError::invalid_format(format!("log file name '{stem}' has no key separator"))
    })?;
    Ok((
        parser.decode_key_from_string(lowest)?,
        parser.decode_key_from_string(highest)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{DbCursor, PositionStrategy, RepositionableCursor};
    use crate::parser::test_support::{record, StringParser};
    use crate::time::ManualTimeService;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Three 18-byte records per file.
    const THREE_RECORDS: u64 = 3 * 18 - 1;

    fn open(path: &Path, size_limit: u64) -> Arc<Log<u64, String>> {
        Log::open(
            path,
            Arc::new(StringParser),
            LogOptions::new(LogRotationParameters::new(size_limit, 0, 0)),
        )
        .unwrap()
    }

    fn append_all(log: &Log<u64, String>, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            log.append(&record(key)).unwrap();
        }
    }

    fn drain(cursor: &mut LogCursor<u64, String>) -> Vec<u64> {
        let mut keys = Vec::new();
        while cursor.next().unwrap() {
            keys.push(*cursor.record().unwrap().key());
        }
        keys
    }

    #[test]
    fn log_create_empty() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 1024);
        assert!(dir.path().join(HEAD_LOG_FILE_NAME).exists());
        assert_eq!(log.oldest_record().unwrap(), None);
        assert_eq!(log.newest_record(), None);
        assert_eq!(log.number_of_records().unwrap(), 0);
    }

    #[test]
    fn log_rotates_by_size() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=9);

        assert_eq!(log.number_of_files(), 3);
        assert!(dir.path().join("1_3.log").exists());
        assert!(dir.path().join("4_6.log").exists());
        assert_eq!(log.number_of_records().unwrap(), 9);
        assert_eq!(drain(&mut log.cursor().unwrap()), (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn log_rotates_by_time() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualTimeService::new(1_000));
        let log = Log::open(
            dir.path(),
            Arc::new(StringParser),
            LogOptions::new(LogRotationParameters::new(u64::MAX, 500, 1_000))
                .time_service(clock.clone()),
        )
        .unwrap();

        append_all(&log, 1..=2);
        clock.advance(501);
        append_all(&log, [3]);
        assert!(dir.path().join("1_2.log").exists());

        // the clock restarted at the rotation
        append_all(&log, [4]);
        assert_eq!(log.number_of_files(), 2);
    }

    #[test]
    fn log_never_rotates_empty_head() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualTimeService::new(0));
        let log = Log::open(
            dir.path(),
            Arc::new(StringParser),
            LogOptions::new(LogRotationParameters::new(1, 1, 0)).time_service(clock.clone()),
        )
        .unwrap();
        clock.advance(10);
        append_all(&log, [1]);
        assert_eq!(log.number_of_files(), 1);
    }

    #[test]
    fn log_ignores_out_of_order_append() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 1024);
        append_all(&log, [5, 3, 5, 6]);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![5, 6]);
    }

    #[test]
    fn log_reopen_restores_files() {
        let dir = tempdir().unwrap();
        {
            let log = open(dir.path(), THREE_RECORDS);
            append_all(&log, 1..=8);
            log.close();
        }
        let log = open(dir.path(), THREE_RECORDS);
        assert_eq!(log.oldest_record().unwrap(), Some(record(1)));
        assert_eq!(log.newest_record(), Some(record(8)));
        append_all(&log, [8, 9]);
        assert_eq!(drain(&mut log.cursor().unwrap()), (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn log_rejects_bad_file_name() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("garbage.log"), b"").unwrap();
        let err = Log::open(
            dir.path(),
            Arc::new(StringParser),
            LogOptions::new(LogRotationParameters::new(1024, 0, 0)),
        )
        .unwrap_err();
        assert!(matches!(err, ChangelogError::InvalidFormat { .. }));
    }

    #[test]
    fn cursor_at_key_in_any_file() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=10);

        assert_eq!(drain(&mut log.cursor_at(&5).unwrap()), (5..=10).collect::<Vec<_>>());
        assert_eq!(drain(&mut log.cursor_at(&10).unwrap()), vec![10]);
        assert!(drain(&mut log.cursor_at(&11).unwrap()).is_empty());
    }

    #[test]
    fn cursor_strategies_across_files() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, (1..=10).map(|k| k * 10));

        let after = CursorOptions::new(
            KeyMatchingStrategy::EqualToKey,
            PositionStrategy::AfterMatchingKey,
        );
        assert_eq!(drain(&mut log.cursor_from(Some(&30), after).unwrap()), (4..=10).map(|k| k * 10).collect::<Vec<_>>());

        let lte = CursorOptions::new(
            KeyMatchingStrategy::LessThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        );
        // 35 falls between the first file [10,30] and the second [40,60]
        assert_eq!(drain(&mut log.cursor_from(Some(&35), lte).unwrap())[0], 30);

        let gte = CursorOptions::new(
            KeyMatchingStrategy::GreaterThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        );
        assert_eq!(drain(&mut log.cursor_from(Some(&35), gte).unwrap())[0], 40);
    }

    #[test]
    fn failed_non_exact_cursor_sees_future_appends() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=5);

        let gte = CursorOptions::new(
            KeyMatchingStrategy::GreaterThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        );
        let mut cursor = log.cursor_from(Some(&100), gte).unwrap();
        assert!(!cursor.next().unwrap());
        append_all(&log, [100]);
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record(), Some(&record(100)));
    }

    #[test]
    fn cursor_survives_rotation() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=2);

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record(), Some(&record(1)));

        // rotates the head holding 1..=3 while the cursor reads it
        append_all(&log, 3..=7);
        assert!(dir.path().join("1_3.log").exists());
        assert_eq!(cursor.record(), Some(&record(1)));
        assert_eq!(drain(&mut cursor), (2..=7).collect::<Vec<_>>());
    }

    #[test]
    fn reader_follows_concurrent_writer_across_rotations() {
        const COUNT: u64 = 3000;
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 256);
        let writer = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || append_all(&log, 1..=COUNT))
        };

        let mut cursor = log.cursor().unwrap();
        let mut seen = Vec::new();
        loop {
            if cursor.next().unwrap() {
                seen.push(*cursor.record().unwrap().key());
            } else if writer.is_finished() {
                seen.extend(drain(&mut cursor));
                break;
            } else {
                std::thread::yield_now();
            }
        }
        writer.join().unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen, (1..=COUNT).collect::<Vec<_>>());
        assert!(fs::read_dir(dir.path()).unwrap().count() > 100);
    }

    #[test]
    fn concurrent_cursors_on_read_only_file() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), u64::MAX);
        append_all(&log, 1..=500);
        log.close();
        // a one byte limit rotates the full head on the next append
        let log = open(dir.path(), 1);
        append_all(&log, [501]);
        assert!(dir.path().join("1_500.log").exists());

        let readers: Vec<_> = (0..8u64)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    let start = i * 60 + 1;
                    let mut cursor = log.cursor_at(&start).unwrap();
                    (start, drain(&mut cursor))
                })
            })
            .collect();
        for reader in readers {
            let (start, keys) = reader.join().unwrap();
            assert_eq!(keys, (start..=501).collect::<Vec<_>>());
        }
    }

    #[test]
    fn exhausted_cursor_survives_rotation() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=3);
        let mut cursor = log.cursor().unwrap();
        assert_eq!(drain(&mut cursor), vec![1, 2, 3]);

        append_all(&log, 4..=5);
        assert_eq!(drain(&mut cursor), vec![4, 5]);
    }

    #[test]
    fn reposition_cursor() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=9);
        let mut cursor = log.cursor().unwrap();
        drain(&mut cursor);

        assert!(cursor
            .position_to(Some(&4), KeyMatchingStrategy::EqualToKey, PositionStrategy::OnMatchingKey)
            .unwrap());
        assert_eq!(drain(&mut cursor), (4..=9).collect::<Vec<_>>());

        assert!(cursor
            .position_to(None, KeyMatchingStrategy::EqualToKey, PositionStrategy::OnMatchingKey)
            .unwrap());
        assert_eq!(drain(&mut cursor).len(), 9);
    }

    #[test]
    fn purge_deletes_whole_files_below_key() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=10);

        let oldest = log.purge_up_to(&7).unwrap();
        assert_eq!(oldest, Some(record(7)));
        assert!(!dir.path().join("1_3.log").exists());
        assert!(!dir.path().join("4_6.log").exists());
        assert_eq!(drain(&mut log.cursor().unwrap()), (7..=10).collect::<Vec<_>>());

        // 8 shares a file with 7: nothing more to delete
        assert_eq!(log.purge_up_to(&8).unwrap(), None);
        assert_eq!(log.oldest_record().unwrap(), Some(record(7)));
    }

    #[test]
    fn purge_aborts_cursors_on_deleted_files() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=10);

        let mut on_purged = log.cursor().unwrap();
        assert!(on_purged.next().unwrap());
        let mut on_kept = log.cursor_at(&8).unwrap();

        log.purge_up_to(&7).unwrap();
        assert!(matches!(on_purged.next(), Err(ChangelogError::CursorAborted { .. })));
        assert_eq!(drain(&mut on_kept), vec![8, 9, 10]);
    }

    #[test]
    fn clear_empties_log_and_cursors() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=10);
        let mut cursor = log.cursor().unwrap();

        log.clear().unwrap();
        assert!(!cursor.next().unwrap());
        assert_eq!(log.number_of_files(), 1);
        assert_eq!(log.oldest_record().unwrap(), None);

        // keys restart from anything after a clear
        append_all(&log, [1]);
        assert_eq!(log.newest_record(), Some(record(1)));
    }

    #[test]
    fn closed_log_is_inert() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 1024);
        append_all(&log, 1..=3);
        let mut cursor = log.cursor().unwrap();
        drop(log.cursor().unwrap());
        log.close();

        append_all(&log, [4]);
        assert!(!cursor.next().unwrap());
        assert_eq!(log.oldest_record().unwrap(), None);
        assert_eq!(log.purge_up_to(&3).unwrap(), None);
        drop(cursor);
    }

    #[test]
    fn boundary_key_from_mapped_values() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), THREE_RECORDS);
        append_all(&log, 1..=10);

        let by_key = |value: &String| value.trim_start_matches("value").parse::<u64>().unwrap();
        assert_eq!(log.find_boundary_key_from_record(by_key, &0).unwrap(), None);
        assert_eq!(log.find_boundary_key_from_record(by_key, &5).unwrap(), Some(4));
        assert_eq!(log.find_boundary_key_from_record(by_key, &100).unwrap(), Some(10));
    }

    #[test]
    fn rotation_notifier_called() {
        struct Counter(AtomicUsize);
        impl LogRotationNotifier for Counter {
            fn log_file_rotated(&self, _: &Path, _: i64) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempdir().unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let log = Log::open(
            dir.path(),
            Arc::new(StringParser),
            LogOptions::new(LogRotationParameters::new(THREE_RECORDS, 0, 0))
                .rotation_notifier(counter.clone()),
        )
        .unwrap();
        append_all(&log, 1..=7);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dump_writes_one_file_per_log_file() {
        let dir = tempdir().unwrap();
        let log = open(&dir.path().join("log"), THREE_RECORDS);
        append_all(&log, 1..=5);
        let out = dir.path().join("dump");
        log.dump_as_text_file(&out).unwrap();
        assert!(out.join("1_3.log.txt").exists());
        assert!(out.join("head.log.txt").exists());
    }
}

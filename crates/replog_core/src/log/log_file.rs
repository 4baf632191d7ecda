//! A single log file: one writer, pooled readers and crash recovery.

use crate::block::{BlockReader, BlockWriter, Positioned};
use crate::cursor::{KeyMatchingStrategy, PositionStrategy};
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::{LogKey, LogValue, RecordParser};
use crate::record::Record;
use parking_lot::{Mutex, RwLock};
use replog_storage::FileBackend;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A log file storing records in increasing key order.
///
/// A write-enabled file (the head of a log) has a single writer. Any number
/// of readers are opened on demand and returned to a pool once their cursor
/// is dropped. Readers observe the appends of the writer since both go
/// through unbuffered handles on the same file.
///
/// Read-only files carry the lowest and highest keys they contain.
pub struct LogFile<K, V> {
    path: PathBuf,
    parser: Arc<dyn RecordParser<K, V>>,
    writer: Mutex<Option<BlockWriter<K, V>>>,
    readers: Mutex<Vec<BlockReader<K, V>>>,
    newest: RwLock<Option<Record<K, V>>>,
    bounds: Option<(K, K)>,
    // bytes past this size are an invalid tail left in place
    readable_size: Option<u64>,
    closed: AtomicBool,
}

impl<K: LogKey, V: LogValue> LogFile<K, V> {
    /// Opens or creates a write-enabled log file.
    ///
    /// A torn or undecodable record at the tail is cut off when `recover`
    /// is true. Otherwise the file is left untouched and opened without a
    /// writer: its complete records can be read but nothing can be appended.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn open_write_enabled(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        recover: bool,
    ) -> ChangelogResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        let mut reader = Self::open_reader(path, &parser, None)?;

        let (writer, readable_size) = match reader.check_log_is_valid()? {
            Some(valid_size) if !recover => {
                tracing::warn!(
                    path = %path.display(),
                    valid_size,
                    "log file has an invalid tail, opening it without writer"
                );
                reader = reader.with_readable_size(valid_size);
                (None, Some(valid_size))
            }
            invalid_tail => {
                let mut writer = BlockWriter::new(Box::new(backend), Arc::clone(&parser))?;
                if let Some(valid_size) = invalid_tail {
                    tracing::warn!(
                        path = %path.display(),
                        size = writer.bytes_written(),
                        valid_size,
                        "truncating corrupted tail of log file"
                    );
                    writer.truncate(valid_size)?;
                    writer.sync()?;
                }
                (Some(writer), None)
            }
        };
        let newest = reader.newest_record()?;

        Ok(Self {
            path: path.to_path_buf(),
            parser,
            writer: Mutex::new(writer),
            readers: Mutex::new(vec![reader]),
            newest: RwLock::new(newest),
            bounds: None,
            readable_size,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens an existing read-only log file holding keys `lowest..=highest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn open_read_only(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        lowest: K,
        highest: K,
    ) -> ChangelogResult<Self> {
        let mut reader = Self::open_reader(path, &parser, None)?;
        let newest = reader.newest_record()?;
        Ok(Self {
            path: path.to_path_buf(),
            parser,
            writer: Mutex::new(None),
            readers: Mutex::new(vec![reader]),
            newest: RwLock::new(newest),
            bounds: Some((lowest, highest)),
            readable_size: None,
            closed: AtomicBool::new(false),
        })
    }

    fn open_reader(
        path: &Path,
        parser: &Arc<dyn RecordParser<K, V>>,
        readable_size: Option<u64>,
    ) -> ChangelogResult<BlockReader<K, V>> {
        let reader = BlockReader::new(
            Box::new(FileBackend::open_read_only(path)?),
            Arc::clone(parser),
        );
        Ok(match readable_size {
            Some(size) => reader.with_readable_size(size),
            None => reader,
        })
    }

    /// Returns the path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if records can be appended to this file.
    ///
    /// False for read-only files, once closed, and for a head opened
    /// without recovery over an invalid tail.
    pub fn is_write_enabled(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Returns the lowest and highest keys of a read-only file.
    pub fn key_bounds(&self) -> Option<&(K, K)> {
        self.bounds.as_ref()
    }

    /// Appends a record.
    ///
    /// The caller guarantees that keys increase.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is read-only or closed, or if the write
    /// fails.
    pub fn append(&self, record: &Record<K, V>) -> ChangelogResult<()> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or_else(|| {
            ChangelogError::invalid_operation(format!(
                "log file {} is not write-enabled",
                self.path.display()
            ))
        })?;
        writer.append(record)?;
        *self.newest.write() = Some(record.clone());
        Ok(())
    }

    /// Syncs the appended records to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync_to_file_system(&self) -> ChangelogResult<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.sync()?;
        }
        Ok(())
    }

    /// Returns the size of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size_in_bytes(&self) -> ChangelogResult<u64> {
        if let Some(writer) = self.writer.lock().as_ref() {
            return Ok(writer.bytes_written());
        }
        self.with_reader(|reader| reader.file_size())
    }

    /// Returns the first record of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn oldest_record(&self) -> ChangelogResult<Option<Record<K, V>>> {
        self.with_reader(BlockReader::oldest_record)
    }

    /// Returns the last record of the file.
    pub fn newest_record(&self) -> Option<Record<K, V>> {
        self.newest.read().clone()
    }

    /// Counts the records of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn number_of_records(&self) -> ChangelogResult<u64> {
        self.with_reader(BlockReader::number_of_records)
    }

    /// Returns true if the file holds no record.
    pub fn is_empty(&self) -> bool {
        self.newest.read().is_none()
    }

    /// Returns a cursor positioned before the first record.
    ///
    /// # Errors
    ///
    /// Returns an error if a reader cannot be opened.
    pub fn cursor(self: &Arc<Self>) -> ChangelogResult<LogFileCursor<K, V>> {
        let reader = self.acquire_reader()?;
        Ok(LogFileCursor {
            file: Arc::clone(self),
            reader: Some(reader),
            current: None,
            pending: None,
        })
    }

    /// Returns a cursor restored to a state captured on another file
    /// holding the same records.
    ///
    /// # Errors
    ///
    /// Returns an error if a reader cannot be opened.
    pub fn cursor_from_state(
        self: &Arc<Self>,
        state: LogFileCursorState<K, V>,
    ) -> ChangelogResult<LogFileCursor<K, V>> {
        let mut reader = self.acquire_reader()?;
        reader.seek_to_position(state.position);
        Ok(LogFileCursor {
            file: Arc::clone(self),
            reader: Some(reader),
            current: state.current,
            pending: state.pending,
        })
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&mut BlockReader<K, V>) -> ChangelogResult<T>,
    ) -> ChangelogResult<T> {
        let mut reader = self.acquire_reader()?;
        let result = f(&mut reader);
        self.release_reader(reader);
        result
    }

    fn acquire_reader(&self) -> ChangelogResult<BlockReader<K, V>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChangelogError::invalid_operation(format!(
                "log file {} is closed",
                self.path.display()
            )));
        }
        match self.readers.lock().pop() {
            Some(mut reader) => {
                reader.seek_to_position(0);
                Ok(reader)
            }
            None => Self::open_reader(&self.path, &self.parser, self.readable_size),
        }
    }

    fn release_reader(&self, reader: BlockReader<K, V>) {
        if !self.closed.load(Ordering::Acquire) {
            self.readers.lock().push(reader);
        }
    }

    /// Closes the file: syncs and drops the writer and the pooled readers.
    ///
    /// Cursors still open keep their own reader until dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.sync() {
                tracing::error!(path = %self.path.display(), error = %e, "failed to sync log file on close");
            }
        }
        self.readers.lock().clear();
    }

    /// Deletes the file from disk. The file must be closed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is still open or cannot be deleted.
    pub fn delete(&self) -> ChangelogResult<()> {
        if !self.closed.load(Ordering::Acquire) {
            return Err(ChangelogError::invalid_operation(format!(
                "log file {} must be closed before being deleted",
                self.path.display()
            )));
        }
        fs::remove_file(&self.path).map_err(|e| ChangelogError::io("delete", &self.path, e))
    }

    /// Writes every record of the file to `out_path` in a readable form,
    /// one `key -> value` line per record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the dump written.
    pub fn dump_as_text_file(self: &Arc<Self>, out_path: &Path) -> ChangelogResult<()> {
        let mut text = String::new();
        let mut cursor = self.cursor()?;
        while cursor.next()? {
            if let Some(record) = cursor.record() {
                let _ = writeln!(
                    text,
                    "{} -> {:?}",
                    self.parser.encode_key_to_string(record.key()),
                    record.value()
                );
            }
        }
        fs::write(out_path, text).map_err(|e| ChangelogError::io("write", out_path, e))
    }
}

impl<K, V> std::fmt::Debug for LogFile<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("path", &self.path)
            .field("write_enabled", &self.bounds.is_none())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Position of a [`LogFileCursor`], detached from the file it reads.
///
/// Rotation captures it on the head file and restores it on the renamed
/// read-only file, which holds the same bytes.
#[derive(Debug, Clone)]
pub struct LogFileCursorState<K, V> {
    /// Position of the reader in the file.
    pub position: u64,
    /// Record returned by the last call to `next`.
    pub current: Option<Record<K, V>>,
    /// Record to return on the next call to `next`, set by positioning.
    pub pending: Option<Record<K, V>>,
}

/// A cursor over the records of one log file.
pub struct LogFileCursor<K: LogKey, V: LogValue> {
    file: Arc<LogFile<K, V>>,
    reader: Option<BlockReader<K, V>>,
    current: Option<Record<K, V>>,
    pending: Option<Record<K, V>>,
}

impl<K: LogKey, V: LogValue> LogFileCursor<K, V> {
    /// Returns the file this cursor reads.
    pub fn file(&self) -> &Arc<LogFile<K, V>> {
        &self.file
    }

    /// Returns the current record.
    pub fn record(&self) -> Option<&Record<K, V>> {
        self.current.as_ref()
    }

    fn reader(&mut self) -> ChangelogResult<&mut BlockReader<K, V>> {
        self.reader
            .as_mut()
            .ok_or_else(|| ChangelogError::invalid_operation("log file cursor has been closed"))
    }

    /// Moves to the next record of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be decoded.
    pub fn next(&mut self) -> ChangelogResult<bool> {
        if let Some(pending) = self.pending.take() {
            self.current = Some(pending);
            return Ok(true);
        }
        self.current = self.reader()?.read_record()?;
        Ok(self.current.is_some())
    }

    /// Positions the cursor on `key`. Returns `false` if nothing matches.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded.
    pub fn position_to(
        &mut self,
        key: &K,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<bool> {
        self.current = None;
        self.pending = None;
        match self.reader()?.seek_to_record(key, matching, position)? {
            Positioned::Found(pending) => {
                self.pending = pending;
                Ok(true)
            }
            Positioned::NotFound => Ok(false),
        }
    }

    /// Moves the cursor to the end of the file: only records appended from
    /// now on will be returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file size cannot be read.
    pub fn position_to_end(&mut self) -> ChangelogResult<()> {
        self.current = None;
        self.pending = None;
        self.reader()?.seek_to_end()
    }

    /// Captures the state of this cursor.
    pub fn state(&self) -> LogFileCursorState<K, V> {
        LogFileCursorState {
            position: self.reader.as_ref().map_or(0, BlockReader::position),
            current: self.current.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<K: LogKey, V: LogValue> Drop for LogFileCursor<K, V> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.file.release_reader(reader);
        }
    }
}

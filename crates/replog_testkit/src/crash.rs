//! Crash simulation for log files.
//!
//! A crash while appending leaves a torn record at the tail of the head
//! file. These helpers produce such tails, either by cutting a write short
//! through [`CrashableBackend`] or by damaging a file on disk, so that the
//! recovery performed when a log is opened can be checked.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replog_testkit::crash::{tear_file_tail, append_torn_record};
//!
//! append_torn_record(&log.path().join("head.log"), 100, 10).unwrap();
//! ```

use parking_lot::Mutex;
use replog_storage::{StorageBackend, StorageError, StorageResult};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Where a simulated crash interrupts an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Inside the length prefix of the record.
    InLengthPrefix,
    /// Inside the encoded record.
    InRecord,
    /// Right before the block offset the record would straddle.
    BeforeBlockOffset,
}

/// A storage backend wrapper that can simulate a crash in the middle of an
/// append: only the bytes before the crash threshold reach the inner
/// backend and every later write fails.
///
/// The crash state is shared by clones, so a test can keep a clone to arm
/// the crash after handing the backend to a writer.
#[derive(Clone)]
pub struct CrashableBackend {
    inner: Arc<Mutex<Box<dyn StorageBackend>>>,
    state: Arc<CrashState>,
}

struct CrashState {
    crash_at_size: AtomicU64,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            state: Arc::new(CrashState {
                crash_at_size: AtomicU64::new(u64::MAX),
                crashed: AtomicBool::new(false),
                fail_on_sync: AtomicBool::new(false),
            }),
        }
    }

    /// Crashes once the backend holds `size` bytes.
    pub fn crash_at_size(&self, size: u64) {
        self.state.crash_at_size.store(size, Ordering::SeqCst);
    }

    /// Sets whether sync fails.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.state.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    fn simulated(&self, what: &str) -> StorageError {
        self.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.lock().read_at(offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        if self.has_crashed() {
            return Err(self.simulated("write"));
        }
        let threshold = self.state.crash_at_size.load(Ordering::SeqCst);
        let mut backend = self.inner.lock();
        let current = backend.size()?;
        let end = current + bytes.len() as u64;
        if end > threshold {
            let partial = threshold.saturating_sub(current) as usize;
            if partial > 0 {
                backend.append(&bytes[..partial])?;
            }
            drop(backend);
            return Err(self.simulated("partial write"));
        }
        backend.append(bytes)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.lock().flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.lock().size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.state.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.simulated("sync"));
        }
        self.inner.lock().sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.lock().truncate(new_size)
    }
}

/// Returns the size at which an append of a frame of `frame_len` bytes
/// starting at `start` must crash to stop at `point`.
pub fn crash_size(start: u64, frame_len: u64, point: CrashPoint) -> u64 {
    match point {
        CrashPoint::InLengthPrefix => start + 2,
        CrashPoint::InRecord => start + frame_len / 2 + 2,
        CrashPoint::BeforeBlockOffset => {
            let block = replog_core::block::BLOCK_SIZE;
            (start / block + 1) * block
        }
    }
}

/// Removes the last `bytes` bytes of the file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or resized.
pub fn tear_file_tail(path: &Path, bytes: u64) -> io::Result<u64> {
    let file = OpenOptions::new().write(true).open(path)?;
    let size = file.metadata()?.len();
    let new_size = size.saturating_sub(bytes);
    file.set_len(new_size)?;
    file.sync_all()?;
    Ok(new_size)
}

/// Appends a record frame announcing `declared_len` bytes but holding only
/// `written` of them, as a crash in the middle of a write leaves it.
///
/// The frame is written raw: no block offset is inserted, so keep it within
/// the current block when the file must stay readable up to the frame.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn append_torn_record(path: &Path, declared_len: u32, written: usize) -> io::Result<()> {
    let mut frame = declared_len.to_be_bytes().to_vec();
    frame.extend(std::iter::repeat(0xA5).take(written));
    append_raw(path, &frame)
}

/// Appends raw bytes to the file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn append_raw(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Returns the size of the file at `path`.
///
/// # Errors
///
/// Returns an error if the file metadata cannot be read.
pub fn file_size(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_storage::InMemoryBackend;

    #[test]
    fn test_crashable_backend_normal_operation() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        let offset = backend.append(b"hello").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
        assert!(!backend.has_crashed());
    }

    #[test]
    fn test_crashable_backend_partial_write() {
        let memory = InMemoryBackend::new();
        let mut backend = CrashableBackend::new(Box::new(memory.handle()));
        backend.append(b"hello").unwrap();
        backend.crash_at_size(8);

        assert!(backend.append(b"world").is_err());
        assert!(backend.has_crashed());
        assert_eq!(memory.data(), b"hellowor");
        assert!(backend.append(b"!").is_err());
    }

    #[test]
    fn test_clones_share_crash_state() {
        let backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        let mut writer = backend.clone();
        backend.crash_at_size(0);
        assert!(writer.append(b"x").is_err());
        assert!(backend.has_crashed());
    }

    #[test]
    fn test_fail_on_sync() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        backend.set_fail_on_sync(true);
        assert!(backend.sync().is_err());
    }

    #[test]
    fn test_crash_size_before_block_offset() {
        assert_eq!(crash_size(10, 20, CrashPoint::BeforeBlockOffset), 256);
        assert_eq!(crash_size(300, 20, CrashPoint::BeforeBlockOffset), 512);
        assert_eq!(crash_size(10, 20, CrashPoint::InLengthPrefix), 12);
    }

    #[test]
    fn test_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(tear_file_tail(&path, 4).unwrap(), 6);
        append_torn_record(&path, 100, 3).unwrap();
        assert_eq!(file_size(&path).unwrap(), 6 + 4 + 3);
    }
}

//! Multi-file logs of key-ordered records.
//!
//! A [`Log`] is a directory holding one write-enabled *head* file,
//! `head.log`, and any number of read-only files named
//! `<lowest key>_<highest key>.log`. Records are appended to the head, which
//! is rotated into a read-only file once it grows too large or too old.
//!
//! ```text
//! changelog-dir/
//! ├── 0000000000000001_0000000000000fa0.log   (read-only)
//! ├── 0000000000000fa1_0000000000001f40.log   (read-only)
//! └── head.log                                (write-enabled)
//! ```
//!
//! # Concurrency
//!
//! Appends, rotation, purge, clear and close take the log's exclusive lock.
//! Cursor reads take the shared lock, so many cursors read concurrently but
//! never observe a rotation half done.

mod cursor;
mod log_file;
mod registry;
mod segmented;

pub use cursor::LogCursor;
pub use log_file::{LogFile, LogFileCursor, LogFileCursorState};
pub use registry::LogRegistry;
pub use segmented::Log;

use crate::config::LogRotationParameters;
use crate::time::{SystemTimeService, TimeService};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Name of the write-enabled file of a log.
pub const HEAD_LOG_FILE_NAME: &str = "head.log";

/// Extension shared by all log files.
pub const LOG_FILE_SUFFIX: &str = ".log";

/// Separates the lowest and highest keys in a read-only file name.
pub const LOG_FILE_NAME_SEPARATOR: char = '_';

/// Receives a notification each time the head file of a log is rotated.
pub trait LogRotationNotifier: Send + Sync {
    /// Called under the log's exclusive lock once the rotation is complete.
    fn log_file_rotated(&self, log_path: &Path, rotation_time: i64);
}

/// Options used to open a [`Log`].
#[derive(Clone)]
pub struct LogOptions {
    /// When the head file gets rotated.
    pub rotation: LogRotationParameters,
    /// Whether a torn head tail is truncated when opening.
    pub recover_on_open: bool,
    /// Clock used for time-based rotation.
    pub time_service: Arc<dyn TimeService>,
    /// Notified after each rotation.
    pub rotation_notifier: Option<Arc<dyn LogRotationNotifier>>,
}

impl LogOptions {
    /// Creates options with the system clock and recovery enabled.
    #[must_use]
    pub fn new(rotation: LogRotationParameters) -> Self {
        Self {
            rotation,
            recover_on_open: true,
            time_service: Arc::new(SystemTimeService),
            rotation_notifier: None,
        }
    }

    /// Sets whether a torn head tail is truncated when opening.
    #[must_use]
    pub fn recover_on_open(mut self, value: bool) -> Self {
        self.recover_on_open = value;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn time_service(mut self, time_service: Arc<dyn TimeService>) -> Self {
        self.time_service = time_service;
        self
    }

    /// Sets the rotation listener.
    #[must_use]
    pub fn rotation_notifier(mut self, notifier: Arc<dyn LogRotationNotifier>) -> Self {
        self.rotation_notifier = Some(notifier);
        self
    }
}

impl fmt::Debug for LogOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOptions")
            .field("rotation", &self.rotation)
            .field("recover_on_open", &self.recover_on_open)
            .field("time_service", &self.time_service)
            .field("rotation_notifier", &self.rotation_notifier.is_some())
            .finish()
    }
}

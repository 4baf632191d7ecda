//! Changelog configuration.

use crate::time::TimeService;
use std::time::Duration;

/// Configuration for a replication environment and the logs it opens.
#[derive(Debug, Clone)]
pub struct ChangelogConfig {
    /// Whether to create the root directory if it doesn't exist.
    pub create_if_missing: bool,

    /// A head log file is rotated once it has grown beyond this many bytes.
    ///
    /// The file can end up larger than the limit when the last record
    /// written is large.
    pub size_limit_per_file: u64,

    /// A head log file is rotated once this much time has passed since the
    /// previous rotation (zero = never).
    pub rotation_interval: Duration,

    /// Whether write-enabled log files truncate a torn tail when opened.
    ///
    /// Disable it to inspect a damaged log without modifying it.
    pub recover_on_open: bool,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            size_limit_per_file: 100 * 1024 * 1024, // 100 MB
            rotation_interval: Duration::ZERO,      // disabled
            recover_on_open: true,
        }
    }
}

impl ChangelogConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the root directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the size threshold for head file rotation.
    #[must_use]
    pub const fn size_limit_per_file(mut self, size: u64) -> Self {
        self.size_limit_per_file = size;
        self
    }

    /// Sets the time threshold for head file rotation.
    #[must_use]
    pub const fn rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// Sets whether torn tails are truncated when a log is opened.
    #[must_use]
    pub const fn recover_on_open(mut self, value: bool) -> Self {
        self.recover_on_open = value;
        self
    }

    /// Builds the rotation parameters of one log.
    #[must_use]
    pub fn rotation_parameters(&self, last_rotation_time: i64) -> LogRotationParameters {
        LogRotationParameters {
            size_limit_per_file: self.size_limit_per_file,
            rotation_interval_millis: duration_millis(self.rotation_interval),
            last_rotation_time,
        }
    }

    /// Builds rotation parameters using the current time as the last rotation.
    #[must_use]
    pub fn rotation_parameters_from_now(&self, time: &dyn TimeService) -> LogRotationParameters {
        self.rotation_parameters(time.now_millis())
    }
}

/// Parameters controlling when the head log file of one log is rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationParameters {
    /// Size limit before rotating the head file.
    pub size_limit_per_file: u64,
    /// Time interval before rotating the head file, zero disables it.
    pub rotation_interval_millis: i64,
    /// Last time, in milliseconds since the epoch, the head file was rotated.
    pub last_rotation_time: i64,
}

impl LogRotationParameters {
    /// Creates rotation parameters.
    #[must_use]
    pub const fn new(
        size_limit_per_file: u64,
        rotation_interval_millis: i64,
        last_rotation_time: i64,
    ) -> Self {
        Self {
            size_limit_per_file,
            rotation_interval_millis,
            last_rotation_time,
        }
    }
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

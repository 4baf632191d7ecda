//! Shares open logs between the components using them.

use super::{Log, LogOptions};
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::{LogKey, LogValue, RecordParser};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct RegisteredLog {
    log: Arc<dyn Any + Send + Sync>,
    close: Box<dyn Fn() + Send + Sync>,
    ref_count: usize,
}

/// Reference-counted set of open logs, keyed by directory.
///
/// Opening a log already open returns the same instance; the log is
/// physically closed when the last user releases it.
#[derive(Default)]
pub struct LogRegistry {
    logs: Mutex<HashMap<PathBuf, RegisteredLog>>,
}

impl LogRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the log stored in `path`, opening it if no one has.
    ///
    /// `parser` and `options` are only used when the log gets opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened, or if it is already
    /// open with different key or value types.
    pub fn open_log<K: LogKey, V: LogValue>(
        &self,
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        options: LogOptions,
    ) -> ChangelogResult<Arc<Log<K, V>>> {
        let mut logs = self.logs.lock();
        if let Some(registered) = logs.get_mut(path) {
            let log = Arc::clone(&registered.log)
                .downcast::<Log<K, V>>()
                .map_err(|_| {
                    ChangelogError::invalid_operation(format!(
                        "log {} is already open with other record types",
                        path.display()
                    ))
                })?;
            registered.ref_count += 1;
            return Ok(log);
        }

        let log = Log::open(path, parser, options)?;
        let closed = Arc::clone(&log);
        logs.insert(
            path.to_path_buf(),
            RegisteredLog {
                log: Arc::clone(&log) as Arc<dyn Any + Send + Sync>,
                close: Box::new(move || closed.close()),
                ref_count: 1,
            },
        );
        Ok(log)
    }

    /// Releases one reference to the log in `path`, closing it when no
    /// reference is left.
    pub fn release(&self, path: &Path) {
        let released = {
            let mut logs = self.logs.lock();
            match logs.get_mut(path) {
                Some(registered) if registered.ref_count > 1 => {
                    registered.ref_count -= 1;
                    None
                }
                Some(_) => logs.remove(path),
                None => {
                    tracing::debug!(path = %path.display(), "released a log that is not open");
                    None
                }
            }
        };
        if let Some(registered) = released {
            (registered.close)();
        }
    }

    /// Returns the number of references to the log in `path`.
    pub fn ref_count(&self, path: &Path) -> usize {
        self.logs.lock().get(path).map_or(0, |r| r.ref_count)
    }

    /// Closes every log regardless of references.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.logs.lock().drain().collect();
        for (_, registered) in drained {
            (registered.close)();
        }
    }

    /// Closes every log stored under `dir`, regardless of references.
    pub fn close_under(&self, dir: &Path) {
        let removed: Vec<_> = {
            let mut logs = self.logs.lock();
            let paths: Vec<PathBuf> = logs.keys().filter(|p| p.starts_with(dir)).cloned().collect();
            paths.into_iter().filter_map(|p| logs.remove(&p)).collect()
        };
        for registered in removed {
            (registered.close)();
        }
    }
}

impl std::fmt::Debug for LogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRegistry")
            .field("open_logs", &self.logs.lock().len())
            .finish()
    }
}

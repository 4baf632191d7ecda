//! Test fixtures and changelog helpers.
//!
//! Provides convenience functions for setting up temporary environments,
//! changelogs and logs, and for building update messages.

use replog_core::{
    ChangelogConfig, Csn, FileChangelogDb, Log, LogOptions, LogRotationParameters,
    ReplicationEnvironment, UpdateMsg, UpdateMsgParser,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Generation id used by the helpers publishing messages.
pub const TEST_GENERATION_ID: i64 = 1;

/// Size of the CSN and length prefix framing each update message.
pub const UPDATE_MSG_OVERHEAD: u64 = 4 + Csn::BYTE_SIZE as u64;

/// Builds a CSN.
pub fn csn(timestamp: u64, server_id: u16) -> Csn {
    Csn::new(timestamp, 0, server_id)
}

/// Builds an update message whose payload names its timestamp.
pub fn msg(timestamp: u64, server_id: u16) -> UpdateMsg {
    UpdateMsg::new(csn(timestamp, server_id), format!("change {timestamp}").into_bytes())
}

/// Builds an update message with an empty payload.
pub fn empty_msg(timestamp: u64, server_id: u16) -> UpdateMsg {
    UpdateMsg::new(csn(timestamp, server_id), Vec::new())
}

/// Returns a size limit rotating the head after `records` update messages of
/// `payload_len` bytes.
///
/// Only exact while the head stays within the first block, where no block
/// offset is inserted.
pub fn size_limit_for_records(records: u64, payload_len: u64) -> u64 {
    records * (UPDATE_MSG_OVERHEAD + payload_len) - 1
}

/// A replication environment in a temporary directory, removed on drop.
pub struct TestEnvironment {
    /// The environment instance.
    pub env: Arc<ReplicationEnvironment>,
    config: ChangelogConfig,
    temp_dir: TempDir,
}

impl TestEnvironment {
    /// Creates an environment with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ChangelogConfig::default())
    }

    /// Creates an environment with `config`.
    pub fn with_config(config: ChangelogConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let env = ReplicationEnvironment::open(temp_dir.path(), config.clone())
            .expect("Failed to open replication environment");
        Self {
            env,
            config,
            temp_dir,
        }
    }

    /// Creates an environment rotating head files after `records` messages
    /// with an empty payload.
    pub fn rotating_every(records: u64) -> Self {
        Self::with_config(ChangelogConfig::new().size_limit_per_file(size_limit_for_records(records, 0)))
    }

    /// Returns the root directory of the environment.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Returns the configuration the environment was opened with.
    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    /// Opens a changelog DB on the environment.
    pub fn changelog(&self) -> Arc<FileChangelogDb> {
        FileChangelogDb::open(Arc::clone(&self.env)).expect("Failed to open changelog")
    }

    /// Shuts the environment down and opens it again on the same directory.
    ///
    /// Every changelog and log opened on the environment must be dropped
    /// first, since they keep the directory locked.
    pub fn reopen(self) -> Self {
        let Self {
            env,
            config,
            temp_dir,
        } = self;
        env.shutdown();
        drop(env);
        let env = ReplicationEnvironment::open(temp_dir.path(), config.clone())
            .expect("Failed to reopen replication environment");
        Self {
            env,
            config,
            temp_dir,
        }
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestEnvironment {
    type Target = ReplicationEnvironment;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

/// A standalone log of update messages in a temporary directory.
pub struct TestLog {
    /// The log instance.
    pub log: Arc<Log<Csn, UpdateMsg>>,
    temp_dir: TempDir,
}

impl TestLog {
    /// Creates a log that never rotates.
    pub fn new() -> Self {
        Self::with_size_limit(u64::MAX)
    }

    /// Creates a log rotating its head once it exceeds `size_limit` bytes.
    pub fn with_size_limit(size_limit: u64) -> Self {
        Self::with_options(LogOptions::new(LogRotationParameters::new(size_limit, 0, 0)))
    }

    /// Creates a log with `options`.
    pub fn with_options(options: LogOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log = Self::open_log(temp_dir.path(), options);
        Self { log, temp_dir }
    }

    fn open_log(dir: &Path, options: LogOptions) -> Arc<Log<Csn, UpdateMsg>> {
        Log::<Csn, UpdateMsg>::open(&dir.join("log"), Arc::new(UpdateMsgParser), options)
            .expect("Failed to open log")
    }

    /// Returns the directory of the log.
    pub fn path(&self) -> &Path {
        self.log.path()
    }

    /// Closes the log and opens the files left on disk with `options`.
    pub fn reopen(self, options: LogOptions) -> Self {
        let Self { log, temp_dir } = self;
        log.close();
        drop(log);
        let log = Self::open_log(temp_dir.path(), options);
        Self { log, temp_dir }
    }

    /// Appends `msg` keyed by its CSN.
    pub fn append(&self, msg: &UpdateMsg) {
        self.log
            .append(&replog_core::Record::new(msg.csn(), msg.clone()))
            .expect("Failed to append to log");
    }
}

impl Default for TestLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestLog {
    type Target = Log<Csn, UpdateMsg>;

    fn deref(&self) -> &Self::Target {
        &self.log
    }
}

/// Runs a test with a changelog in a temporary directory.
///
/// # Example
///
/// ```rust,ignore
/// use replog_testkit::{msg, with_temp_changelog};
///
/// #[test]
/// fn my_test() {
///     with_temp_changelog(|changelog| {
///         changelog.publish_update_msg("dc=example,dc=com", 1, &msg(1_000, 1)).unwrap();
///     });
/// }
/// ```
pub fn with_temp_changelog<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<FileChangelogDb>) -> R,
{
    let env = TestEnvironment::new();
    let changelog = env.changelog();
    f(&changelog)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Publishes `per_replica` messages for every replica of every domain.
    ///
    /// Timestamps interleave the replicas: message `i` of replica `s` has
    /// timestamp `1000 + 100 * i + s`. Returns the messages in publication
    /// order with their base DN.
    pub fn populate(
        changelog: &FileChangelogDb,
        base_dns: &[&str],
        server_ids: &[u16],
        per_replica: u64,
    ) -> Vec<(String, UpdateMsg)> {
        let mut published = Vec::new();
        for i in 0..per_replica {
            for base_dn in base_dns {
                for server_id in server_ids {
                    let msg = msg(1_000 + 100 * i + u64::from(*server_id), *server_id);
                    changelog
                        .publish_update_msg(base_dn, TEST_GENERATION_ID, &msg)
                        .expect("Failed to publish update message");
                    published.push(((*base_dn).to_string(), msg));
                }
            }
        }
        published
    }

    /// Creates a changelog holding the messages of [`populate`].
    pub fn populated_changelog(
        base_dns: &[&str],
        server_ids: &[u16],
        per_replica: u64,
    ) -> (TestEnvironment, Arc<FileChangelogDb>, Vec<(String, UpdateMsg)>) {
        let env = TestEnvironment::new();
        let changelog = env.changelog();
        let published = populate(&changelog, base_dns, server_ids, per_replica);
        (env, changelog, published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_core::{CursorOptions, DbCursor, ServerState};

    #[test]
    fn test_environment_is_usable() {
        let env = TestEnvironment::new();
        assert!(env.path().exists());
        assert!(env.read_changelog_state().unwrap().is_empty());
    }

    #[test]
    fn test_with_temp_changelog() {
        let published = with_temp_changelog(|changelog| {
            changelog
                .publish_update_msg("dc=example,dc=com", TEST_GENERATION_ID, &msg(1_000, 1))
                .unwrap()
        });
        assert!(published);
    }

    #[test]
    fn test_reopen_keeps_content() {
        let env = TestEnvironment::new();
        {
            let changelog = env.changelog();
            changelog
                .publish_update_msg("dc=example,dc=com", TEST_GENERATION_ID, &msg(1_000, 1))
                .unwrap();
            changelog.shutdown();
        }
        let env = env.reopen();
        let state = env.read_changelog_state().unwrap();
        assert_eq!(
            state.domain_to_generation_id().get("dc=example,dc=com"),
            Some(&TEST_GENERATION_ID)
        );
    }

    #[test]
    fn test_populated_scenario() {
        let (_env, changelog, published) =
            scenarios::populated_changelog(&["dc=example,dc=com"], &[1, 2], 3);
        assert_eq!(published.len(), 6);

        let mut cursor = changelog
            .domain_cursor("dc=example,dc=com", &ServerState::new(), CursorOptions::after())
            .unwrap();
        let mut count = 0;
        while cursor.next().unwrap() {
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[test]
    fn test_log_rotates_at_size_limit() {
        let log = TestLog::with_size_limit(size_limit_for_records(2, 0));
        for t in 1..=5 {
            log.append(&empty_msg(t, 1));
        }
        assert_eq!(log.number_of_files(), 3);
        assert_eq!(log.number_of_records().unwrap(), 5);
    }
}

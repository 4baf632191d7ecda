//! Storage of the update messages of one replica of a domain.

use super::{ReplicaCursor, UpdateMsg};
use crate::csn::Csn;
use crate::cursor::CursorOptions;
use crate::environment::ReplicationEnvironment;
use crate::error::{ChangelogError, ChangelogResult};
use crate::log::Log;
use crate::record::Record;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Oldest and newest CSN stored by a replica DB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsnLimits {
    /// CSN of the oldest message, `None` if the DB is empty.
    pub oldest: Option<Csn>,
    /// CSN of the newest message, `None` if the DB is empty.
    pub newest: Option<Csn>,
}

/// The update messages sent by one replica for one domain.
///
/// Messages must be added in increasing CSN order; a message whose CSN is
/// not greater than the newest one is dropped by the log. The CSN limits
/// are kept in memory so that querying them never reads the log nor waits
/// for a writer.
pub struct FileReplicaDb {
    server_id: u16,
    base_dn: String,
    env: Arc<ReplicationEnvironment>,
    log: Arc<Log<Csn, UpdateMsg>>,
    limits: ArcSwap<CsnLimits>,
    shutdown: AtomicBool,
}

impl FileReplicaDb {
    /// Opens the DB of `server_id` for `base_dn`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened or read.
    pub fn open(
        server_id: u16,
        base_dn: &str,
        generation_id: i64,
        env: Arc<ReplicationEnvironment>,
    ) -> ChangelogResult<Self> {
        let log = env.get_or_create_replica_log(base_dn, server_id, generation_id)?;
        let limits = CsnLimits {
            oldest: log.oldest_record()?.map(|r| *r.key()),
            newest: log.newest_record().map(|r| *r.key()),
        };
        tracing::debug!(
            base_dn,
            server_id,
            oldest = ?limits.oldest,
            newest = ?limits.newest,
            "opened replica DB"
        );
        Ok(Self {
            server_id,
            base_dn: base_dn.to_string(),
            env,
            log,
            limits: ArcSwap::from_pointee(limits),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Returns the id of the replica.
    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Returns the base DN of the domain.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Adds a message.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Shutdown`] once the DB is shut down, or an
    /// error if the write fails.
    pub fn add(&self, msg: &UpdateMsg) -> ChangelogResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ChangelogError::Shutdown);
        }
        let csn = msg.csn();
        self.log.append(&Record::new(csn, msg.clone()))?;

        self.limits.rcu(|limits| {
            let mut limits = **limits;
            if limits.newest.map_or(true, |newest| csn > newest) {
                limits.newest = Some(csn);
                limits.oldest.get_or_insert(csn);
            }
            limits
        });
        Ok(())
    }

    /// Returns a cursor positioned on `start` with the given strategies, or
    /// before the oldest message if `start` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn cursor_from(
        &self,
        start: Option<&Csn>,
        options: CursorOptions,
    ) -> ChangelogResult<ReplicaCursor> {
        Ok(ReplicaCursor::new(
            self.log.cursor_from(start, options)?,
            self.server_id,
        ))
    }

    /// Deletes the messages older than `purge_csn`, whole files at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if some files could not be deleted.
    pub fn purge_up_to(&self, purge_csn: &Csn) -> ChangelogResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(oldest) = self.log.purge_up_to(purge_csn)? {
            let oldest = *oldest.key();
            self.limits.rcu(|limits| CsnLimits {
                oldest: Some(oldest),
                ..**limits
            });
        }
        Ok(())
    }

    /// Deletes every message.
    ///
    /// # Errors
    ///
    /// Returns an error if some files could not be deleted.
    pub fn clear(&self) -> ChangelogResult<()> {
        self.log.clear()?;
        self.limits.store(Arc::new(CsnLimits::default()));
        Ok(())
    }

    /// Makes the messages added so far durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn flush(&self) -> ChangelogResult<()> {
        self.log.sync_to_file_system()
    }

    /// Returns the CSN of the oldest message.
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.limits.load().oldest
    }

    /// Returns the CSN of the newest message.
    pub fn newest_csn(&self) -> Option<Csn> {
        self.limits.load().newest
    }

    /// Returns both CSN limits, read together.
    pub fn csn_limits(&self) -> CsnLimits {
        **self.limits.load()
    }

    /// Counts the messages stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn number_of_changes(&self) -> ChangelogResult<u64> {
        self.log.number_of_records()
    }

    /// Returns the log holding the messages.
    pub fn log(&self) -> &Arc<Log<Csn, UpdateMsg>> {
        &self.log
    }

    /// Releases the log. Later additions fail.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.env.close_log(&self.log);
    }

    /// Returns true once [`Self::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FileReplicaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReplicaDb")
            .field("base_dn", &self.base_dn)
            .field("server_id", &self.server_id)
            .field("limits", &self.csn_limits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangelogConfig;
    use crate::cursor::{DbCursor, KeyMatchingStrategy, PositionStrategy};
    use std::path::Path;
    use tempfile::tempdir;

    const DN: &str = "dc=example,dc=com";

    fn csn(t: u64) -> Csn {
        Csn::new(t, 0, 1)
    }

    fn msg(t: u64) -> UpdateMsg {
        UpdateMsg::new(csn(t), format!("change {t}").into_bytes())
    }

    fn env(root: &Path, size_limit: u64) -> Arc<ReplicationEnvironment> {
        ReplicationEnvironment::open(root, ChangelogConfig::default().size_limit_per_file(size_limit))
            .unwrap()
    }

    fn csns(cursor: &mut ReplicaCursor) -> Vec<u64> {
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push(cursor.csn().unwrap().timestamp());
        }
        seen
    }

    #[test]
    fn limits_follow_additions() {
        let temp = tempdir().unwrap();
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1024)).unwrap();
        assert_eq!(db.csn_limits(), CsnLimits::default());

        for t in 1..=3 {
            db.add(&msg(t)).unwrap();
        }
        db.add(&msg(2)).unwrap();
        assert_eq!(db.oldest_csn(), Some(csn(1)));
        assert_eq!(db.newest_csn(), Some(csn(3)));
        assert_eq!(db.number_of_changes().unwrap(), 3);
    }

    #[test]
    fn limits_read_while_adding() {
        let temp = tempdir().unwrap();
        let db = Arc::new(FileReplicaDb::open(1, DN, 0, env(temp.path(), 512)).unwrap());

        let writer = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                for t in 1..=500 {
                    db.add(&msg(t)).unwrap();
                }
            })
        };
        let mut last = 0;
        while !writer.is_finished() {
            let limits = db.csn_limits();
            if let Some(newest) = limits.newest {
                // both limits come from the same update
                assert_eq!(limits.oldest, Some(csn(1)));
                assert!(newest.timestamp() >= last);
                last = newest.timestamp();
            }
        }
        writer.join().unwrap();
        assert_eq!(db.newest_csn(), Some(csn(500)));
    }

    #[test]
    fn limits_restored_on_reopen() {
        let temp = tempdir().unwrap();
        {
            let env = env(temp.path(), 1024);
            let db = FileReplicaDb::open(1, DN, 0, Arc::clone(&env)).unwrap();
            for t in 5..=9 {
                db.add(&msg(t)).unwrap();
            }
            db.shutdown();
            env.shutdown();
        }
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1024)).unwrap();
        assert_eq!(db.oldest_csn(), Some(csn(5)));
        assert_eq!(db.newest_csn(), Some(csn(9)));
    }

    #[test]
    fn cursor_strategies() {
        let temp = tempdir().unwrap();
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1024)).unwrap();
        for t in [10, 20, 30, 40] {
            db.add(&msg(t)).unwrap();
        }

        let mut all = db.cursor_from(None, CursorOptions::default()).unwrap();
        assert_eq!(csns(&mut all), vec![10, 20, 30, 40]);

        let mut after = db.cursor_from(Some(&csn(20)), CursorOptions::after()).unwrap();
        assert_eq!(csns(&mut after), vec![30, 40]);

        let mut missing = db.cursor_from(Some(&csn(25)), CursorOptions::default()).unwrap();
        assert!(!missing.next().unwrap());

        let lte = CursorOptions::new(
            KeyMatchingStrategy::LessThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        );
        let mut floor = db.cursor_from(Some(&csn(25)), lte).unwrap();
        assert_eq!(csns(&mut floor), vec![20, 30, 40]);
    }

    #[test]
    fn exhausted_cursor_sees_new_messages() {
        let temp = tempdir().unwrap();
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1024)).unwrap();
        db.add(&msg(1)).unwrap();
        let mut cursor = db.cursor_from(None, CursorOptions::default()).unwrap();
        assert_eq!(csns(&mut cursor), vec![1]);
        db.add(&msg(2)).unwrap();
        assert_eq!(csns(&mut cursor), vec![2]);
    }

    #[test]
    fn purge_moves_oldest_csn() {
        let temp = tempdir().unwrap();
        // one message per file
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1)).unwrap();
        for t in 1..=10 {
            db.add(&msg(t)).unwrap();
        }
        db.purge_up_to(&csn(7)).unwrap();
        assert_eq!(db.oldest_csn(), Some(csn(7)));
        assert_eq!(db.newest_csn(), Some(csn(10)));
        let mut cursor = db.cursor_from(None, CursorOptions::default()).unwrap();
        assert_eq!(csns(&mut cursor), vec![7, 8, 9, 10]);
    }

    #[test]
    fn clear_resets_limits() {
        let temp = tempdir().unwrap();
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1024)).unwrap();
        db.add(&msg(1)).unwrap();
        db.clear().unwrap();
        assert_eq!(db.csn_limits(), CsnLimits::default());
        assert_eq!(db.number_of_changes().unwrap(), 0);
        db.add(&msg(1)).unwrap();
        assert_eq!(db.newest_csn(), Some(csn(1)));
    }

    #[test]
    fn add_after_shutdown_fails() {
        let temp = tempdir().unwrap();
        let db = FileReplicaDb::open(1, DN, 0, env(temp.path(), 1024)).unwrap();
        db.shutdown();
        assert!(db.log().is_closed());
        assert!(matches!(db.add(&msg(1)), Err(ChangelogError::Shutdown)));
    }
}

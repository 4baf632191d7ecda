//! The changelog: every replica DB of every domain plus the change number
//! index, stored in one replication environment.

use crate::change_number::FileChangeNumberIndexDb;
use crate::csn::{Csn, ServerState};
use crate::cursor::{
    CursorOptions, DomainCursor, DomainCursorSource, MultiDomainCursor, ReplicaAdditions,
    ReplicaCursorSource,
};
use crate::environment::{ChangelogState, ReplicationEnvironment};
use crate::error::{ChangelogError, ChangelogResult};
use crate::replica::{FileReplicaDb, ReplicaCursor, UpdateMsg};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type DomainDbs = BTreeMap<String, BTreeMap<u16, Arc<FileReplicaDb>>>;

/// Every replica DB of every domain, and the change number index.
///
/// Replica DBs found on disk are opened with the changelog. Domain cursors
/// created here are told about replicas added afterwards.
pub struct FileChangelogDb {
    this: Weak<FileChangelogDb>,
    env: Arc<ReplicationEnvironment>,
    domains: RwLock<DomainDbs>,
    cn_index: FileChangeNumberIndexDb,
    domain_cursors: Mutex<Vec<(String, Weak<ReplicaAdditions>)>>,
    shutdown: AtomicBool,
}

impl FileChangelogDb {
    /// Opens the changelog stored in `env`, with every replica DB it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout cannot be read or a log opened.
    pub fn open(env: Arc<ReplicationEnvironment>) -> ChangelogResult<Arc<Self>> {
        let state = env.read_changelog_state()?;
        let mut domains = DomainDbs::new();
        for (base_dn, server_ids) in state.domain_to_server_ids() {
            let generation_id = state
                .domain_to_generation_id()
                .get(base_dn)
                .copied()
                .unwrap_or_default();
            let dbs = domains.entry(base_dn.clone()).or_default();
            for server_id in server_ids {
                let db = FileReplicaDb::open(*server_id, base_dn, generation_id, Arc::clone(&env))?;
                dbs.insert(*server_id, Arc::new(db));
            }
        }
        let cn_index = FileChangeNumberIndexDb::open(Arc::clone(&env))?;
        tracing::debug!(
            root = %env.root().display(),
            domains = domains.len(),
            "opened changelog"
        );
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            env,
            domains: RwLock::new(domains),
            cn_index,
            domain_cursors: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }))
    }

    fn shared(&self) -> ChangelogResult<Arc<Self>> {
        self.this.upgrade().ok_or(ChangelogError::Shutdown)
    }

    /// Returns the environment.
    pub fn environment(&self) -> &Arc<ReplicationEnvironment> {
        &self.env
    }

    /// Reads the state stored on disk.
    ///
    /// # Errors
    ///
    /// See [`ReplicationEnvironment::read_changelog_state`].
    pub fn changelog_state(&self) -> ChangelogResult<ChangelogState> {
        self.env.read_changelog_state()
    }

    /// Returns the change number index.
    pub fn change_number_index_db(&self) -> &FileChangeNumberIndexDb {
        &self.cn_index
    }

    /// Returns the replica DB of `server_id` in `base_dn`, if it exists.
    pub fn replica_db(&self, base_dn: &str, server_id: u16) -> Option<Arc<FileReplicaDb>> {
        self.domains.read().get(base_dn)?.get(&server_id).cloned()
    }

    /// Returns the replicas of `base_dn`.
    pub fn domain_server_ids(&self, base_dn: &str) -> Vec<u16> {
        self.domains
            .read()
            .get(base_dn)
            .map(|dbs| dbs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the base DNs of the domains.
    pub fn domain_base_dns(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    /// Returns the replica DB of `server_id` in `base_dn`, creating it, and
    /// the domain, if needed. The boolean is true if the DB was created.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Shutdown`] after shutdown, or an error if
    /// the DB cannot be created.
    pub fn get_or_create_replica_db(
        &self,
        base_dn: &str,
        server_id: u16,
        generation_id: i64,
    ) -> ChangelogResult<(Arc<FileReplicaDb>, bool)> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ChangelogError::Shutdown);
        }
        if let Some(db) = self.replica_db(base_dn, server_id) {
            return Ok((db, false));
        }

        let mut domains = self.domains.write();
        let dbs = domains.entry(base_dn.to_string()).or_default();
        if let Some(db) = dbs.get(&server_id) {
            return Ok((Arc::clone(db), false));
        }
        let db = Arc::new(FileReplicaDb::open(
            server_id,
            base_dn,
            generation_id,
            Arc::clone(&self.env),
        )?);
        dbs.insert(server_id, Arc::clone(&db));
        tracing::debug!(base_dn, server_id, "created replica DB");

        // under the domains lock, so a domain cursor sees the replica once
        self.domain_cursors
            .lock()
            .retain(|(dn, additions)| match additions.upgrade() {
                Some(additions) => {
                    if dn == base_dn {
                        additions.lock().entry(server_id).or_insert(None);
                    }
                    true
                }
                None => false,
            });
        Ok((db, true))
    }

    /// Stores a message sent by the replica that produced its CSN, creating
    /// the replica DB if needed. Returns true if the DB was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the DB cannot be created or the write fails.
    pub fn publish_update_msg(
        &self,
        base_dn: &str,
        generation_id: i64,
        msg: &UpdateMsg,
    ) -> ChangelogResult<bool> {
        let (db, created) =
            self.get_or_create_replica_db(base_dn, msg.csn().server_id(), generation_id)?;
        db.add(msg)?;
        Ok(created)
    }

    /// Returns the oldest CSN of each replica of `base_dn`.
    pub fn domain_oldest_csns(&self, base_dn: &str) -> ServerState {
        self.domain_csns(base_dn, FileReplicaDb::oldest_csn)
    }

    /// Returns the newest CSN of each replica of `base_dn`.
    pub fn domain_newest_csns(&self, base_dn: &str) -> ServerState {
        self.domain_csns(base_dn, FileReplicaDb::newest_csn)
    }

    fn domain_csns(&self, base_dn: &str, limit: fn(&FileReplicaDb) -> Option<Csn>) -> ServerState {
        self.domains
            .read()
            .get(base_dn)
            .map(|dbs| dbs.values().filter_map(|db| limit(db)).collect())
            .unwrap_or_default()
    }

    /// Returns a cursor merging every replica of `base_dn`, each positioned
    /// after its CSN in `start_state`, or before its oldest message.
    /// Replicas created later are merged too.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is unknown.
    pub fn domain_cursor(
        &self,
        base_dn: &str,
        start_state: &ServerState,
        options: CursorOptions,
    ) -> ChangelogResult<DomainCursor> {
        let domains = self.domains.read();
        let dbs = domains.get(base_dn).ok_or_else(|| {
            ChangelogError::invalid_operation(format!("unknown replication domain '{base_dn}'"))
        })?;
        let source: Arc<dyn ReplicaCursorSource> = self.shared()?;
        let cursor =
            DomainCursor::with_replicas(base_dn, source, options, dbs.keys().copied(), start_state);
        self.domain_cursors
            .lock()
            .push((base_dn.to_string(), cursor.additions()));
        Ok(cursor)
    }

    /// Returns a cursor merging every domain of `start_states`, each from
    /// its server state.
    ///
    /// # Errors
    ///
    /// Returns an error if a domain is unknown.
    pub fn multi_domain_cursor(
        &self,
        start_states: &BTreeMap<String, ServerState>,
        options: CursorOptions,
    ) -> ChangelogResult<MultiDomainCursor> {
        let source: Arc<dyn DomainCursorSource> = self.shared()?;
        let mut cursor = MultiDomainCursor::new(source, options);
        for (base_dn, start_state) in start_states {
            cursor.add_domain(base_dn, start_state)?;
        }
        Ok(cursor)
    }

    /// Deletes, from every replica DB and the change number index, the
    /// files holding only changes older than `purge_csn`.
    ///
    /// Every DB is purged even if one fails; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if some files could not be deleted.
    pub fn purge_up_to(&self, purge_csn: &Csn) -> ChangelogResult<()> {
        let dbs: Vec<Arc<FileReplicaDb>> = self
            .domains
            .read()
            .values()
            .flat_map(|dbs| dbs.values().cloned())
            .collect();
        let mut first_error = None;
        for db in dbs {
            if let Err(e) = db.purge_up_to(purge_csn) {
                tracing::warn!(
                    base_dn = db.base_dn(),
                    server_id = db.server_id(),
                    error = %e,
                    "unable to purge replica DB"
                );
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.cn_index.purge_up_to(purge_csn) {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shuts down the DBs of `base_dn` and deletes the domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be deleted.
    pub fn remove_domain(&self, base_dn: &str) -> ChangelogResult<()> {
        let removed = self.domains.write().remove(base_dn);
        for db in removed.into_iter().flat_map(BTreeMap::into_values) {
            db.shutdown();
        }
        self.env.clear_domain(base_dn)
    }

    /// Deletes every message of every replica and every index record.
    ///
    /// # Errors
    ///
    /// Returns an error if some files could not be deleted.
    pub fn clear(&self) -> ChangelogResult<()> {
        for dbs in self.domains.read().values() {
            for db in dbs.values() {
                db.clear()?;
            }
        }
        self.cn_index.clear()
    }

    /// Replaces the generation id of `base_dn`.
    ///
    /// # Errors
    ///
    /// See [`ReplicationEnvironment::reset_generation_id`].
    pub fn reset_generation_id(&self, base_dn: &str, generation_id: i64) -> ChangelogResult<()> {
        self.env.reset_generation_id(base_dn, generation_id)
    }

    /// Records that a replica went offline at `offline_csn`.
    ///
    /// # Errors
    ///
    /// See [`ReplicationEnvironment::notify_replica_offline`].
    pub fn replica_offline(&self, base_dn: &str, offline_csn: Csn) -> ChangelogResult<()> {
        self.env.notify_replica_offline(base_dn, offline_csn)
    }

    /// Records that a replica is back online.
    ///
    /// # Errors
    ///
    /// See [`ReplicationEnvironment::notify_replica_online`].
    pub fn replica_online(&self, base_dn: &str, server_id: u16) -> ChangelogResult<()> {
        self.env.notify_replica_online(base_dn, server_id)
    }

    /// Shuts down every DB and the environment.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for dbs in self.domains.read().values() {
            for db in dbs.values() {
                db.shutdown();
            }
        }
        self.cn_index.shutdown();
        self.env.shutdown();
    }
}

impl ReplicaCursorSource for FileChangelogDb {
    fn replica_cursor(
        &self,
        base_dn: &str,
        server_id: u16,
        start: Option<&Csn>,
        options: CursorOptions,
    ) -> ChangelogResult<ReplicaCursor> {
        let db = self.replica_db(base_dn, server_id).ok_or_else(|| {
            ChangelogError::invalid_operation(format!(
                "unknown replica {server_id} of domain '{base_dn}'"
            ))
        })?;
        db.cursor_from(start, options)
    }
}

impl DomainCursorSource for FileChangelogDb {
    fn domain_cursor(
        &self,
        base_dn: &str,
        start_state: &ServerState,
        options: CursorOptions,
    ) -> ChangelogResult<DomainCursor> {
        FileChangelogDb::domain_cursor(self, base_dn, start_state, options)
    }
}

impl std::fmt::Debug for FileChangelogDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangelogDb")
            .field("env", &self.env)
            .field("domains", &self.domain_base_dns())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangelogConfig;
    use crate::cursor::DbCursor;
    use std::path::Path;
    use tempfile::tempdir;

    const DN: &str = "dc=example,dc=com";

    fn open(root: &Path) -> Arc<FileChangelogDb> {
        let env = ReplicationEnvironment::open(root, ChangelogConfig::default()).unwrap();
        FileChangelogDb::open(env).unwrap()
    }

    fn msg(t: u64, server_id: u16) -> UpdateMsg {
        UpdateMsg::new(Csn::new(t, 0, server_id), format!("{t}@{server_id}").into_bytes())
    }

    fn drain(cursor: &mut impl DbCursor<Item = UpdateMsg>) -> Vec<(u64, u16)> {
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            let csn = cursor.record().unwrap().csn();
            seen.push((csn.timestamp(), csn.server_id()));
        }
        seen
    }

    #[test]
    fn publish_creates_replica_dbs() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        assert!(db.publish_update_msg(DN, 7, &msg(1, 1)).unwrap());
        assert!(!db.publish_update_msg(DN, 7, &msg(2, 1)).unwrap());
        assert!(db.publish_update_msg(DN, 7, &msg(3, 2)).unwrap());

        assert_eq!(db.domain_server_ids(DN), vec![1, 2]);
        assert_eq!(db.domain_base_dns(), vec![DN.to_string()]);
        let newest = db.domain_newest_csns(DN);
        assert_eq!(newest.csn(1), Some(&Csn::new(2, 0, 1)));
        assert_eq!(newest.csn(2), Some(&Csn::new(3, 0, 2)));
        assert_eq!(db.domain_oldest_csns(DN).csn(1), Some(&Csn::new(1, 0, 1)));
        assert_eq!(db.changelog_state().unwrap().domain_to_generation_id()[DN], 7);
    }

    #[test]
    fn replica_dbs_reopened() {
        let temp = tempdir().unwrap();
        {
            let db = open(temp.path());
            db.publish_update_msg(DN, 1, &msg(1, 1)).unwrap();
            db.publish_update_msg("dc=other", 1, &msg(2, 4)).unwrap();
            db.shutdown();
        }
        let db = open(temp.path());
        assert_eq!(db.domain_server_ids(DN), vec![1]);
        assert_eq!(db.domain_server_ids("dc=other"), vec![4]);
        assert_eq!(
            db.replica_db("dc=other", 4).unwrap().newest_csn(),
            Some(Csn::new(2, 0, 4))
        );
    }

    #[test]
    fn domain_cursor_sees_new_replicas() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        db.publish_update_msg(DN, 1, &msg(1, 1)).unwrap();
        db.publish_update_msg(DN, 1, &msg(4, 1)).unwrap();

        let mut cursor = db
            .domain_cursor(DN, &ServerState::new(), CursorOptions::after())
            .unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record().unwrap().csn(), Csn::new(1, 0, 1));

        db.publish_update_msg(DN, 1, &msg(2, 2)).unwrap();
        assert_eq!(drain(&mut cursor), vec![(2, 2), (4, 1)]);
    }

    #[test]
    fn multi_domain_cursor_merges_domains() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        db.publish_update_msg("dc=a", 1, &msg(1, 1)).unwrap();
        db.publish_update_msg("dc=b", 1, &msg(2, 2)).unwrap();
        db.publish_update_msg("dc=a", 1, &msg(3, 1)).unwrap();

        let start: BTreeMap<String, ServerState> = ["dc=a", "dc=b"]
            .into_iter()
            .map(|dn| (dn.to_string(), ServerState::new()))
            .collect();
        let mut cursor = db.multi_domain_cursor(&start, CursorOptions::after()).unwrap();
        assert_eq!(drain(&mut cursor), vec![(1, 1), (2, 2), (3, 1)]);

        let unknown: BTreeMap<String, ServerState> =
            [("dc=missing".to_string(), ServerState::new())].into_iter().collect();
        assert!(db.multi_domain_cursor(&unknown, CursorOptions::after()).is_err());
    }

    #[test]
    fn change_numbers_follow_publication() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        let index = db.change_number_index_db();
        for t in 1..=3 {
            let msg = msg(t, 1);
            db.publish_update_msg(DN, 1, &msg).unwrap();
            assert_eq!(index.add_record(DN, msg.csn()).unwrap(), t);
        }
        assert_eq!(index.newest_record().unwrap().csn(), Csn::new(3, 0, 1));
    }

    #[test]
    fn remove_domain_deletes_its_dbs() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        db.publish_update_msg(DN, 1, &msg(1, 1)).unwrap();
        let replica = db.replica_db(DN, 1).unwrap();

        db.remove_domain(DN).unwrap();
        assert!(replica.is_shutdown());
        assert!(db.replica_db(DN, 1).is_none());
        assert!(db.changelog_state().unwrap().is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        db.publish_update_msg(DN, 1, &msg(1, 1)).unwrap();
        db.change_number_index_db().add_record(DN, Csn::new(1, 0, 1)).unwrap();
        db.clear().unwrap();
        assert_eq!(db.replica_db(DN, 1).unwrap().number_of_changes().unwrap(), 0);
        assert!(db.change_number_index_db().is_empty());
    }

    #[test]
    fn offline_replica_recorded() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        db.publish_update_msg(DN, 1, &msg(1, 1)).unwrap();
        db.replica_offline(DN, Csn::new(5, 0, 1)).unwrap();
        let state = db.changelog_state().unwrap();
        assert_eq!(state.offline_replicas()[DN].csn(1), Some(&Csn::new(5, 0, 1)));
        db.replica_online(DN, 1).unwrap();
        assert!(db.changelog_state().unwrap().offline_replicas().is_empty());
    }

    #[test]
    fn shutdown_refuses_new_replicas() {
        let temp = tempdir().unwrap();
        let db = open(temp.path());
        db.publish_update_msg(DN, 1, &msg(1, 1)).unwrap();
        db.shutdown();
        assert!(db.environment().is_shutdown());
        assert!(matches!(
            db.publish_update_msg(DN, 1, &msg(2, 2)),
            Err(ChangelogError::Shutdown)
        ));
        assert!(matches!(
            db.publish_update_msg(DN, 1, &msg(2, 1)),
            Err(ChangelogError::Shutdown)
        ));
    }
}

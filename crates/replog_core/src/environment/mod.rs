//! On-disk layout of a changelog and the logs opened in it.
//!
//! ```text
//! <root>/
//! ├─ LOCK                      # advisory lock, single process
//! ├─ domains.state             # one "id:dn" line per domain
//! ├─ 1.domain/
//! │  ├─ generation<id>.id      # generation id of the domain
//! │  ├─ 12.server/             # log of replica 12
//! │  │  ├─ head.log
//! │  │  ├─ <csn>_<csn>.log
//! │  │  └─ offline.state       # present while the replica is offline
//! │  └─ 27.server/
//! └─ changenumberindex/
//!    ├─ head.log
//!    ├─ <cn>_<cn>.log
//!    └─ rotationtime<ms>.ms    # last rotation of the index
//! ```
//!
//! State files are replaced through a temporary file renamed over the old
//! one, so a crash never leaves a partially written state file.

mod domains;
mod markers;
mod state;

pub use domains::DomainIds;
pub use markers::REPLICA_OFFLINE_STATE_FILENAME;
pub use state::ChangelogState;

use crate::change_number::{ChangeNumberIndexRecord, ChangeNumberIndexRecordParser};
use crate::config::{ChangelogConfig, LogRotationParameters};
use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};
use crate::log::{Log, LogOptions, LogRegistry, LogRotationNotifier};
use crate::parser::{LogKey, LogValue};
use crate::replica::{UpdateMsg, UpdateMsgParser};
use crate::time::{SystemTimeService, TimeService};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// File mapping base DNs to domain ids.
pub const DOMAINS_STATE_FILENAME: &str = "domains.state";
/// Extension of domain directories.
pub const DOMAIN_SUFFIX: &str = ".domain";
/// Extension of replica directories.
pub const SERVER_ID_SUFFIX: &str = ".server";
/// Directory of the change number index log.
pub const CN_INDEX_DB_DIRNAME: &str = "changenumberindex";
const LOCK_FILE: &str = "LOCK";

/// Owns the directory of a changelog and opens the logs stored in it.
///
/// Every log is opened through the environment's [`LogRegistry`], so that
/// components asking for the same log share it and [`Self::shutdown`] can
/// close them all. After shutdown, opening a log fails with
/// [`ChangelogError::Shutdown`].
pub struct ReplicationEnvironment {
    root: PathBuf,
    config: ChangelogConfig,
    time_service: Arc<dyn TimeService>,
    registry: LogRegistry,
    domains: Mutex<DomainIds>,
    shutdown: AtomicBool,
    _lock_file: File,
}

impl ReplicationEnvironment {
    /// Opens the changelog stored in `root` using the system clock.
    ///
    /// # Errors
    ///
    /// See [`Self::open_with_time_service`].
    pub fn open(root: &Path, config: ChangelogConfig) -> ChangelogResult<Arc<Self>> {
        Self::open_with_time_service(root, config, Arc::new(SystemTimeService))
    }

    /// Opens the changelog stored in `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock
    /// - The domains state file is malformed
    /// - I/O errors occur
    pub fn open_with_time_service(
        root: &Path,
        config: ChangelogConfig,
        time_service: Arc<dyn TimeService>,
    ) -> ChangelogResult<Arc<Self>> {
        if !root.exists() {
            if config.create_if_missing {
                fs::create_dir_all(root)
                    .map_err(|e| ChangelogError::io("create directory", root, e))?;
            } else {
                return Err(ChangelogError::invalid_format(format!(
                    "changelog directory does not exist: {}",
                    root.display()
                )));
            }
        }
        if !root.is_dir() {
            return Err(ChangelogError::invalid_format(format!(
                "path is not a directory: {}",
                root.display()
            )));
        }

        let lock_path = root.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| ChangelogError::io("open", &lock_path, e))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(ChangelogError::EnvironmentLocked {
                path: root.to_path_buf(),
            });
        }

        let domains_path = root.join(DOMAINS_STATE_FILENAME);
        let domains = match fs::read_to_string(&domains_path) {
            Ok(text) => DomainIds::decode(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DomainIds::new(),
            Err(e) => return Err(ChangelogError::io("read", &domains_path, e)),
        };

        tracing::debug!(
            root = %root.display(),
            domains = domains.len(),
            "opened replication environment"
        );

        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            config,
            time_service,
            registry: LogRegistry::new(),
            domains: Mutex::new(domains),
            shutdown: AtomicBool::new(false),
            _lock_file: lock_file,
        }))
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    /// Returns the clock.
    pub fn time_service(&self) -> &Arc<dyn TimeService> {
        &self.time_service
    }

    /// Returns the registry of open logs.
    pub fn registry(&self) -> &LogRegistry {
        &self.registry
    }

    /// Returns true once [`Self::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> ChangelogResult<()> {
        if self.is_shutdown() {
            return Err(ChangelogError::Shutdown);
        }
        Ok(())
    }

    fn domain_dir(&self, domain_id: u64) -> PathBuf {
        self.root.join(format!("{domain_id}{DOMAIN_SUFFIX}"))
    }

    fn server_dir(domain_dir: &Path, server_id: u16) -> PathBuf {
        domain_dir.join(format!("{server_id}{SERVER_ID_SUFFIX}"))
    }

    /// Returns the directory of the log of a replica, if its domain is known.
    pub fn replica_log_path(&self, base_dn: &str, server_id: u16) -> Option<PathBuf> {
        let domain_id = self.domains.lock().get(base_dn)?;
        Some(Self::server_dir(&self.domain_dir(domain_id), server_id))
    }

    /// Returns the directory of the change number index log.
    pub fn cn_index_log_path(&self) -> PathBuf {
        self.root.join(CN_INDEX_DB_DIRNAME)
    }

    fn domain_dir_of(&self, domains: &DomainIds, base_dn: &str) -> ChangelogResult<PathBuf> {
        domains
            .get(base_dn)
            .map(|id| self.domain_dir(id))
            .ok_or_else(|| {
                ChangelogError::invalid_operation(format!("unknown replication domain '{base_dn}'"))
            })
    }

    /// Reads the domains, generation ids, replicas and offline replicas
    /// stored on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read, a domain has no
    /// generation id, or a marker file is malformed.
    pub fn read_changelog_state(&self) -> ChangelogResult<ChangelogState> {
        let domains = self.domains.lock();
        let mut state = ChangelogState::new();
        for (base_dn, domain_id) in domains.iter() {
            let domain_dir = self.domain_dir(domain_id);
            if !domain_dir.is_dir() {
                tracing::warn!(base_dn, dir = %domain_dir.display(), "domain directory is missing");
                continue;
            }
            let generation_id = markers::read_generation_id(&domain_dir)?.ok_or_else(|| {
                ChangelogError::invalid_format(format!(
                    "no generation id found for domain '{base_dn}' in {}",
                    domain_dir.display()
                ))
            })?;
            state.set_domain_generation_id(base_dn, generation_id);

            let entries = fs::read_dir(&domain_dir)
                .map_err(|e| ChangelogError::io("list", &domain_dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| ChangelogError::io("list", &domain_dir, e))?;
                let name = entry.file_name();
                let Some(server_id) = name.to_str().and_then(|n| n.strip_suffix(SERVER_ID_SUFFIX))
                else {
                    continue;
                };
                let server_id: u16 = server_id.parse().map_err(|_| {
                    ChangelogError::invalid_format(format!(
                        "invalid replica directory {}",
                        entry.path().display()
                    ))
                })?;
                state.add_server_id_to_domain(server_id, base_dn);
                if let Some(offline_csn) = markers::read_offline_csn(&entry.path())? {
                    state.add_offline_replica(base_dn, offline_csn);
                }
            }
        }
        Ok(state)
    }

    /// Returns the generation id recorded for a domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be read.
    pub fn generation_id(&self, base_dn: &str) -> ChangelogResult<Option<i64>> {
        let domains = self.domains.lock();
        match domains.get(base_dn) {
            Some(id) => markers::read_generation_id(&self.domain_dir(id)),
            None => Ok(None),
        }
    }

    /// Allocates an id to the domain if needed and makes sure its directory
    /// and generation id marker exist. Returns the domain directory.
    fn ensure_domain(
        &self,
        domains: &mut DomainIds,
        base_dn: &str,
        generation_id: i64,
    ) -> ChangelogResult<PathBuf> {
        let domain_id = match domains.get(base_dn) {
            Some(id) => id,
            None => {
                let mut updated = domains.clone();
                let (id, _) = updated.get_or_allocate(base_dn);
                markers::write_atomically(
                    &self.root.join(DOMAINS_STATE_FILENAME),
                    updated.encode().as_bytes(),
                )?;
                *domains = updated;
                tracing::debug!(base_dn, domain_id = id, "allocated replication domain id");
                id
            }
        };

        let domain_dir = self.domain_dir(domain_id);
        fs::create_dir_all(&domain_dir)
            .map_err(|e| ChangelogError::io("create directory", &domain_dir, e))?;
        if markers::read_generation_id(&domain_dir)?.is_none() {
            markers::write_generation_id(&domain_dir, generation_id)?;
        }
        Ok(domain_dir)
    }

    /// Returns the log of a replica, creating the domain and replica
    /// directories as needed.
    ///
    /// `generation_id` is only recorded when the domain has none.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Shutdown`] after shutdown, or an error if
    /// the layout cannot be written or the log opened.
    pub fn get_or_create_replica_log(
        &self,
        base_dn: &str,
        server_id: u16,
        generation_id: i64,
    ) -> ChangelogResult<Arc<Log<Csn, UpdateMsg>>> {
        self.ensure_running()?;
        let mut domains = self.domains.lock();
        let domain_dir = self.ensure_domain(&mut domains, base_dn, generation_id)?;
        let server_dir = Self::server_dir(&domain_dir, server_id);
        fs::create_dir_all(&server_dir)
            .map_err(|e| ChangelogError::io("create directory", &server_dir, e))?;

        let options = LogOptions::new(LogRotationParameters::new(
            self.config.size_limit_per_file,
            0,
            0,
        ))
        .recover_on_open(self.config.recover_on_open)
        .time_service(Arc::clone(&self.time_service));
        self.registry
            .open_log(&server_dir, Arc::new(UpdateMsgParser), options)
    }

    /// Returns the change number index log.
    ///
    /// The last rotation time is restored from its marker file, or set to
    /// now when the index is created.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Shutdown`] after shutdown, or an error if
    /// the log cannot be opened.
    pub fn get_or_create_cn_index_log(
        &self,
    ) -> ChangelogResult<Arc<Log<u64, ChangeNumberIndexRecord>>> {
        self.ensure_running()?;
        let dir = self.cn_index_log_path();
        fs::create_dir_all(&dir).map_err(|e| ChangelogError::io("create directory", &dir, e))?;

        let last_rotation_time = match markers::read_rotation_time(&dir)? {
            Some(time) => time,
            None => {
                let now = self.time_service.now_millis();
                markers::write_rotation_time(&dir, now)?;
                now
            }
        };
        let options = LogOptions::new(self.config.rotation_parameters(last_rotation_time))
            .recover_on_open(self.config.recover_on_open)
            .time_service(Arc::clone(&self.time_service))
            .rotation_notifier(Arc::new(RotationTimeMarker { dir: dir.clone() }));
        self.registry
            .open_log(&dir, Arc::new(ChangeNumberIndexRecordParser), options)
    }

    /// Returns the last rotation time of the change number index.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be read.
    pub fn cn_index_last_rotation_time(&self) -> ChangelogResult<Option<i64>> {
        markers::read_rotation_time(&self.cn_index_log_path())
    }

    /// Releases a log obtained from this environment.
    pub fn close_log<K: LogKey, V: LogValue>(&self, log: &Log<K, V>) {
        self.registry.release(log.path());
    }

    /// Replaces the generation id of a domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is unknown or the marker cannot be
    /// written.
    pub fn reset_generation_id(&self, base_dn: &str, generation_id: i64) -> ChangelogResult<()> {
        self.ensure_running()?;
        let domains = self.domains.lock();
        let domain_dir = self.domain_dir_of(&domains, base_dn)?;
        markers::write_generation_id(&domain_dir, generation_id)?;
        tracing::debug!(base_dn, generation_id, "reset generation id");
        Ok(())
    }

    /// Removes the generation id of a domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is unknown or the marker cannot be
    /// removed.
    pub fn clear_generation_id(&self, base_dn: &str) -> ChangelogResult<()> {
        self.ensure_running()?;
        let domains = self.domains.lock();
        let domain_dir = self.domain_dir_of(&domains, base_dn)?;
        markers::remove_generation_id(&domain_dir)
    }

    /// Records that the replica that produced `offline_csn` went offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain or replica is unknown or the marker
    /// cannot be written.
    pub fn notify_replica_offline(&self, base_dn: &str, offline_csn: Csn) -> ChangelogResult<()> {
        self.ensure_running()?;
        let domains = self.domains.lock();
        let server_dir = self.existing_server_dir(&domains, base_dn, offline_csn.server_id())?;
        markers::write_offline_csn(&server_dir, &offline_csn)?;
        tracing::debug!(base_dn, %offline_csn, "replica went offline");
        Ok(())
    }

    /// Records that a replica is back online.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain or replica is unknown or the marker
    /// cannot be removed.
    pub fn notify_replica_online(&self, base_dn: &str, server_id: u16) -> ChangelogResult<()> {
        self.ensure_running()?;
        let domains = self.domains.lock();
        let server_dir = self.existing_server_dir(&domains, base_dn, server_id)?;
        markers::remove_offline_csn(&server_dir)
    }

    fn existing_server_dir(
        &self,
        domains: &DomainIds,
        base_dn: &str,
        server_id: u16,
    ) -> ChangelogResult<PathBuf> {
        let server_dir = Self::server_dir(&self.domain_dir_of(domains, base_dn)?, server_id);
        if !server_dir.is_dir() {
            return Err(ChangelogError::invalid_operation(format!(
                "unknown replica {server_id} of domain '{base_dn}'"
            )));
        }
        Ok(server_dir)
    }

    /// Removes a domain: closes its logs, deletes its directory and forgets
    /// its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be deleted or the domains
    /// state cannot be written.
    pub fn clear_domain(&self, base_dn: &str) -> ChangelogResult<()> {
        let mut domains = self.domains.lock();
        let Some(domain_id) = domains.get(base_dn) else {
            return Ok(());
        };
        let domain_dir = self.domain_dir(domain_id);
        self.registry.close_under(&domain_dir);
        if domain_dir.exists() {
            fs::remove_dir_all(&domain_dir)
                .map_err(|e| ChangelogError::io("delete", &domain_dir, e))?;
        }

        let mut updated = domains.clone();
        updated.remove(base_dn);
        markers::write_atomically(
            &self.root.join(DOMAINS_STATE_FILENAME),
            updated.encode().as_bytes(),
        )?;
        *domains = updated;
        tracing::debug!(base_dn, "cleared replication domain");
        Ok(())
    }

    /// Closes every log and refuses to open new ones.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.close_all();
        tracing::debug!(root = %self.root.display(), "replication environment shut down");
    }
}

impl std::fmt::Debug for ReplicationEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEnvironment")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Persists the rotation time of the change number index.
struct RotationTimeMarker {
    dir: PathBuf,
}

impl LogRotationNotifier for RotationTimeMarker {
    fn log_file_rotated(&self, _log_path: &Path, rotation_time: i64) {
        if let Err(e) = markers::write_rotation_time(&self.dir, rotation_time) {
            tracing::error!(
                dir = %self.dir.display(),
                error = %e,
                "unable to persist change number index rotation time"
            );
        }
    }
}

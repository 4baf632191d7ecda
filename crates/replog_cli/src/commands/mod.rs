//! CLI command implementations.
//!
//! The commands never open a [`replog_core::ReplicationEnvironment`]: they
//! walk the directory layout and read the log files through read-only
//! handles, so a damaged changelog is reported as found on disk.

pub mod dump;
pub mod inspect;
pub mod verify;

use crate::error::{CliError, CliResult};
use replog_core::block::BlockReader;
use replog_core::environment::{
    DomainIds, CN_INDEX_DB_DIRNAME, DOMAINS_STATE_FILENAME, DOMAIN_SUFFIX, SERVER_ID_SUFFIX,
};
use replog_core::log::{HEAD_LOG_FILE_NAME, LOG_FILE_NAME_SEPARATOR, LOG_FILE_SUFFIX};
use replog_core::{
    ChangeNumberIndexRecord, ChangeNumberIndexRecordParser, ChangelogResult, Csn, RecordParser,
    UpdateMsg, UpdateMsgParser,
};
use serde::Serialize;
use replog_storage::FileBackend;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a log directory stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogKind {
    /// The changes of one replica of a domain.
    Replica {
        /// Base DN of the domain.
        base_dn: String,
        /// Id of the replica.
        server_id: u16,
    },
    /// The change number index.
    ChangeNumberIndex,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replica { base_dn, server_id } => write!(f, "{base_dn} / replica {server_id}"),
            Self::ChangeNumberIndex => f.write_str("change number index"),
        }
    }
}

/// A log directory found in a changelog.
#[derive(Debug, Clone)]
pub struct LogDir {
    /// What the log stores.
    pub kind: LogKind,
    /// Directory of the log.
    pub path: PathBuf,
}

impl LogDir {
    /// Returns the log files of the directory, read-only files first in key
    /// order and the head last.
    pub fn files(&self) -> CliResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut head = None;
        let entries = fs::read_dir(&self.path).map_err(|e| CliError::io(&self.path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CliError::io(&self.path, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == HEAD_LOG_FILE_NAME {
                head = Some(entry.path());
            } else if name.ends_with(LOG_FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        // lowest keys are fixed-width hex or unpadded decimal
        files.sort_by_cached_key(|p| {
            let name = file_name(p);
            let lowest = name
                .split(LOG_FILE_NAME_SEPARATOR)
                .next()
                .unwrap_or_default()
                .to_string();
            (lowest.len(), lowest)
        });
        files.extend(head);
        Ok(files)
    }
}

/// Finds the logs of the changelog rooted at `root`.
pub fn discover(root: &Path) -> CliResult<Vec<LogDir>> {
    let state_path = root.join(DOMAINS_STATE_FILENAME);
    let cn_index_path = root.join(CN_INDEX_DB_DIRNAME);
    if !state_path.exists() && !cn_index_path.exists() {
        return Err(CliError::NotAChangelog(root.to_path_buf()));
    }

    let mut logs = Vec::new();
    if state_path.exists() {
        let text = fs::read_to_string(&state_path).map_err(|e| CliError::io(&state_path, e))?;
        let domains = DomainIds::decode(&text)?;
        for (base_dn, id) in domains.iter() {
            let domain_dir = root.join(format!("{id}{DOMAIN_SUFFIX}"));
            if !domain_dir.is_dir() {
                tracing::warn!(base_dn, dir = %domain_dir.display(), "domain directory missing");
                continue;
            }
            let mut replicas = Vec::new();
            let entries = fs::read_dir(&domain_dir).map_err(|e| CliError::io(&domain_dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| CliError::io(&domain_dir, e))?;
                let name = entry.file_name();
                let server_id = name
                    .to_str()
                    .and_then(|n| n.strip_suffix(SERVER_ID_SUFFIX))
                    .and_then(|id| id.parse::<u16>().ok());
                if let Some(server_id) = server_id {
                    replicas.push((server_id, entry.path()));
                }
            }
            replicas.sort();
            for (server_id, path) in replicas {
                tracing::debug!(base_dn, server_id, path = %path.display(), "found replica log");
                logs.push(LogDir {
                    kind: LogKind::Replica {
                        base_dn: base_dn.to_string(),
                        server_id,
                    },
                    path,
                });
            }
        }
    }
    if cn_index_path.is_dir() {
        logs.push(LogDir {
            kind: LogKind::ChangeNumberIndex,
            path: cn_index_path,
        });
    }
    Ok(logs)
}

/// Summary of one log file.
#[derive(Debug, Serialize)]
pub struct FileSummary {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Number of complete records.
    pub records: u64,
    /// Key of the first record.
    pub oldest_key: Option<String>,
    /// Key of the last complete record.
    pub newest_key: Option<String>,
    /// Size the file would be truncated to if its tail is torn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_size: Option<u64>,
}

impl LogDir {
    /// Summarizes the log file at `path`, which belongs to this directory.
    pub fn summarize(&self, path: &Path) -> CliResult<FileSummary> {
        match self.kind {
            LogKind::Replica { .. } => {
                summarize_file::<Csn, UpdateMsg>(path, Arc::new(UpdateMsgParser))
            }
            LogKind::ChangeNumberIndex => summarize_file::<u64, ChangeNumberIndexRecord>(
                path,
                Arc::new(ChangeNumberIndexRecordParser),
            ),
        }
    }
}

fn summarize_file<K, V>(
    path: &Path,
    parser: Arc<dyn RecordParser<K, V>>,
) -> CliResult<FileSummary> {
    let mut reader = open_reader(path, Arc::clone(&parser))?;
    let size = reader.file_size()?;
    let valid_size = reader.check_log_is_valid()?;
    let records = reader.number_of_records()?;
    let oldest_key = reader
        .oldest_record()?
        .map(|r| parser.encode_key_to_string(r.key()));
    let newest_key = reader
        .newest_record()?
        .map(|r| parser.encode_key_to_string(r.key()));
    Ok(FileSummary {
        name: file_name(path),
        size,
        records,
        oldest_key,
        newest_key,
        valid_size,
    })
}

/// Opens a read-only reader on a log file.
pub fn open_reader<K, V>(
    path: &Path,
    parser: Arc<dyn RecordParser<K, V>>,
) -> ChangelogResult<BlockReader<K, V>> {
    Ok(BlockReader::new(
        Box::new(FileBackend::open_read_only(path)?),
        parser,
    ))
}

/// Returns the file name of `path`.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Formats a byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

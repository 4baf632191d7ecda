//! Verify command implementation.

use super::{discover, file_name, open_reader, LogDir, LogKind};
use crate::error::{CliError, CliResult};
use replog_core::log::{HEAD_LOG_FILE_NAME, LOG_FILE_NAME_SEPARATOR, LOG_FILE_SUFFIX};
use replog_core::{
    ChangeNumberIndexRecord, ChangeNumberIndexRecordParser, Csn, RecordParser, UpdateMsg,
    UpdateMsgParser,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Verification result of one log file.
#[derive(Debug, Default)]
pub struct FileReport {
    /// Path of the file.
    pub path: PathBuf,
    /// Number of records checked.
    pub records_checked: u64,
    /// Problems found.
    pub errors: Vec<String>,
    /// Anomalies the next open repairs.
    pub warnings: Vec<String>,
}

impl FileReport {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verifies every file of every log of the changelog at `path`.
pub fn verify(path: &Path) -> CliResult<Vec<FileReport>> {
    let mut reports = Vec::new();
    for log in discover(path)? {
        let mut previous_newest = None;
        for file in log.files()? {
            let (report, newest) = verify_file(&log, &file)?;
            reports.push(report);
            if let (Some(prev), Some(first)) = (&previous_newest, newest.as_ref().map(|k| &k.0)) {
                if first <= prev {
                    let last = reports.len() - 1;
                    reports[last]
                        .errors
                        .push(format!("first key {first} does not follow previous file's {prev}"));
                }
            }
            if let Some((_, last)) = newest {
                previous_newest = Some(last);
            }
        }
    }
    Ok(reports)
}

/// First and last keys of a file, in their file name form.
type KeyRange = Option<(SortableKey, SortableKey)>;

/// A key in file name form, ordered the way the keys of its log are.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortableKey {
    rank: (usize, String),
}

impl SortableKey {
    fn new(encoded: String) -> Self {
        Self {
            rank: (encoded.len(), encoded),
        }
    }
}

impl std::fmt::Display for SortableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rank.1)
    }
}

fn verify_file(log: &LogDir, path: &Path) -> CliResult<(FileReport, KeyRange)> {
    match log.kind {
        LogKind::Replica { .. } => {
            verify_records::<Csn, UpdateMsg>(path, Arc::new(UpdateMsgParser))
        }
        LogKind::ChangeNumberIndex => verify_records::<u64, ChangeNumberIndexRecord>(
            path,
            Arc::new(ChangeNumberIndexRecordParser),
        ),
    }
}

fn verify_records<K: Ord + Clone, V>(
    path: &Path,
    parser: Arc<dyn RecordParser<K, V>>,
) -> CliResult<(FileReport, KeyRange)> {
    let mut report = FileReport {
        path: path.to_path_buf(),
        ..FileReport::default()
    };
    let name = file_name(path);
    let is_head = name == HEAD_LOG_FILE_NAME;
    let mut reader = open_reader(path, Arc::clone(&parser))?;
    let size = reader.file_size()?;

    match reader.check_log_is_valid() {
        Ok(None) => {}
        Ok(Some(valid_size)) if is_head => report.warnings.push(format!(
            "torn tail of {} bytes will be truncated on next open",
            size - valid_size
        )),
        Ok(Some(valid_size)) => report.errors.push(format!(
            "read-only file has a torn tail after {valid_size} bytes"
        )),
        Err(e) => report.errors.push(e.to_string()),
    }

    reader.seek_to_position(0);
    let mut first: Option<K> = None;
    let mut last: Option<K> = None;
    loop {
        let position = reader.position();
        match reader.read_record() {
            Ok(Some(record)) => {
                report.records_checked += 1;
                let (key, _) = record.into_parts();
                if let Some(prev) = &last {
                    if &key <= prev {
                        report.errors.push(format!(
                            "key {} at position {position} does not follow {}",
                            parser.encode_key_to_string(&key),
                            parser.encode_key_to_string(prev)
                        ));
                    }
                }
                if first.is_none() {
                    first = Some(key.clone());
                }
                last = Some(key);
            }
            Ok(None) => break,
            Err(e) => {
                report.errors.push(format!("at position {position}: {e}"));
                break;
            }
        }
    }

    if !is_head {
        check_name_bounds(&name, parser.as_ref(), first.as_ref(), last.as_ref(), &mut report);
    }

    let range = first.zip(last).map(|(first, last)| {
        (
            SortableKey::new(parser.encode_key_to_string(&first)),
            SortableKey::new(parser.encode_key_to_string(&last)),
        )
    });
    Ok((report, range))
}

fn check_name_bounds<K: Ord, V>(
    name: &str,
    parser: &dyn RecordParser<K, V>,
    first: Option<&K>,
    last: Option<&K>,
    report: &mut FileReport,
) {
    let bounds = name
        .strip_suffix(LOG_FILE_SUFFIX)
        .and_then(|stem| stem.split_once(LOG_FILE_NAME_SEPARATOR))
        .map(|(lowest, highest)| {
            (
                parser.decode_key_from_string(lowest),
                parser.decode_key_from_string(highest),
            )
        });
    let (lowest, highest) = match bounds {
        Some((Ok(lowest), Ok(highest))) => (lowest, highest),
        _ => {
            report.errors.push(format!("file name {name} does not hold two keys"));
            return;
        }
    };
    match (first, last) {
        (Some(first), Some(last)) => {
            if first != &lowest {
                report.errors.push(format!(
                    "first key {} does not match file name",
                    parser.encode_key_to_string(first)
                ));
            }
            if last != &highest {
                report.errors.push(format!(
                    "last key {} does not match file name",
                    parser.encode_key_to_string(last)
                ));
            }
        }
        _ => report.errors.push("read-only file holds no record".to_string()),
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying changelog at {}", path.display());
    println!();

    let reports = verify(path)?;
    let mut problems = 0;
    for report in &reports {
        let status = if report.is_ok() { "ok" } else { "FAILED" };
        println!(
            "{} ({} records): {status}",
            report.path.display(),
            report.records_checked
        );
        for warning in &report.warnings {
            println!("  warning: {warning}");
        }
        for error in &report.errors {
            println!("  error: {error}");
        }
        problems += report.errors.len();
    }

    println!();
    if problems == 0 {
        println!("✓ Changelog verification passed ({} files)", reports.len());
        Ok(())
    } else {
        println!("✗ Changelog verification failed");
        Err(CliError::VerificationFailed(problems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_testkit::{append_torn_record, scenarios, TestEnvironment};

    fn errors(reports: &[FileReport]) -> Vec<&String> {
        reports.iter().flat_map(|r| &r.errors).collect()
    }

    #[test]
    fn healthy_changelog_passes() {
        let env = TestEnvironment::rotating_every(2);
        let changelog = env.changelog();
        scenarios::populate(&changelog, &["dc=example,dc=com"], &[1, 2], 6);

        let reports = verify(env.path()).unwrap();
        assert!(reports.len() > 3);
        assert!(errors(&reports).is_empty(), "{:?}", errors(&reports));
        let checked: u64 = reports.iter().map(|r| r.records_checked).sum();
        assert_eq!(checked, 12);
        run(env.path()).unwrap();
    }

    #[test]
    fn torn_head_is_a_warning() {
        let env = TestEnvironment::new();
        let changelog = env.changelog();
        scenarios::populate(&changelog, &["dc=example,dc=com"], &[1], 3);
        let log = changelog.replica_db("dc=example,dc=com", 1).unwrap();
        append_torn_record(&log.log().path().join(HEAD_LOG_FILE_NAME), 64, 5).unwrap();

        let reports = verify(env.path()).unwrap();
        assert!(errors(&reports).is_empty());
        assert_eq!(reports[0].warnings.len(), 1);
        assert_eq!(reports[0].records_checked, 3);
    }

    #[test]
    fn torn_read_only_file_fails() {
        let env = TestEnvironment::rotating_every(2);
        let changelog = env.changelog();
        scenarios::populate(&changelog, &["dc=example,dc=com"], &[1], 4);
        let db = changelog.replica_db("dc=example,dc=com", 1).unwrap();
        let rotated = db
            .log()
            .file_paths()
            .into_iter()
            .find(|p| file_name(p) != HEAD_LOG_FILE_NAME)
            .unwrap();
        append_torn_record(&rotated, 64, 5).unwrap();

        assert!(matches!(
            run(env.path()),
            Err(CliError::VerificationFailed(n)) if n >= 1
        ));
    }

    #[test]
    fn misnamed_file_fails() {
        let env = TestEnvironment::rotating_every(2);
        let changelog = env.changelog();
        scenarios::populate(&changelog, &["dc=example,dc=com"], &[1], 4);
        let db = changelog.replica_db("dc=example,dc=com", 1).unwrap();
        let rotated = db
            .log()
            .file_paths()
            .into_iter()
            .find(|p| file_name(p) != HEAD_LOG_FILE_NAME)
            .unwrap();
        let upper = Csn::new(9_999, 0, 1);
        let stem = file_name(&rotated);
        let (lowest, _) = stem.split_once(LOG_FILE_NAME_SEPARATOR).unwrap();
        let renamed = rotated.with_file_name(format!("{lowest}_{upper}.log"));
        std::fs::rename(&rotated, &renamed).unwrap();

        let reports = verify(env.path()).unwrap();
        let errors = errors(&reports);
        assert!(errors.iter().any(|e| e.contains("does not match file name")));
    }
}

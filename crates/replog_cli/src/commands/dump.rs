//! Dump command implementation.
//!
//! Writes every log file as text, one `key -> value` line per record, under
//! an output directory mirroring the changelog layout. Files are read
//! through read-only handles: a torn tail is skipped and left on disk.

use super::{discover, file_name, open_reader, LogDir, LogKind};
use crate::error::{CliError, CliResult};
use replog_core::{
    ChangeNumberIndexRecord, ChangeNumberIndexRecordParser, Csn, LogKey, LogValue, RecordParser,
    UpdateMsg, UpdateMsgParser,
};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Dumps the logs of the changelog at `path` into `output`.
///
/// Returns the directories written, one per log.
pub fn dump(path: &Path, output: &Path) -> CliResult<Vec<PathBuf>> {
    let mut written = Vec::new();
    for log in discover(path)? {
        let relative = log.path.strip_prefix(path).unwrap_or(&log.path);
        let target = output.join(relative);
        fs::create_dir_all(&target).map_err(|e| CliError::io(&target, e))?;
        dump_log(&log, &target)?;
        tracing::debug!(log = %log.kind, target = %target.display(), "dumped log");
        written.push(target);
    }
    Ok(written)
}

fn dump_log(log: &LogDir, target: &Path) -> CliResult<()> {
    for file in log.files()? {
        let out = target.join(format!("{}.txt", file_name(&file)));
        match log.kind {
            LogKind::Replica { .. } => {
                dump_file::<Csn, UpdateMsg>(&file, Arc::new(UpdateMsgParser), &out)?;
            }
            LogKind::ChangeNumberIndex => dump_file::<u64, ChangeNumberIndexRecord>(
                &file,
                Arc::new(ChangeNumberIndexRecordParser),
                &out,
            )?,
        }
    }
    Ok(())
}

fn dump_file<K: LogKey, V: LogValue>(
    path: &Path,
    parser: Arc<dyn RecordParser<K, V>>,
    out: &Path,
) -> CliResult<()> {
    let mut reader = open_reader(path, Arc::clone(&parser))?;
    if let Some(valid_size) = reader.check_log_is_valid()? {
        tracing::warn!(path = %path.display(), valid_size, "skipping invalid tail");
        reader = reader.with_readable_size(valid_size);
    }
    reader.seek_to_position(0);

    let mut text = String::new();
    while let Some(record) = reader.read_record()? {
        let _ = writeln!(
            text,
            "{} -> {:?}",
            parser.encode_key_to_string(record.key()),
            record.value()
        );
    }
    fs::write(out, text).map_err(|e| CliError::io(out, e))
}

/// Runs the dump command.
pub fn run(path: &Path, output: &Path) -> CliResult<()> {
    let written = dump(path, output)?;
    for target in &written {
        println!("{}", target.display());
    }
    println!("Dumped {} logs to {}", written.len(), output.display());
    Ok(())
}

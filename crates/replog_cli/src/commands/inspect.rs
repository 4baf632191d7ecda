//! Inspect command implementation.

use super::{discover, format_size, FileSummary, LogDir};
use crate::error::CliResult;
use serde::Serialize;
use std::path::Path;

/// Changelog inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Changelog root directory.
    pub path: String,
    /// Total size of the log files in bytes.
    pub total_size: u64,
    /// Total number of records.
    pub total_records: u64,
    /// One entry per log.
    pub logs: Vec<LogSummary>,
}

/// Statistics for a single log.
#[derive(Debug, Serialize)]
pub struct LogSummary {
    /// What the log stores.
    pub log: String,
    /// Log directory.
    pub path: String,
    /// Number of files, head included.
    pub file_count: usize,
    /// Size in bytes.
    pub size: u64,
    /// Number of records.
    pub records: u64,
    /// Key of the first record.
    pub oldest_key: Option<String>,
    /// Key of the last record.
    pub newest_key: Option<String>,
    /// Per-file details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileSummary>>,
}

/// Inspects the changelog at `path`.
pub fn inspect(path: &Path, show_segments: bool) -> CliResult<InspectResult> {
    let mut result = InspectResult {
        path: path.display().to_string(),
        total_size: 0,
        total_records: 0,
        logs: Vec::new(),
    };
    for log in discover(path)? {
        let summary = summarize_log(&log, show_segments)?;
        result.total_size += summary.size;
        result.total_records += summary.records;
        result.logs.push(summary);
    }
    Ok(result)
}

fn summarize_log(log: &LogDir, show_segments: bool) -> CliResult<LogSummary> {
    let files = log
        .files()?
        .iter()
        .map(|file| log.summarize(file))
        .collect::<CliResult<Vec<_>>>()?;
    Ok(LogSummary {
        log: log.kind.to_string(),
        path: log.path.display().to_string(),
        file_count: files.len(),
        size: files.iter().map(|f| f.size).sum(),
        records: files.iter().map(|f| f.records).sum(),
        oldest_key: files.iter().find_map(|f| f.oldest_key.clone()),
        newest_key: files.iter().rev().find_map(|f| f.newest_key.clone()),
        files: show_segments.then_some(files),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, show_segments: bool, format: &str) -> CliResult<()> {
    let result = inspect(path, show_segments)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Replication Changelog Inspection");
    println!("================================");
    println!();
    println!("Path:    {}", result.path);
    println!("Size:    {}", format_size(result.total_size));
    println!("Records: {}", result.total_records);

    for log in &result.logs {
        println!();
        println!("{}:", log.log);
        println!("  Files:   {}", log.file_count);
        println!("  Size:    {}", format_size(log.size));
        println!("  Records: {}", log.records);
        if let (Some(oldest), Some(newest)) = (&log.oldest_key, &log.newest_key) {
            println!("  Keys:    {oldest} .. {newest}");
        }
        for file in log.files.iter().flatten() {
            let torn = match file.valid_size {
                Some(valid) => format!(", torn tail after {valid} bytes"),
                None => String::new(),
            };
            println!(
                "    {} ({}, {} records{torn})",
                file.name,
                format_size(file.size),
                file.records
            );
        }
    }
}

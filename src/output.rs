//! Output formatting and persistence for feed summaries.
//!
//! Supports JSON logging and CSV append.

use anyhow::Result;
use tracing::{debug, info};

use crate::summary::FeedSummary;
use csv::{Writer, WriterBuilder};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Logs a feed summary as pretty-printed JSON.
pub fn print_json(summary: &FeedSummary) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// Appends a [`FeedSummary`] record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, summary: &FeedSummary) -> Result<()> {
    SummaryLog::open(path)?.append(summary)
}

/// A CSV file kept open across many appended summaries.
///
/// Every row is flushed as soon as it is written so an interrupted watch
/// loses nothing.
pub struct SummaryLog {
    writer: Writer<File>,
    rows: usize,
    errors: usize,
}

impl SummaryLog {
    pub fn open(path: &str) -> Result<Self> {
        let file_exists = Path::new(path).exists();
        debug!(path, file_exists, "Opening CSV summary log");

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().append(true).create(true).open(path)?;

        let writer = WriterBuilder::new()
            .has_headers(!file_exists) // IMPORTANT when appending
            .from_writer(file);

        Ok(SummaryLog {
            writer,
            rows: 0,
            errors: 0,
        })
    }

    pub fn append(&mut self, summary: &FeedSummary) -> Result<()> {
        self.writer.serialize(summary)?;
        self.writer.flush()?;
        self.rows += 1;
        if summary.is_error() {
            self.errors += 1;
        }
        Ok(())
    }

    /// Rows written through this handle.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Error rows written through this handle.
    pub fn errors(&self) -> usize {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_print_json_does_not_panic() {
        let summary = FeedSummary::default();
        print_json(&summary).unwrap();
    }

    #[test]
    fn test_append_record_creates_file() {
        let path = temp_path("gtfs_rt_toolkit_test_create.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        let summary = FeedSummary::default();
        append_record(&path, &summary).unwrap();

        assert!(Path::new(&path).exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("gtfs_rt_toolkit_test_header.csv");
        let _ = fs::remove_file(&path);

        let summary = FeedSummary::default();
        append_record(&path, &summary).unwrap();
        append_record(&path, &summary).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // Header line should appear exactly once
        let header_count = content.lines().filter(|l| l.contains("read_at")).count();
        assert_eq!(header_count, 1);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_mixes_reads_and_errors() {
        let path = temp_path("gtfs_rt_toolkit_test_rows.csv");
        let _ = fs::remove_file(&path);

        append_record(&path, &FeedSummary::default()).unwrap();
        let failed = FeedSummary::from_error(&FeedError::Transport("timed out".to_string()));
        append_record(&path, &failed).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // 1 header + 2 data rows
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("transport_error"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_summary_log_counts_rows_and_errors() {
        let path = temp_path("gtfs_rt_toolkit_test_log.csv");
        let _ = fs::remove_file(&path);

        let mut log = SummaryLog::open(&path).unwrap();
        log.append(&FeedSummary::default()).unwrap();
        let failed = FeedSummary::from_error(&FeedError::Transport("timed out".to_string()));
        log.append(&failed).unwrap();
        log.append(&FeedSummary::default()).unwrap();

        assert_eq!(log.rows(), 3);
        assert_eq!(log.errors(), 1);
        drop(log);

        // Reopening an existing log must not repeat the header.
        append_record(&path, &FeedSummary::default()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 5);
        assert_eq!(content.lines().filter(|l| l.contains("read_at")).count(), 1);

        fs::remove_file(&path).unwrap();
    }
}

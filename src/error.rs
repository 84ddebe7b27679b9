use std::path::PathBuf;

use thiserror::Error;

use crate::types::Task;

#[derive(Error, Debug)]
pub enum DownloaderError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cannot write to directory: {}", .0.display())]
    UnwritableDirectory(PathBuf),

    #[error("Failed to load index {}: {message}", .path.display())]
    IndexLoadError { path: PathBuf, message: String },

    #[error("Failed to append to index {}: {source}", .path.display())]
    IndexAppendError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Specify a retention time value such as 16h or 2d in your config file")]
    NoRetentionConfigured,

    #[error("Invalid interval {0:?}: expected <number><m|h|d|w> or one of hourly, daily, weekly")]
    InvalidInterval(String),

    #[error("Unrecognised date: {0}")]
    InvalidDate(String),

    #[error("Invalid report: {0}")]
    InvalidReport(String),

    #[error("Report not found: {0}")]
    ReportNotFound(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error(
        "{} tasks still failing after {attempts} attempts; fresh pre-signed URLs are required",
        .unresolved.len()
    )]
    ExcessiveDownloadAttempts { attempts: u32, unresolved: Vec<Task> },

    #[error("Interrupted with {} tasks unresolved", .unresolved.len())]
    Interrupted { unresolved: Vec<Task> },

    #[error("Download failed: {0}")]
    DownloadError(String),

    #[error("Timed out after {0:?}")]
    TimeoutError(std::time::Duration),

    #[error("Transfer interrupted")]
    TransferInterrupted,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl DownloaderError {
    /// Tasks the caller has to resubmit (with fresh URLs) after a failed batch.
    pub fn unresolved(&self) -> &[Task] {
        match self {
            DownloaderError::ExcessiveDownloadAttempts { unresolved, .. }
            | DownloaderError::Interrupted { unresolved } => unresolved,
            _ => &[],
        }
    }
}

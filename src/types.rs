use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::DownloaderError;
use crate::parser;

/// Metadata recovered from the partition segments of a report URL
/// (`.../year%3D2017/month%3D11/...`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMeta {
    pub report_type: Option<String>,
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub hour: Option<String>,
    pub tenant: Option<String>,
    /// `year/month/day/hour/<file name>`, relative to the save path.
    pub path: String,
}

/// One remote object to fetch into one local file.
#[derive(Debug, Clone)]
pub struct Task {
    pub report_id: String,
    pub kind: String,
    pub url: String,
    pub meta: TaskMeta,
    pub output_path: PathBuf,
    pub size: Option<u64>,
    pub position: Option<usize>,
    pub description: Option<String>,
    pub downloaded: bool,
}

impl Task {
    pub fn new(
        report_id: &str,
        kind: &str,
        url: &str,
        timestamp: NaiveDateTime,
    ) -> Result<Self, DownloaderError> {
        let meta = parser::parse_task_meta(kind, url, timestamp)?;
        Ok(Self {
            report_id: report_id.to_string(),
            kind: kind.to_string(),
            url: url.to_string(),
            output_path: PathBuf::from(&meta.path),
            meta,
            size: None,
            position: None,
            description: None,
            downloaded: false,
        })
    }

    /// Destination of this task below `save_path`. Depends only on the URL path,
    /// never on the signature query string.
    pub fn destination(&self, save_path: &Path) -> PathBuf {
        save_path.join(&self.meta.path)
    }

    pub fn set_save_path(&mut self, save_path: &Path) {
        self.output_path = self.destination(save_path);
    }

    pub fn file_name(&self) -> &str {
        self.output_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
    }

    pub fn size_mb(&self) -> Option<f64> {
        self.size.map(|s| s as f64 / 1_000_000.0)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "report {} [{}] -> {}",
            self.report_id,
            self.kind,
            self.output_path.display()
        )
    }
}

/// Six-hour bucket of the day a report was published in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPeriod {
    pub label: String,
    pub number: u8,
}

/// A bucket of tasks sharing one observation timestamp.
#[derive(Debug, Clone)]
pub struct Report {
    pub id: String,
    pub timestamp: NaiveDateTime,
    pub period: ReportPeriod,
    pub tasks: BTreeMap<String, Task>,
}

impl Report {
    pub fn new(
        timestamp: &str,
        urls: &BTreeMap<String, Option<String>>,
    ) -> Result<Self, DownloaderError> {
        let timestamp = parser::parse_date(timestamp)?;
        let id = parser::report_id(timestamp);
        let period = parser::report_period(timestamp);

        let mut tasks = BTreeMap::new();
        for (kind, url) in urls {
            let Some(url) = url.as_deref().filter(|u| !u.is_empty()) else {
                continue;
            };
            tasks.insert(kind.clone(), Task::new(&id, kind, url, timestamp)?);
        }

        Ok(Self {
            id,
            timestamp,
            period,
            tasks,
        })
    }
}

/// Retention window after which an indexed file becomes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPeriod(pub chrono::Duration);

impl RetentionPeriod {
    pub fn duration(&self) -> chrono::Duration {
        self.0
    }
}

impl FromStr for RetentionPeriod {
    type Err = DownloaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parser::parse_interval(s).map(RetentionPeriod)
    }
}

/// Restriction applied to the catalog before planning a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFilter {
    /// Keep reports whose period number (1-4) is listed.
    ReportNumbers(Vec<u8>),
    /// Keep the listed 1-indexed positions of the newest-first ordering.
    Recent(Vec<usize>),
}

/// Partial update of one task, as sent by external metadata sources.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PartialUpdate {
    pub report: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub downloaded: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum TaskUpdate {
    Task(Task),
    Partial(PartialUpdate),
}

impl TryFrom<&serde_json::Value> for TaskUpdate {
    type Error = DownloaderError;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        let update: PartialUpdate = serde_json::from_value(value.clone())
            .map_err(|e| DownloaderError::InvalidUpdate(format!("{}: {}", value, e)))?;
        if update.report.is_empty() || update.kind.is_empty() {
            return Err(DownloaderError::InvalidUpdate(value.to_string()));
        }
        Ok(TaskUpdate::Partial(update))
    }
}

/// Result of filtering the catalog against the index.
#[derive(Debug, Clone, Default)]
pub struct DownloadPlan {
    pub tasks: Vec<Task>,
    pub skipped: usize,
    pub found: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub task: Task,
    pub status: TransferStatus,
    pub attempt: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub total_tasks: usize,
    pub skipped: usize,
    pub successful: usize,
    pub attempts: u32,
    pub total_bytes: u64,
    pub total_duration: Duration,
    pub reports: Vec<TransferReport>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probed: usize,
    pub attempts: u32,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneSummary {
    pub removed: usize,
    pub already_missing: usize,
}

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::DownloaderError;
use crate::index::DownloadIndex;
use crate::parser::ReportListing;
use crate::pruner::RetentionPruner;
use crate::types::{
    DownloadPlan, PruneSummary, Report, ReportFilter, RetentionPeriod, Task, TaskUpdate,
};

/// The reports of one run and the tasks needed to materialize them.
#[derive(Debug, Default)]
pub struct ReportCatalog {
    reports: HashMap<String, Report>,
    save_path: Option<PathBuf>,
    retention: Option<RetentionPeriod>,
    downloaded: bool,
}

impl ReportCatalog {
    pub fn new(save_path: Option<PathBuf>) -> Self {
        Self {
            save_path,
            ..Self::default()
        }
    }

    pub fn with_retention(mut self, retention: Option<RetentionPeriod>) -> Self {
        self.retention = retention;
        self
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    pub fn set_save_path(&mut self, save_path: PathBuf) {
        for task in self.reports.values_mut().flat_map(|r| r.tasks.values_mut()) {
            task.set_save_path(&save_path);
        }
        self.save_path = Some(save_path);
    }

    /// Builds reports from a listing. Nothing is inserted unless every entry parses.
    pub fn ingest(&mut self, listing: &ReportListing) -> Result<usize, DownloaderError> {
        let reports = listing
            .history
            .iter()
            .map(|entry| {
                Report::new(&entry.timestamp, &entry.report).map_err(|e| match e {
                    DownloaderError::InvalidReport(msg) => {
                        DownloaderError::InvalidReport(format!("{}: {}", entry.timestamp, msg))
                    }
                    other => {
                        DownloaderError::InvalidReport(format!("{}: {}", entry.timestamp, other))
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let count = reports.len();
        for report in reports {
            self.add(report);
        }
        info!("Ingested {} reports ({} tasks held)", count, self.total_task_count());
        Ok(count)
    }

    pub fn add(&mut self, mut report: Report) {
        if let Some(save_path) = &self.save_path {
            for task in report.tasks.values_mut() {
                task.set_save_path(save_path);
            }
        }
        self.reports.insert(report.id.clone(), report);
    }

    pub fn get_report(&self, id: &str) -> Result<&Report, DownloaderError> {
        self.reports
            .get(id)
            .ok_or_else(|| DownloaderError::ReportNotFound(id.to_string()))
    }

    pub fn evict(&mut self, id: &str) -> Option<Report> {
        self.reports.remove(id)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn sorted_reports(&self, descending: bool) -> Vec<&Report> {
        let mut reports: Vec<&Report> = self.reports.values().collect();
        reports.sort_by_key(|r| r.timestamp);
        if descending {
            reports.reverse();
        }
        reports
    }

    /// All tasks, oldest report first.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.sorted_reports(false)
            .into_iter()
            .flat_map(|r| r.tasks.values())
    }

    pub fn filter(&mut self, filter: &ReportFilter) -> Result<(), DownloaderError> {
        match filter {
            ReportFilter::ReportNumbers(numbers) => {
                if let Some(bad) = numbers.iter().find(|n| !(1..=4).contains(*n)) {
                    return Err(DownloaderError::InvalidFilter(format!(
                        "report number {} is outside 1-4",
                        bad
                    )));
                }
                self.reports
                    .retain(|_, r| numbers.contains(&r.period.number));
            }
            ReportFilter::Recent(positions) => {
                let newest_first: Vec<String> = self
                    .sorted_reports(true)
                    .into_iter()
                    .map(|r| r.id.clone())
                    .collect();
                let mut keep = Vec::with_capacity(positions.len());
                for &position in positions {
                    let id = position
                        .checked_sub(1)
                        .and_then(|i| newest_first.get(i))
                        .ok_or_else(|| {
                            DownloaderError::InvalidFilter(format!(
                                "recent report {} of {}",
                                position,
                                newest_first.len()
                            ))
                        })?;
                    keep.push(id.clone());
                }
                self.reports.retain(|id, _| keep.contains(id));
            }
        }
        debug!("Filter {:?} left {} reports", filter, self.reports.len());
        Ok(())
    }

    /// Tasks whose destination is not yet indexed, numbered for progress display.
    pub fn downloadable_tasks(
        &mut self,
        index: &DownloadIndex,
    ) -> Result<DownloadPlan, DownloaderError> {
        let save_path = self.save_path.clone().ok_or_else(|| {
            DownloaderError::ConfigError("catalog has no save path".to_string())
        })?;

        let keys: Vec<(String, String)> = self
            .tasks()
            .map(|t| (t.report_id.clone(), t.kind.clone()))
            .collect();
        let found = keys.len();

        let mut plan = DownloadPlan {
            found,
            ..DownloadPlan::default()
        };
        let mut planned = HashSet::new();
        for (report_id, kind) in keys {
            let Some(task) = self
                .reports
                .get_mut(&report_id)
                .and_then(|r| r.tasks.get_mut(&kind))
            else {
                continue;
            };
            let destination = task.destination(&save_path);
            if index.contains(&destination) {
                plan.skipped += 1;
                continue;
            }
            // Two reports can resolve to the same partition path; the oldest wins.
            if !planned.insert(destination.clone()) {
                debug!(
                    "{} [{}] shares {} with an earlier report",
                    report_id,
                    kind,
                    destination.display()
                );
                plan.skipped += 1;
                continue;
            }
            task.output_path = destination;
            task.position = Some(plan.tasks.len());
            task.description = Some(format!("|dest:{}|", task.output_path.display()));
            plan.tasks.push(task.clone());
        }

        if plan.skipped > 0 {
            warn!("Skipping {} reports out of {}", plan.skipped, found);
        }
        Ok(plan)
    }

    pub fn record_completion(&mut self, update: TaskUpdate) -> Result<(), DownloaderError> {
        let (report_id, kind) = match &update {
            TaskUpdate::Task(task) => (task.report_id.as_str(), task.kind.as_str()),
            TaskUpdate::Partial(partial) => (partial.report.as_str(), partial.kind.as_str()),
        };
        if kind.is_empty() {
            return Err(DownloaderError::InvalidUpdate(format!(
                "update for report {} names no task kind",
                report_id
            )));
        }
        let report = self
            .reports
            .get_mut(report_id)
            .ok_or_else(|| DownloaderError::ReportNotFound(report_id.to_string()))?;
        let existing = report.tasks.get_mut(kind).ok_or_else(|| {
            DownloaderError::InvalidUpdate(format!("report {} has no task {}", report_id, kind))
        })?;

        match update {
            TaskUpdate::Task(task) => {
                existing.url = task.url;
                existing.size = task.size.or(existing.size);
                existing.position = task.position.or(existing.position);
                existing.description = task.description.or(existing.description.take());
                existing.downloaded |= task.downloaded;
            }
            TaskUpdate::Partial(partial) => {
                existing.size = partial.size.or(existing.size);
                if let Some(downloaded) = partial.downloaded {
                    existing.downloaded = downloaded;
                }
            }
        }
        Ok(())
    }

    pub fn total_downloadable_bytes(&self) -> u64 {
        self.tasks().filter_map(|t| t.size).sum()
    }

    pub fn total_task_count(&self) -> usize {
        self.reports.values().map(|r| r.tasks.len()).sum()
    }

    pub fn set_downloaded(&mut self, downloaded: bool) {
        self.downloaded = downloaded;
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded
    }

    pub async fn prune_stale(
        &self,
        index: &mut DownloadIndex,
        retention: Option<RetentionPeriod>,
    ) -> Result<PruneSummary, DownloaderError> {
        RetentionPruner::new(retention.or(self.retention))
            .prune(index)
            .await
    }
}

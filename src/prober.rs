use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::catalog::ReportCatalog;
use crate::downloader::{DEFAULT_WORKERS, MAX_ATTEMPTS};
use crate::error::DownloaderError;
use crate::fetch::Fetcher;
use crate::pool::{Round, TaskOutcome};
use crate::types::{PartialUpdate, ProbeSummary, Task, TaskUpdate};

pub const DEFAULT_META_TIMEOUT: Duration = Duration::from_secs(3);

/// Learns the size of every catalog task without writing anything to disk.
pub struct MetadataProber<F> {
    fetcher: Arc<F>,
    workers: usize,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl<F: Fetcher + 'static> MetadataProber<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            workers: DEFAULT_WORKERS,
            timeout: DEFAULT_META_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn probe_all(
        &self,
        catalog: &mut ReportCatalog,
    ) -> Result<ProbeSummary, DownloaderError> {
        let mut pending: Vec<Task> = catalog.tasks().cloned().collect();
        let mut summary = ProbeSummary::default();
        if pending.is_empty() {
            return Ok(summary);
        }

        let mut attempt = 1;
        loop {
            summary.attempts = attempt;
            info!("Metadata attempt {}: {} files", attempt, pending.len());

            let failed = self
                .run_round(attempt, pending, catalog, &mut summary)
                .await;
            if failed.is_empty() {
                summary.total_bytes = catalog.total_downloadable_bytes();
                return Ok(summary);
            }
            if self.shutdown.is_cancelled() {
                return Err(DownloaderError::Interrupted { unresolved: failed });
            }
            if attempt >= MAX_ATTEMPTS {
                error!("No size for {} files after {} attempts", failed.len(), attempt);
                return Err(DownloaderError::ExcessiveDownloadAttempts {
                    attempts: attempt,
                    unresolved: failed,
                });
            }
            pending = failed;
            attempt += 1;
        }
    }

    async fn run_round(
        &self,
        attempt: u32,
        tasks: Vec<Task>,
        catalog: &mut ReportCatalog,
        summary: &mut ProbeSummary,
    ) -> Vec<Task> {
        let fetcher = Arc::clone(&self.fetcher);
        let limit = self.timeout;
        let mut round = Round::start(
            attempt,
            tasks,
            self.workers,
            self.shutdown.clone(),
            move |mut task, _ctx| {
                let fetcher = Arc::clone(&fetcher);
                async move {
                    let size = timeout(limit, fetcher.probe(&task.url))
                        .await
                        .map_err(|_| DownloaderError::TimeoutError(limit))??;
                    task.size = Some(size);
                    Ok(task)
                }
            },
        );

        let mut failed = Vec::new();
        while let Some(outcome) = round.next().await {
            match outcome {
                TaskOutcome::Succeeded { task, .. } => {
                    debug!("{} is {:?} bytes", task, task.size);
                    let update = TaskUpdate::Partial(PartialUpdate {
                        report: task.report_id.clone(),
                        kind: task.kind.clone(),
                        size: task.size,
                        downloaded: None,
                    });
                    match catalog.record_completion(update) {
                        Ok(()) => summary.probed += 1,
                        Err(e) => warn!("Could not record size of {}: {}", task, e),
                    }
                }
                TaskOutcome::Failed { task, error, .. } => {
                    warn!("Metadata attempt {} failed for {}: {}", attempt, task, error);
                    failed.push(task);
                }
            }
        }
        failed.extend(round.finish().await);
        failed
    }
}

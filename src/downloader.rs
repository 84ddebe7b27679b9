use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, warn};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::catalog::ReportCatalog;
use crate::error::DownloaderError;
use crate::fetch::{Fetcher, Transfer};
use crate::index::DownloadIndex;
use crate::pool::{Round, TaskOutcome, WorkerContext};
use crate::types::{DownloadSummary, Task, TaskUpdate, TransferReport, TransferStatus};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_CHUNK_SIZE: usize = 8096;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// One initial attempt plus two retry rounds. Pre-signed URLs expire roughly
/// 15 minutes after issue, so more rounds rarely help.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub chunk_size: usize,
    pub timeout: Duration,
    pub stats_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            stats_path: None,
        }
    }
}

pub struct DownloadEngine<F> {
    fetcher: Arc<F>,
    settings: EngineSettings,
    progress: MultiProgress,
    shutdown: CancellationToken,
}

impl<F: Fetcher + 'static> DownloadEngine<F> {
    pub fn new(fetcher: Arc<F>, settings: EngineSettings) -> Self {
        Self {
            fetcher,
            settings,
            progress: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Downloads every task of `catalog` not yet in `index`.
    ///
    /// Each success is appended to the index before the catalog is updated, so
    /// the catalog reflects what is on disk even when this returns an error.
    pub async fn download_all(
        &self,
        catalog: &mut ReportCatalog,
        index: &mut DownloadIndex,
    ) -> Result<DownloadSummary, DownloaderError> {
        let start_time = Instant::now();
        let plan = catalog.downloadable_tasks(index)?;
        let mut summary = DownloadSummary {
            total_tasks: plan.tasks.len(),
            skipped: plan.skipped,
            ..DownloadSummary::default()
        };

        let result = if plan.tasks.is_empty() {
            info!("Nothing to download ({} files already indexed)", plan.skipped);
            Ok(())
        } else {
            self.run_attempts(plan.tasks, catalog, index, &mut summary)
                .await
        };

        catalog.set_downloaded(result.is_ok());
        summary.total_duration = start_time.elapsed();

        if let Some(stats_path) = &self.settings.stats_path {
            if !summary.reports.is_empty() {
                if let Err(e) = write_stats_csv(&summary, stats_path).await {
                    error!("Failed to write stats CSV: {}", e);
                }
            }
        }

        result.map(|()| summary)
    }

    async fn run_attempts(
        &self,
        mut pending: Vec<Task>,
        catalog: &mut ReportCatalog,
        index: &mut DownloadIndex,
        summary: &mut DownloadSummary,
    ) -> Result<(), DownloaderError> {
        let mut attempt = 1;
        loop {
            summary.attempts = attempt;
            info!("Download attempt {}: {} files", attempt, pending.len());

            let (failed, index_error) = self
                .run_round(attempt, pending, catalog, index, summary)
                .await;

            if let Some(e) = index_error {
                error!("Stopping after attempt {}: {}", attempt, e);
                return Err(e);
            }
            if failed.is_empty() {
                info!("All files downloaded after {} attempt(s)", attempt);
                return Ok(());
            }
            if self.shutdown.is_cancelled() {
                warn!("Interrupted with {} files outstanding", failed.len());
                return Err(DownloaderError::Interrupted { unresolved: failed });
            }
            if attempt >= MAX_ATTEMPTS {
                error!(
                    "{} files still failing after {} attempts",
                    failed.len(),
                    attempt
                );
                for task in &failed {
                    error!("Unresolved: {}", task);
                }
                return Err(DownloaderError::ExcessiveDownloadAttempts {
                    attempts: attempt,
                    unresolved: failed,
                });
            }

            warn!("{} files failed on attempt {}, retrying", failed.len(), attempt);
            pending = failed;
            attempt += 1;
        }
    }

    /// Runs one round and returns the tasks to retry plus the first index error.
    async fn run_round(
        &self,
        attempt: u32,
        tasks: Vec<Task>,
        catalog: &mut ReportCatalog,
        index: &mut DownloadIndex,
        summary: &mut DownloadSummary,
    ) -> (Vec<Task>, Option<DownloaderError>) {
        let fetcher = Arc::clone(&self.fetcher);
        let settings = self.settings.clone();
        let progress = self.progress.clone();
        let mut round = Round::start(
            attempt,
            tasks,
            self.settings.workers,
            self.shutdown.clone(),
            move |task, ctx| {
                let fetcher = Arc::clone(&fetcher);
                let settings = settings.clone();
                let progress = progress.clone();
                async move { transfer(fetcher.as_ref(), task, ctx, &settings, &progress).await }
            },
        );

        let mut failed = Vec::new();
        let mut index_error = None;
        while let Some(outcome) = round.next().await {
            match outcome {
                TaskOutcome::Succeeded { mut task, elapsed } => {
                    if let Err(e) = index.append(&task.output_path).await {
                        error!("Downloaded {} but could not index it: {}", task, e);
                        index_error.get_or_insert(e);
                    }
                    task.downloaded = true;
                    summary.successful += 1;
                    summary.total_bytes += task.size.unwrap_or(0);
                    summary.reports.push(TransferReport {
                        task: task.clone(),
                        status: TransferStatus::Success,
                        attempt,
                        duration: elapsed,
                        error: None,
                    });
                    if let Err(e) = catalog.record_completion(TaskUpdate::Task(task)) {
                        warn!("Could not record completion: {}", e);
                    }
                }
                TaskOutcome::Failed {
                    task,
                    elapsed,
                    error,
                } => {
                    warn!("Attempt {} failed for {}: {}", attempt, task, error);
                    summary.reports.push(TransferReport {
                        task: task.clone(),
                        status: TransferStatus::Failed,
                        attempt,
                        duration: elapsed,
                        error: Some(error.to_string()),
                    });
                    failed.push(task);
                }
            }
        }
        failed.extend(round.finish().await);
        (failed, index_error)
    }
}

async fn transfer<F: Fetcher + ?Sized>(
    fetcher: &F,
    mut task: Task,
    ctx: WorkerContext,
    settings: &EngineSettings,
    progress: &MultiProgress,
) -> Result<Task, DownloaderError> {
    let destination = task.output_path.clone();
    debug!(
        "Worker {} starting {} (attempt {})",
        ctx.worker, task, ctx.attempt
    );

    if ctx.attempt <= 1 && fs::try_exists(&destination).await.unwrap_or(false) {
        warn!("Destination exists already, overwriting: {}", destination.display());
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let opened = timeout(settings.timeout, fetcher.open(&task.url))
        .await
        .map_err(|_| DownloaderError::TimeoutError(settings.timeout))??;
    if let Some(len) = opened.content_length {
        task.size = Some(len);
    }

    let pb = progress.add(create_progress_bar(&task, ctx));
    pb.set_length(task.size.unwrap_or(0));

    match write_body(opened, &destination, settings, &pb).await {
        Ok(written) => {
            pb.finish_and_clear();
            progress.remove(&pb);
            task.size.get_or_insert(written);
            debug!("Completed {} ({} bytes)", destination.display(), written);
            Ok(task)
        }
        Err(e) => {
            pb.abandon_with_message(format!("Download failed: {}", task.file_name()));
            progress.remove(&pb);
            Err(e)
        }
    }
}

/// Streams the body to `destination` through a `chunk_size` buffer. Every
/// read is bounded by the transfer timeout.
async fn write_body(
    transfer: Transfer,
    destination: &Path,
    settings: &EngineSettings,
    pb: &ProgressBar,
) -> Result<u64, DownloaderError> {
    let Transfer {
        content_length,
        mut body,
    } = transfer;

    let file = File::create(destination).await?;
    let mut writer = BufWriter::with_capacity(settings.chunk_size, file);
    let mut written: u64 = 0;

    while let Some(chunk) = timeout(settings.timeout, body.next())
        .await
        .map_err(|_| DownloaderError::TimeoutError(settings.timeout))?
    {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        pb.set_position(written);
    }
    writer.flush().await?;

    if let Some(expected) = content_length {
        if written != expected {
            return Err(DownloaderError::DownloadError(format!(
                "Short body for {}: {} of {} bytes",
                destination.display(),
                written,
                expected
            )));
        }
    }
    Ok(written)
}

fn create_progress_bar(task: &Task, ctx: WorkerContext) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] \
         {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(format!(
        "|worker:{:2}|task:{:2}/{:2}|{}",
        ctx.worker,
        task.position.map_or(0, |p| p + 1),
        ctx.total,
        task.file_name()
    ));
    pb
}

pub async fn write_stats_csv(
    summary: &DownloadSummary,
    stats_path: &Path,
) -> Result<(), DownloaderError> {
    if let Some(parent) = stats_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut wtr = csv::WriterBuilder::new().from_path(stats_path)?;
    wtr.write_record([
        "Filename",
        "Kind",
        "Status",
        "Attempt",
        "Size (MB)",
        "Duration (s)",
        "Destination",
        "Error",
    ])?;

    for report in &summary.reports {
        wtr.write_record(&[
            report.task.file_name().to_string(),
            report.task.kind.clone(),
            format!("{:?}", report.status),
            report.attempt.to_string(),
            format!("{:.2}", report.task.size_mb().unwrap_or(0.0)),
            format!("{:.2}", report.duration.as_secs_f64()),
            report.task.output_path.display().to_string(),
            report.error.clone().unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

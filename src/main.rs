use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use colored::*;
use indicatif::MultiProgress;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use report_downloader::cli::{Cli, Command};
use report_downloader::config::Config;
use report_downloader::downloader::{DownloadEngine, MAX_ATTEMPTS};
use report_downloader::error::DownloaderError;
use report_downloader::fetch::HttpFetcher;
use report_downloader::index::DownloadIndex;
use report_downloader::logging;
use report_downloader::parser;
use report_downloader::prober::MetadataProber;
use report_downloader::pruner::RetentionPruner;
use report_downloader::types::{DownloadSummary, ReportFilter, Task, TransferStatus};
use report_downloader::ReportCatalog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let progress = MultiProgress::new();
    logging::init(progress.clone())?;
    info!("Starting report downloader");

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        "Using directory {} with {} workers",
        config.directory.display(),
        config.download.workers
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping transfers");
            trigger.cancel();
        }
    });

    match cli.command {
        Command::Prune => prune(&config).await,
        Command::List { detailed } => {
            let catalog = load_catalog(&cli, &config).await?;
            print_catalog(&catalog, detailed);
            Ok(())
        }
        Command::Probe => {
            let mut catalog = load_catalog(&cli, &config).await?;
            let fetcher = Arc::new(HttpFetcher::new(config.meta_timeout())?);
            let prober = MetadataProber::new(fetcher)
                .with_workers(config.download.workers)
                .with_timeout(config.meta_timeout())
                .with_shutdown(shutdown);
            match prober.probe_all(&mut catalog).await {
                Ok(summary) => {
                    println!("\n{}", "Metadata Summary:".bold());
                    println!("Files probed: {}", summary.probed);
                    println!("Attempts: {}", summary.attempts);
                    println!(
                        "Total size: {:.2} MB",
                        summary.total_bytes as f64 / 1_000_000.0
                    );
                    print_catalog(&catalog, true);
                    Ok(())
                }
                Err(e) => Err(report_failure(e)),
            }
        }
        Command::Download => {
            let mut catalog = load_catalog(&cli, &config).await?;
            download(&config, &mut catalog, progress, shutdown).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match (&cli.config, &cli.directory) {
        (Some(path), _) => Config::load(path)?,
        (None, Some(directory)) => Config::new(directory.clone()),
        (None, None) => bail!("Pass --config or --directory"),
    };
    if let Some(directory) = &cli.directory {
        config.directory = directory.clone();
    }
    if let Some(workers) = cli.workers {
        if workers == 0 {
            bail!("--workers must be > 0");
        }
        config.download.workers = workers;
    }
    if let Some(retention) = &cli.retention {
        config.retention_time = Some(retention.clone());
        config.retention()?;
    }
    Ok(config)
}

async fn load_catalog(cli: &Cli, config: &Config) -> anyhow::Result<ReportCatalog> {
    let Some(listing_path) = &cli.listing else {
        bail!("Pass --listing with a report listing file, or - for stdin");
    };
    let listing = parser::read_listing(listing_path)
        .await
        .with_context(|| format!("Failed to read listing {}", listing_path.display()))?;

    let mut catalog =
        ReportCatalog::new(Some(config.directory.clone())).with_retention(config.retention()?);
    catalog.ingest(&listing)?;

    if !cli.report_numbers.is_empty() {
        catalog.filter(&ReportFilter::ReportNumbers(cli.report_numbers.clone()))?;
    } else if !cli.recent.is_empty() {
        catalog.filter(&ReportFilter::Recent(cli.recent.clone()))?;
    }
    info!(
        "{} reports with {} files selected",
        catalog.len(),
        catalog.total_task_count()
    );
    Ok(catalog)
}

async fn prune(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    let mut index = DownloadIndex::load(config.index_path()).await?;
    let summary = RetentionPruner::new(config.retention()?)
        .prune(&mut index)
        .await?;
    println!(
        "Removed {} files ({} already gone)",
        summary.removed.to_string().green(),
        summary.already_missing
    );
    Ok(())
}

async fn download(
    config: &Config,
    catalog: &mut ReportCatalog,
    progress: MultiProgress,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;
    let mut index = DownloadIndex::load(config.index_path()).await?;

    if let Some(retention) = config.retention()? {
        let pruned = catalog.prune_stale(&mut index, Some(retention)).await?;
        if pruned.removed > 0 {
            info!("Pruned {} stale files before downloading", pruned.removed);
        }
    }

    let settings = config.engine_settings();
    let fetcher = Arc::new(HttpFetcher::new(settings.timeout)?);
    let engine = DownloadEngine::new(fetcher, settings)
        .with_progress(progress)
        .with_shutdown(shutdown);

    match engine.download_all(catalog, &mut index).await {
        Ok(summary) => {
            print_summary(&summary);
            println!("\n{}", "All downloads completed successfully".green());
            Ok(())
        }
        Err(e) => {
            error!("Download process failed: {}", e);
            Err(report_failure(e))
        }
    }
}

fn print_summary(summary: &DownloadSummary) {
    println!("\n{}", "Download Summary:".bold());
    println!("Files to download: {}", summary.total_tasks);
    println!("Already indexed: {}", summary.skipped);
    println!(
        "Downloaded: {} files in {} attempt(s)",
        summary.successful.to_string().green(),
        summary.attempts
    );
    println!(
        "Total data transferred: {:.2} MB",
        summary.total_bytes as f64 / 1_048_576.0
    );
    println!("Total duration: {:.2?}", summary.total_duration);
    let secs = summary.total_duration.as_secs_f64();
    if summary.total_bytes > 0 && secs > 0.0 {
        println!(
            "Average speed: {:.2} MB/s",
            (summary.total_bytes as f64 / 1_048_576.0) / secs
        );
    }

    let failures = summary
        .reports
        .iter()
        .filter(|r| r.status == TransferStatus::Failed)
        .count();
    if failures > 0 {
        println!(
            "Failed attempts: {} (retried up to {} times)",
            failures.to_string().yellow(),
            MAX_ATTEMPTS
        );
    }
}

fn report_failure(e: DownloaderError) -> anyhow::Error {
    match &e {
        DownloaderError::ExcessiveDownloadAttempts { .. } => {
            println!("\n{}", "Unresolved Files:".red().bold());
            print_unresolved(e.unresolved());
            eprintln!(
                "{}",
                "The pre-signed URLs have likely expired. Fetch a fresh listing and re-run; \
                 files already downloaded are skipped."
                    .yellow()
            );
        }
        DownloaderError::Interrupted { .. } => {
            println!("\n{}", "Interrupted, not finished:".yellow().bold());
            print_unresolved(e.unresolved());
        }
        _ => eprintln!("{}", "Download process failed".red()),
    }
    e.into()
}

fn print_unresolved(tasks: &[Task]) {
    for task in tasks {
        println!("✗ {} [{}] {}", task.report_id, task.kind, task.file_name().red());
    }
}

fn print_catalog(catalog: &ReportCatalog, detailed: bool) {
    let save_path = catalog.save_path().unwrap_or(Path::new("."));
    println!("{}", "Reports (newest first):".bold());
    for (position, report) in catalog.sorted_reports(true).iter().enumerate() {
        println!(
            "{:>3}. {} ({} files)",
            position + 1,
            report.period.label.cyan(),
            report.tasks.len()
        );
        if !detailed {
            continue;
        }
        for task in report.tasks.values() {
            let size = task
                .size_mb()
                .map(|mb| format!("{:.2} MB", mb))
                .unwrap_or_else(|| "-".to_string());
            let destination = task.destination(save_path);
            println!(
                "       {:<16} {:>12}  {}",
                task.kind,
                size,
                destination.display()
            );
        }
    }
}

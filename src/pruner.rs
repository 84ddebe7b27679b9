use chrono::{NaiveDateTime, Utc};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::DownloaderError;
use crate::index::DownloadIndex;
use crate::types::{PruneSummary, RetentionPeriod};

/// Deletes downloaded files whose index record is older than the retention
/// window and drops their records so they may be fetched again.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPruner {
    retention: Option<RetentionPeriod>,
}

impl RetentionPruner {
    pub fn new(retention: Option<RetentionPeriod>) -> Self {
        Self { retention }
    }

    pub async fn prune(&self, index: &mut DownloadIndex) -> Result<PruneSummary, DownloaderError> {
        self.prune_at(index, Utc::now().naive_utc()).await
    }

    pub async fn prune_at(
        &self,
        index: &mut DownloadIndex,
        now: NaiveDateTime,
    ) -> Result<PruneSummary, DownloaderError> {
        let retention = self.retention.ok_or(DownloaderError::NoRetentionConfigured)?;
        let stale: Vec<PathBuf> = index.stale_records_at(retention, now).collect();

        let mut summary = PruneSummary::default();
        let mut handled = Vec::with_capacity(stale.len());
        let mut failure = None;
        for path in stale {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed stale file {}", path.display());
                    summary.removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Stale file already removed: {}", path.display());
                    summary.already_missing += 1;
                }
                Err(e) => {
                    warn!("Could not remove stale file {}: {}", path.display(), e);
                    failure = Some(e);
                    break;
                }
            }
            handled.push(path);
        }

        // Records of files already gone are dropped even when the pass stops early.
        if !handled.is_empty() {
            index.remove(&handled).await?;
        }
        if let Some(e) = failure {
            return Err(DownloaderError::IoError(e));
        }
        info!(
            "Pruned {} stale files ({} already missing)",
            summary.removed, summary.already_missing
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::INDEX_FILE_NAME;
    use tempfile::TempDir;

    #[tokio::test]
    async fn removes_only_files_past_retention() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut index = DownloadIndex::load(index_path).await.unwrap();
        let now = Utc::now().naive_utc();

        let old = dir.path().join("2024/01/01/00/old.csv");
        let recent = dir.path().join("2024/01/03/23/recent.csv");
        for path in [&old, &recent] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"data").unwrap();
        }
        index.append_at(&old, now - chrono::Duration::days(3)).await.unwrap();
        index.append_at(&recent, now - chrono::Duration::hours(1)).await.unwrap();

        let pruner = RetentionPruner::new(Some("2d".parse().unwrap()));
        let summary = pruner.prune_at(&mut index, now).await.unwrap();

        assert_eq!(
            summary,
            PruneSummary {
                removed: 1,
                already_missing: 0
            }
        );
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(!index.contains(&old));
        assert!(index.contains(&recent));
    }

    #[tokio::test]
    async fn missing_files_are_not_errors() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut index = DownloadIndex::load(index_path).await.unwrap();
        let now = Utc::now().naive_utc();
        let gone = dir.path().join("gone.csv");
        index.append_at(&gone, now - chrono::Duration::weeks(2)).await.unwrap();

        let summary = RetentionPruner::new(Some("weekly".parse().unwrap()))
            .prune_at(&mut index, now)
            .await
            .unwrap();
        assert_eq!(summary.already_missing, 1);
        assert!(!index.contains(&gone));
    }

    #[tokio::test]
    async fn failed_removal_keeps_progress_made_so_far() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut index = DownloadIndex::load(&index_path).await.unwrap();
        let now = Utc::now().naive_utc();

        let old = dir.path().join("old.csv");
        std::fs::write(&old, b"data").unwrap();
        let stuck = dir.path().join("stuck.csv");
        std::fs::create_dir_all(stuck.join("inner")).unwrap();
        index.append_at(&old, now - chrono::Duration::days(5)).await.unwrap();
        index.append_at(&stuck, now - chrono::Duration::days(4)).await.unwrap();

        let err = RetentionPruner::new(Some("1d".parse().unwrap()))
            .prune_at(&mut index, now)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloaderError::IoError(_)));
        assert!(!old.exists());
        assert!(!index.contains(&old));
        assert!(index.contains(&stuck));
        let reloaded = DownloadIndex::load(&index_path).await.unwrap();
        assert!(!reloaded.contains(&old));
        assert!(reloaded.contains(&stuck));
    }

    #[tokio::test]
    async fn requires_a_retention_period() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut index = DownloadIndex::load(index_path).await.unwrap();
        let err = RetentionPruner::default().prune(&mut index).await.unwrap_err();
        assert!(matches!(err, DownloaderError::NoRetentionConfigured));
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::downloader::EngineSettings;
use crate::error::DownloaderError;
use crate::index::INDEX_FILE_NAME;
use crate::types::RetentionPeriod;

pub const STATS_FILE_NAME: &str = "download_stats.csv";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Base directory for reports, the index and the stats file.
    pub directory: PathBuf,
    /// Retention window such as `16h`, `2d` or `weekly`.
    #[serde(default)]
    pub retention_time: Option<String>,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_meta_timeout_secs")]
    pub meta_timeout_secs: u64,
    #[serde(default = "default_stats_csv")]
    pub stats_csv: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            chunk_size: default_chunk_size(),
            timeout_secs: default_timeout_secs(),
            meta_timeout_secs: default_meta_timeout_secs(),
            stats_csv: default_stats_csv(),
        }
    }
}

fn default_workers() -> usize {
    10
}
fn default_chunk_size() -> usize {
    8096
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_meta_timeout_secs() -> u64 {
    3
}
fn default_stats_csv() -> bool {
    true
}

impl Config {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            retention_time: None,
            download: DownloadConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, DownloaderError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DownloaderError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, DownloaderError> {
        let config: Config = toml::from_str(content).map_err(|e| {
            DownloaderError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        if config.download.workers == 0 {
            return Err(DownloaderError::ConfigError(
                "download.workers must be > 0".to_string(),
            ));
        }
        if config.download.chunk_size == 0 {
            return Err(DownloaderError::ConfigError(
                "download.chunk_size must be > 0".to_string(),
            ));
        }
        // Surface a bad interval at load time rather than on the first prune.
        config.retention()?;
        Ok(config)
    }

    pub fn retention(&self) -> Result<Option<RetentionPeriod>, DownloaderError> {
        self.retention_time
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    pub fn index_path(&self) -> PathBuf {
        self.directory.join(INDEX_FILE_NAME)
    }

    /// Creates the directory if needed and checks a file can be written in it.
    pub fn validate(&self) -> Result<(), DownloaderError> {
        let unwritable = |_| DownloaderError::UnwritableDirectory(self.directory.clone());
        std::fs::create_dir_all(&self.directory).map_err(unwritable)?;
        let probe = self.directory.join(".write-test");
        std::fs::write(&probe, b"").map_err(unwritable)?;
        std::fs::remove_file(&probe).map_err(unwritable)?;
        debug!("{} is writable", self.directory.display());
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            workers: self.download.workers,
            chunk_size: self.download.chunk_size,
            timeout: Duration::from_secs(self.download.timeout_secs),
            stats_path: self
                .download
                .stats_csv
                .then(|| self.directory.join(STATS_FILE_NAME)),
        }
    }

    pub fn meta_timeout(&self) -> Duration {
        Duration::from_secs(self.download.meta_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fills_download_defaults() {
        let config = Config::parse("directory = \"/data/reports\"\n").unwrap();
        assert_eq!(config.download.workers, 10);
        assert_eq!(config.download.chunk_size, 8096);
        assert_eq!(config.retention().unwrap(), None);
        assert_eq!(config.index_path(), PathBuf::from("/data/reports/history.index"));

        let settings = config.engine_settings();
        assert_eq!(settings.timeout, Duration::from_secs(20));
        assert_eq!(
            settings.stats_path,
            Some(PathBuf::from("/data/reports/download_stats.csv"))
        );
        assert_eq!(config.meta_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn reads_retention_and_overrides() {
        let config = Config::parse(
            r#"
directory = "/data"
retention_time = "2d"

[download]
workers = 4
stats_csv = false
"#,
        )
        .unwrap();
        assert_eq!(
            config.retention().unwrap(),
            Some(RetentionPeriod(chrono::Duration::days(2)))
        );
        assert_eq!(config.engine_settings().workers, 4);
        assert_eq!(config.engine_settings().stats_path, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::parse("retention_time = \"2d\"").is_err());
        assert!(matches!(
            Config::parse("directory = \"/d\"\nretention_time = \"fortnightly\""),
            Err(DownloaderError::InvalidInterval(_))
        ));
        assert!(Config::parse("directory = \"/d\"\n[download]\nworkers = 0").is_err());
    }

    #[test]
    fn validates_writable_directory() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("nested/reports"));
        config.validate().unwrap();
        assert!(dir.path().join("nested/reports").is_dir());
        assert_eq!(std::fs::read_dir(&config.directory).unwrap().count(), 0);

        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            Config::new(file).validate(),
            Err(DownloaderError::UnwritableDirectory(_))
        ));
    }
}

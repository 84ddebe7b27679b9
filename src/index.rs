//! Append-only log of destinations that have already been downloaded.
//!
//! Each line of the log is a JSON object `{"date": "<UTC %Y-%m-%d %H:%M:%S>",
//! "hash": "<base64 of the destination path>"}`. The hash is a reversible
//! encoding rather than a digest so stale entries can be mapped back to the
//! file they describe. Deduplication is by path only: a truncated file whose
//! path is indexed will not be fetched again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{NaiveDateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::DownloaderError;
use crate::types::RetentionPeriod;

pub const INDEX_FILE_NAME: &str = "history.index";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    #[serde(rename = "date", with = "record_date")]
    pub recorded_at: NaiveDateTime,
    pub hash: String,
}

mod record_date {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::DATE_FORMAT;

    pub fn serialize<S: Serializer>(date: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}

impl IndexRecord {
    pub fn new(destination: &Path, recorded_at: NaiveDateTime) -> Self {
        Self {
            recorded_at,
            hash: encode_destination(destination),
        }
    }

    /// Placeholder held by an index that has no entries yet.
    pub fn sentinel() -> Self {
        Self {
            recorded_at: now(),
            hash: String::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn destination(&self) -> Result<PathBuf, DownloaderError> {
        decode_destination(&self.hash)
    }
}

pub fn encode_destination(destination: &Path) -> String {
    STANDARD.encode(destination.to_string_lossy().as_bytes())
}

pub fn decode_destination(hash: &str) -> Result<PathBuf, DownloaderError> {
    let bytes = STANDARD
        .decode(hash)
        .map_err(|e| DownloaderError::InvalidUpdate(format!("index hash {:?}: {}", hash, e)))?;
    let path = String::from_utf8(bytes)
        .map_err(|e| DownloaderError::InvalidUpdate(format!("index hash {:?}: {}", hash, e)))?;
    Ok(PathBuf::from(path))
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Accepts both plain object lines and the older lines where the object was
/// written as a JSON string.
fn parse_line(line: &str) -> Result<IndexRecord, serde_json::Error> {
    match serde_json::from_str::<serde_json::Value>(line)? {
        serde_json::Value::String(inner) => serde_json::from_str(&inner),
        value => serde_json::from_value(value),
    }
}

#[derive(Debug)]
pub struct DownloadIndex {
    path: PathBuf,
    records: Vec<IndexRecord>,
    hashes: HashSet<String>,
}

impl DownloadIndex {
    /// Loads the log at `path`, creating an empty one if it does not exist.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, DownloaderError> {
        let path = path.into();
        let load_error = |message: String| DownloaderError::IndexLoadError {
            path: path.clone(),
            message,
        };

        if !fs::try_exists(&path).await.map_err(|e| load_error(e.to_string()))? {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| load_error(e.to_string()))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| load_error(e.to_string()))?;
            info!("Created empty index at {}", path.display());
            return Ok(Self::with_records(path, Vec::new()));
        }

        let contents = fs::read_to_string(&path)
            .await
            .map_err(|e| load_error(e.to_string()))?;
        let mut records = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_line(line)
                .map_err(|e| load_error(format!("line {}: {}", number + 1, e)))?;
            records.push(record);
        }
        debug!("Loaded {} index records from {}", records.len(), path.display());
        Ok(Self::with_records(path, records))
    }

    fn with_records(path: PathBuf, mut records: Vec<IndexRecord>) -> Self {
        if records.is_empty() {
            records.push(IndexRecord::sentinel());
        }
        let hashes = records
            .iter()
            .filter(|r| !r.is_sentinel())
            .map(|r| r.hash.clone())
            .collect();
        Self {
            path,
            records,
            hashes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn contains(&self, destination: &Path) -> bool {
        self.hashes.contains(&encode_destination(destination))
    }

    pub async fn append(&mut self, destination: &Path) -> Result<IndexRecord, DownloaderError> {
        self.append_at(destination, now()).await
    }

    pub async fn append_at(
        &mut self,
        destination: &Path,
        recorded_at: NaiveDateTime,
    ) -> Result<IndexRecord, DownloaderError> {
        let record = IndexRecord::new(destination, recorded_at);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let append_error = |source: std::io::Error| DownloaderError::IndexAppendError {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(append_error)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(append_error)?;
        file.write_all(line.as_bytes()).await.map_err(append_error)?;
        file.sync_data().await.map_err(append_error)?;

        debug!("Indexed {}", destination.display());
        self.hashes.insert(record.hash.clone());
        self.records.push(record.clone());
        Ok(record)
    }

    /// Destinations whose record is older than `retention`.
    pub fn stale_records(
        &self,
        retention: RetentionPeriod,
    ) -> impl Iterator<Item = PathBuf> + '_ {
        self.stale_records_at(retention, now())
    }

    pub fn stale_records_at(
        &self,
        retention: RetentionPeriod,
        now: NaiveDateTime,
    ) -> impl Iterator<Item = PathBuf> + '_ {
        self.records
            .iter()
            .filter(|r| !r.is_sentinel())
            .filter(move |r| now - r.recorded_at > retention.duration())
            .filter_map(|r| match r.destination() {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping undecodable index record: {}", e);
                    None
                }
            })
    }

    /// Rewrites the log without the records for `destinations`.
    pub async fn remove(&mut self, destinations: &[PathBuf]) -> Result<usize, DownloaderError> {
        let dropped: HashSet<String> = destinations
            .iter()
            .map(|d| encode_destination(d))
            .collect();
        let removed = self
            .records
            .iter()
            .filter(|r| dropped.contains(&r.hash))
            .count();
        self.records
            .retain(|r| !r.is_sentinel() && !dropped.contains(&r.hash));

        let mut contents = String::new();
        for record in &self.records {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }

        let write_error = |source: std::io::Error| DownloaderError::IndexAppendError {
            path: self.path.clone(),
            source,
        };
        let tmp = self.path.with_extension("index.tmp");
        fs::write(&tmp, contents).await.map_err(write_error)?;
        fs::rename(&tmp, &self.path).await.map_err(write_error)?;

        self.hashes.retain(|h| !dropped.contains(h));
        if self.records.is_empty() {
            self.records.push(IndexRecord::sentinel());
        }
        debug!("Removed {} records from {}", removed, self.path.display());
        Ok(removed)
    }
}

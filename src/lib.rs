//! Bulk downloader for time-bucketed reports behind short-lived pre-signed URLs.
//!
//! Downloads are deduplicated through an append-only index of destination
//! paths, and files older than a retention window can be pruned from disk.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod index;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod prober;
pub mod pruner;
pub mod types;

#[cfg(test)]
mod test_support;

pub use catalog::ReportCatalog;
pub use downloader::{DownloadEngine, EngineSettings};
pub use error::DownloaderError;
pub use index::DownloadIndex;
pub use prober::MetadataProber;
pub use pruner::RetentionPruner;

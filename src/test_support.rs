//! Fixtures shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::TermLike;

use crate::error::DownloaderError;
use crate::fetch::{redact, Fetcher, Transfer};
use crate::parser::{ListingEntry, ListingPeriod, ReportListing};

pub const KINDS: [&str; 2] = ["interfaces", "radio"];

const PARTITION_ROOT: &str =
    "https://bucket.example.com/exports/tenant%3Dacme/year%3D2017/month%3D11/day%3D20";

/// `reports` reports six hours apart on 2017-11-20, one task per kind.
pub fn sample_listing(reports: usize) -> ReportListing {
    let history = (0..reports)
        .map(|i| {
            let hour = i * 6;
            let report = KINDS
                .iter()
                .map(|kind| {
                    let url = format!(
                        "{}/hour%3D{:02}/{}.csv?X-Amz-Signature=sig{}",
                        PARTITION_ROOT, hour, kind, i
                    );
                    (kind.to_string(), Some(url))
                })
                .collect::<BTreeMap<_, _>>();
            ListingEntry {
                timestamp: format!("2017-11-20T{:02}:00:00Z", hour),
                report,
            }
        })
        .collect();
    ReportListing {
        period: Some(ListingPeriod {
            start: "2017-11-20T00:00:00Z".to_string(),
            end: "2017-11-21T00:00:00Z".to_string(),
        }),
        history,
    }
}

/// In-memory fetcher that fails URLs matching a pattern a fixed number of
/// times before serving `body`.
pub struct ScriptedFetcher {
    body: Vec<u8>,
    failures: Vec<(String, u32)>,
    truncations: Vec<(String, u32)>,
    stalls: Vec<String>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            failures: Vec::new(),
            truncations: Vec::new(),
            stalls: Vec::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fails the first `times` calls for every URL containing `pattern`.
    pub fn fail_times(mut self, pattern: &str, times: u32) -> Self {
        self.failures.push((pattern.to_string(), times));
        self
    }

    pub fn always_fail(self, pattern: &str) -> Self {
        self.fail_times(pattern, u32::MAX)
    }

    /// Cuts the body short on the first `times` calls for URLs containing `pattern`.
    pub fn truncate_times(mut self, pattern: &str, times: u32) -> Self {
        self.truncations.push((pattern.to_string(), times));
        self
    }

    /// Never answers URLs containing `pattern`.
    pub fn stall(mut self, pattern: &str) -> Self {
        self.stalls.push(pattern.to_string());
        self
    }

    pub fn calls(&self, pattern: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.contains(pattern))
            .map(|(_, n)| *n)
            .sum()
    }

    async fn answer(&self, url: &str) -> Result<u32, DownloaderError> {
        let key = redact(url).to_string();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(key).or_insert(0);
            *n += 1;
            *n
        };
        if self.stalls.iter().any(|p| url.contains(p.as_str())) {
            futures::future::pending::<()>().await;
        }
        let failing = self
            .failures
            .iter()
            .any(|(p, times)| url.contains(p.as_str()) && call <= *times);
        if failing {
            return Err(DownloaderError::DownloadError(format!(
                "scripted failure {} for {}",
                call,
                redact(url)
            )));
        }
        Ok(call)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn open(&self, url: &str) -> Result<Transfer, DownloaderError> {
        let call = self.answer(url).await?;
        let truncated = self
            .truncations
            .iter()
            .any(|(p, times)| url.contains(p.as_str()) && call <= *times);
        let served = if truncated {
            &self.body[..self.body.len() / 2]
        } else {
            &self.body[..]
        };
        let chunks: Vec<Result<Vec<u8>, DownloaderError>> =
            served.chunks(3).map(|c| Ok(c.to_vec())).collect();
        Ok(Transfer {
            content_length: Some(self.body.len() as u64),
            body: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn probe(&self, url: &str) -> Result<u64, DownloaderError> {
        self.answer(url).await?;
        Ok(self.body.len() as u64)
    }
}

/// Terminal that records every operation indicatif performs on it.
#[derive(Debug, Default)]
pub struct CaptureTerm {
    events: Arc<Mutex<Vec<String>>>,
}

impl CaptureTerm {
    pub fn events(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.events)
    }

    fn push(&self, event: String) -> io::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl TermLike for CaptureTerm {
    fn width(&self) -> u16 {
        120
    }

    fn move_cursor_up(&self, n: usize) -> io::Result<()> {
        self.push(format!("up:{}", n))
    }

    fn move_cursor_down(&self, n: usize) -> io::Result<()> {
        self.push(format!("down:{}", n))
    }

    fn move_cursor_right(&self, n: usize) -> io::Result<()> {
        self.push(format!("right:{}", n))
    }

    fn move_cursor_left(&self, n: usize) -> io::Result<()> {
        self.push(format!("left:{}", n))
    }

    fn write_line(&self, s: &str) -> io::Result<()> {
        self.push(format!("write:{}", s))
    }

    fn write_str(&self, s: &str) -> io::Result<()> {
        self.push(format!("write:{}", s))
    }

    fn clear_line(&self) -> io::Result<()> {
        self.push("clear".to_string())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

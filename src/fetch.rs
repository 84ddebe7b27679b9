use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::debug;

use crate::error::DownloaderError;

/// An opened transfer: the announced size and the body as a stream of chunks.
pub struct Transfer {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, DownloaderError>>,
}

/// Transport used by the download engine and the metadata prober.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issues the request and returns once the response headers are in.
    async fn open(&self, url: &str) -> Result<Transfer, DownloaderError>;

    /// Learns the size of the object without reading its body.
    async fn probe(&self, url: &str) -> Result<u64, DownloaderError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, DownloaderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, DownloaderError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(DownloaderError::DownloadError(format!(
                "HTTP error: {} for URL: {}",
                resp.status(),
                redact(url)
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<Transfer, DownloaderError> {
        let resp = self.get(url).await?;
        let content_length = resp.content_length();
        debug!("Opened {} ({:?} bytes)", redact(url), content_length);
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(DownloaderError::from))
            .boxed();
        Ok(Transfer {
            content_length,
            body,
        })
    }

    // Pre-signed URLs are bound to GET, so a HEAD request would be rejected.
    // The response is dropped before any of the body is read.
    async fn probe(&self, url: &str) -> Result<u64, DownloaderError> {
        let resp = self.get(url).await?;
        resp.content_length().ok_or_else(|| {
            DownloaderError::DownloadError(format!("No Content-Length for URL: {}", redact(url)))
        })
    }
}

/// Strips the query string, which carries the URL signature.
pub fn redact(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_drops_signature() {
        assert_eq!(
            redact("https://h/a/b.csv?X-Amz-Signature=secret"),
            "https://h/a/b.csv"
        );
        assert_eq!(redact("https://h/a/b.csv"), "https://h/a/b.csv");
    }
}

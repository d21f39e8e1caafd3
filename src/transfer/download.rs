//! Streamed HTTP downloads to a fixed destination path.
//!
//! This module provides the [`DownloadClient`] which handles streaming
//! downloads with proper timeout configuration and error handling. The
//! destination path is supplied by the caller; nothing here derives or
//! sanitizes filenames.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::REFERER;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::TransferError;

/// Connect timeout for new connections (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Total request timeout, covering the whole streamed body (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Responses below this byte count on an expected binary payload are logged
/// as suspicious (likely an error page served with status 200).
const SUSPICIOUS_CONTENT_FLOOR: u64 = 1024;

/// Browser-like User-Agent; some origins reject requests without one.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Byte-progress observer invoked per received chunk.
///
/// Observability only; transfer correctness never depends on it.
pub type ProgressFn<'a> = dyn Fn(u64) + Send + Sync + 'a;

/// Metadata about a completed fetch.
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// Destination the body was written to.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
    /// Server-declared content length, when present.
    pub content_length: Option<u64>,
    /// Whether the payload tripped the suspicious-content warning.
    pub suspicious: bool,
}

/// HTTP client for streaming files to disk.
///
/// Designed to be created once and reused across transfers, taking
/// advantage of connection pooling. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct DownloadClient {
    client: Client,
}

impl Default for DownloadClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadClient {
    /// Creates a client with default timeouts (30s connect, 120s request).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the supplied timeouts.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout_secs: u64, request_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(request_timeout_secs))
            .gzip(true)
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Streams `url` to `dest`, creating or truncating the file.
    ///
    /// A `referer` is attached when supplied; some origins reject
    /// referrer-less fetches. `progress` is called with the size of each
    /// received chunk.
    ///
    /// A response shorter than 1KB is logged as suspicious but still
    /// succeeds; only transport-level errors fail the fetch. On failure the
    /// partial file is left at `dest`; callers treat destination existence
    /// as "already handled", so a truncated failed file is a known hazard
    /// they must be aware of.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] if the URL is invalid, the request fails
    /// (network error, timeout, error status), or writing to disk fails.
    #[must_use = "fetch report carries the written byte count"]
    #[instrument(skip(self, progress), fields(url = %url, dest = %dest.display()))]
    pub async fn fetch_to_path(
        &self,
        url: &str,
        dest: &Path,
        referer: Option<&str>,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<FetchReport, TransferError> {
        debug!("starting fetch");

        Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;

        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            return Err(TransferError::http_status(url, response.status().as_u16()));
        }

        let content_length = response.content_length();
        let suspicious = matches!(content_length, Some(len) if len > 0 && len < SUSPICIOUS_CONTENT_FLOOR);
        if suspicious {
            warn!(
                bytes = content_length.unwrap_or(0),
                "suspiciously small payload; possibly an error page"
            );
        }

        let file = File::create(dest)
            .await
            .map_err(|e| TransferError::io(dest, e))?;

        let bytes = stream_to_file(file, response, url, dest, progress).await?;

        info!(bytes, "fetch complete");

        Ok(FetchReport {
            path: dest.to_path_buf(),
            bytes,
            content_length,
            suspicious,
        })
    }
}

/// Streams the response body to the file, returning bytes written.
///
/// No cleanup on error: the truncated file stays at `dest` (see
/// [`DownloadClient::fetch_to_path`]).
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    dest: &Path,
    progress: Option<&ProgressFn<'_>>,
) -> Result<u64, TransferError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransferError::io(dest, e))?;

        bytes_written += chunk.len() as u64;
        if let Some(progress) = progress {
            progress(chunk.len() as u64);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(dest, e))?;

    Ok(bytes_written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        let client = DownloadClient::new();
        let dest = std::env::temp_dir().join("harvester-invalid-url-test");
        let result = client
            .fetch_to_path("not a url", &dest, None, None)
            .await;
        assert!(matches!(result, Err(TransferError::InvalidUrl { .. })));
        assert!(!dest.exists(), "no file should be created for a bad URL");
    }

    #[test]
    fn test_default_builds_pooled_client() {
        let a = DownloadClient::default();
        let b = a.clone();
        // Clones share the same pool; this is just a smoke check that
        // construction with static configuration succeeds.
        drop((a, b));
    }

    #[test]
    fn test_suspicious_floor_constant() {
        assert_eq!(SUSPICIOUS_CONTENT_FLOOR, 1024);
    }
}

//! Resilient transfer pipeline: bounded-concurrency workers, retry with
//! exponential backoff, and an explicit drain barrier.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for large files)
//! - Fixed-size worker pool with per-item drain timeouts
//! - Transient/permanent failure classification with backoff + jitter
//! - Aggregate counters behind a single exclusive-access boundary
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//! use harvester_core::transfer::{
//!     DownloadClient, RetryPolicy, TransferManager, TransferRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = TransferManager::new(3, RetryPolicy::default(), DownloadClient::new())?;
//! manager.submit(TransferRequest::Download {
//!     url: "https://example.com/lesson.pdf".into(),
//!     referer: None,
//!     dest: PathBuf::from("./harvest/course/lesson/lesson.pdf"),
//! });
//! let report = manager.drain(Duration::from_secs(300)).await;
//! println!("completed {}, failed {}", report.counters.completed, report.counters.failed);
//! # Ok(())
//! # }
//! ```

mod download;
mod error;
mod manager;
mod retry;

pub use download::{CONNECT_TIMEOUT_SECS, DownloadClient, FetchReport, REQUEST_TIMEOUT_SECS};
pub use error::TransferError;
pub use manager::{
    DEFAULT_ITEM_TIMEOUT, DEFAULT_WORKERS, DrainReport, ManagerError, TransferCounters,
    TransferManager, TransferOutcome, TransferRequest, TransferStatus,
};
pub use retry::{
    Attempted, DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryError, RetryExecutor,
    RetryPolicy, classify_error, classify_http_status,
};

//! Bounded transfer pool with an explicit drain barrier.
//!
//! The [`TransferManager`] accepts transfer requests, deduplicates them
//! against existing output, runs them on a fixed pool of workers, and tracks
//! a single counter aggregate. Retries happen strictly one layer below,
//! inside the per-worker [`RetryExecutor`] loop; the manager itself never
//! resubmits.
//!
//! # Concurrency Model
//!
//! - Each transfer runs in its own Tokio task
//! - A semaphore permit bounds how many run at once (default 3, to keep
//!   outbound connection pressure low enough not to trip origin defenses)
//! - All counter mutation goes through one mutex-held aggregate
//! - [`TransferManager::drain`] is the only barrier: it resolves every
//!   previously submitted request, applying a per-item timeout that records
//!   the item as failed without cancelling the underlying I/O
//!
//! # Known hazard
//!
//! The destination pre-check in [`TransferManager::submit`] is best-effort
//! and not synchronized against other in-flight submissions for the same
//! key: two near-simultaneous submissions for one destination can both
//! proceed. By convention each destination is submitted once per walk, so
//! this stays a documented hazard rather than a lock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::download::DownloadClient;
use super::retry::{RetryExecutor, RetryPolicy, classify_error};
use crate::store::ObjectStore;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 3;

/// Minimum allowed pool size.
const MIN_WORKERS: usize = 1;

/// Maximum allowed pool size.
const MAX_WORKERS: usize = 20;

/// Default per-item drain timeout (5 minutes).
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for manager construction and use.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Invalid worker pool size.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkerCount {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// One unit of transfer work. Immutable once created.
#[derive(Debug, Clone)]
pub enum TransferRequest {
    /// Streamed fetch from a URL to a local file.
    Download {
        /// Source URL.
        url: String,
        /// Referrer header to attach; some origins reject without one.
        referer: Option<String>,
        /// Exact local destination path.
        dest: PathBuf,
    },
    /// Chunked resumable push of a local file into a remote folder.
    Upload {
        /// Local file to push.
        local: PathBuf,
        /// Remote folder id to push into.
        folder_id: String,
    },
}

impl TransferRequest {
    /// Human-facing destination name, used for failure reporting.
    #[must_use]
    pub fn destination_label(&self) -> String {
        match self {
            Self::Download { dest, .. } => dest
                .file_name()
                .map_or_else(|| dest.display().to_string(), |n| n.to_string_lossy().into_owned()),
            Self::Upload { local, .. } => local
                .file_name()
                .map_or_else(|| local.display().to_string(), |n| n.to_string_lossy().into_owned()),
        }
    }

    /// Best-effort check whether the request's output already exists.
    ///
    /// Downloads check the destination path. Uploads always pass; the store
    /// performs its own duplicate check against the remote folder.
    fn already_satisfied(&self) -> bool {
        match self {
            Self::Download { dest, .. } => dest.exists(),
            Self::Upload { .. } => false,
        }
    }
}

/// Terminal status of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished and its output is in place.
    Succeeded,
    /// The transfer failed terminally (after retries, if any applied).
    Failed,
}

/// Result of one finished transfer.
#[derive(Debug)]
pub struct TransferOutcome {
    /// The request this outcome belongs to.
    pub request: TransferRequest,
    /// Terminal status.
    pub status: TransferStatus,
    /// Attempts made, including the final one.
    pub attempts: u32,
    /// The terminal error; present exactly when `status` is `Failed`.
    pub error: Option<String>,
}

/// The counter aggregate. Mutated only under the manager's mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    /// Requests accepted (dropped duplicates excluded).
    pub total: u64,
    /// Requests that finished successfully.
    pub completed: u64,
    /// Requests that failed terminally or exceeded the drain timeout.
    pub failed: u64,
}

impl TransferCounters {
    /// Requests accepted but not yet resolved.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.total.saturating_sub(self.completed + self.failed)
    }
}

/// Aggregate result of a drain: a counter snapshot plus the destinations
/// that failed since the previous drain (each reported exactly once).
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Counter snapshot taken after the barrier.
    pub counters: TransferCounters,
    /// Destination labels that failed since the last drain.
    pub failures: Vec<String>,
}

/// State shared between the manager, its worker tasks, and drains.
#[derive(Debug, Default)]
struct SharedState {
    counters: Mutex<TransferCounters>,
    failures: Mutex<Vec<String>>,
    bytes: AtomicU64,
}

impl SharedState {
    fn lock_counters(&self) -> std::sync::MutexGuard<'_, TransferCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failure(&self, label: String) {
        self.lock_counters().failed += 1;
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(label);
    }

    fn record_success(&self) {
        self.lock_counters().completed += 1;
    }

    fn take_failures(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// A submitted transfer awaiting the next drain.
#[derive(Debug)]
struct PendingTransfer {
    label: String,
    /// Claimed by whichever side resolves the item first: the worker task on
    /// completion, or a drain on per-item timeout. Guarantees each transfer
    /// is counted exactly once.
    claimed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Bounded worker pool for downloads and uploads.
///
/// See the module docs for the concurrency model and the dedup hazard.
#[derive(Debug)]
pub struct TransferManager {
    semaphore: Arc<Semaphore>,
    workers: usize,
    state: Arc<SharedState>,
    pending: Mutex<Vec<PendingTransfer>>,
    client: DownloadClient,
    store: Option<Arc<ObjectStore>>,
    executor: RetryExecutor,
    closed: AtomicBool,
}

impl TransferManager {
    /// Creates a manager with a fixed pool size and retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InvalidWorkerCount`] if `workers` is outside
    /// 1..=20.
    #[instrument(level = "debug", skip(retry_policy, client))]
    pub fn new(
        workers: usize,
        retry_policy: RetryPolicy,
        client: DownloadClient,
    ) -> Result<Self, ManagerError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(ManagerError::InvalidWorkerCount { value: workers });
        }

        debug!(
            workers,
            max_attempts = retry_policy.max_attempts(),
            "creating transfer manager"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            state: Arc::new(SharedState::default()),
            pending: Mutex::new(Vec::new()),
            client,
            store: None,
            executor: RetryExecutor::new(retry_policy),
            closed: AtomicBool::new(false),
        })
    }

    /// Attaches a remote store, enabling upload requests.
    #[must_use]
    pub fn with_store(mut self, store: Arc<ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Returns the configured pool size.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns a snapshot of the counter aggregate.
    #[must_use]
    pub fn counters(&self) -> TransferCounters {
        *self.state.lock_counters()
    }

    /// Total bytes received by download workers so far (observability only).
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.state.bytes.load(Ordering::Relaxed)
    }

    /// Accepts a transfer request; returns immediately.
    ///
    /// If the destination already exists at call time the request is
    /// silently dropped (already satisfied) and `total` does not move.
    /// Otherwise the request is counted and handed to the pool. Must be
    /// called from within a Tokio runtime, and never after
    /// [`TransferManager::shutdown`].
    #[instrument(level = "debug", skip(self, request), fields(destination = %request.destination_label()))]
    pub fn submit(&self, request: TransferRequest) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("submit after shutdown ignored");
            return;
        }

        if request.already_satisfied() {
            debug!("destination already present, skipping");
            return;
        }

        self.state.lock_counters().total += 1;

        let label = request.destination_label();
        let claimed = Arc::new(AtomicBool::new(false));

        let semaphore = Arc::clone(&self.semaphore);
        let state = Arc::clone(&self.state);
        let client = self.client.clone();
        let store = self.store.clone();
        let executor = self.executor.clone();
        let task_claimed = Arc::clone(&claimed);
        let task_label = label.clone();

        let handle = tokio::spawn(async move {
            // Semaphore is never closed while the manager lives; an Err here
            // only happens during teardown, where abandoning is correct.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            let outcome = run_transfer(&client, store.as_deref(), &executor, &state, request).await;

            if task_claimed.swap(true, Ordering::SeqCst) {
                // A drain already gave up on this item; its late outcome is
                // discarded so the counters stay consistent.
                debug!(destination = %task_label, "late outcome discarded after drain timeout");
                return;
            }

            match outcome.status {
                TransferStatus::Succeeded => {
                    debug!(destination = %task_label, attempts = outcome.attempts, "transfer complete");
                    state.record_success();
                }
                TransferStatus::Failed => {
                    warn!(
                        destination = %task_label,
                        attempts = outcome.attempts,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "transfer failed"
                    );
                    state.record_failure(task_label);
                }
            }
        });

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingTransfer {
                label,
                claimed,
                handle,
            });
    }

    /// Blocks until every previously submitted request has resolved or
    /// exceeded `per_item_timeout`.
    ///
    /// A timed-out item is recorded as failed and abandoned: the underlying
    /// I/O keeps running detached and its eventual outcome is discarded. On
    /// return, `completed + failed == total`. Calling drain again with no
    /// new submissions returns immediately.
    #[instrument(skip(self))]
    pub async fn drain(&self, per_item_timeout: Duration) -> DrainReport {
        let pending = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        if !pending.is_empty() {
            info!(in_flight = pending.len(), "waiting for in-flight transfers");
        }

        for item in pending {
            let PendingTransfer {
                label,
                claimed,
                handle,
            } = item;

            match tokio::time::timeout(per_item_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    // A panicked worker still has to resolve its item.
                    if !claimed.swap(true, Ordering::SeqCst) {
                        warn!(destination = %label, error = %join_error, "transfer task panicked");
                        self.state.record_failure(label);
                    }
                }
                Err(_elapsed) => {
                    if !claimed.swap(true, Ordering::SeqCst) {
                        warn!(
                            destination = %label,
                            timeout_secs = per_item_timeout.as_secs(),
                            "transfer exceeded per-item timeout, abandoning"
                        );
                        self.state.record_failure(label);
                    }
                }
            }
        }

        let counters = self.counters();
        let failures = self.state.take_failures();

        info!(
            completed = counters.completed,
            failed = counters.failed,
            total = counters.total,
            "transfers drained"
        );

        DrainReport { counters, failures }
    }

    /// Final drain, after which the manager accepts no further submissions.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, per_item_timeout: Duration) -> DrainReport {
        self.closed.store(true, Ordering::SeqCst);
        let report = self.drain(per_item_timeout).await;
        debug!("transfer manager shut down");
        report
    }
}

/// Runs one transfer to its terminal outcome. Download retries are driven by
/// the shared executor; uploads carry their own chunk-level retry inside the
/// store client.
async fn run_transfer(
    client: &DownloadClient,
    store: Option<&ObjectStore>,
    executor: &RetryExecutor,
    state: &SharedState,
    request: TransferRequest,
) -> TransferOutcome {
    match request {
        TransferRequest::Download { url, referer, dest } => {
            let progress = |n: u64| {
                state.bytes.fetch_add(n, Ordering::Relaxed);
            };
            let result = executor
                .execute(
                    || client.fetch_to_path(&url, &dest, referer.as_deref(), Some(&progress)),
                    classify_error,
                )
                .await;

            let request = TransferRequest::Download { url, referer, dest };
            match result {
                Ok(attempted) => TransferOutcome {
                    request,
                    status: TransferStatus::Succeeded,
                    attempts: attempted.attempts,
                    error: None,
                },
                Err(retry_error) => {
                    let attempts = retry_error.attempts();
                    let error = retry_error.to_string();
                    TransferOutcome {
                        request,
                        status: TransferStatus::Failed,
                        attempts,
                        error: Some(error),
                    }
                }
            }
        }
        TransferRequest::Upload { local, folder_id } => {
            let result = match store {
                Some(store) => store
                    .upload_file(&local, &folder_id)
                    .await
                    .map(|_id| ())
                    .map_err(|e| e.to_string()),
                None => Err("no remote store configured for upload".to_string()),
            };

            let request = TransferRequest::Upload { local, folder_id };
            match result {
                Ok(()) => TransferOutcome {
                    request,
                    status: TransferStatus::Succeeded,
                    attempts: 1,
                    error: None,
                },
                Err(error) => TransferOutcome {
                    request,
                    status: TransferStatus::Failed,
                    attempts: 1,
                    error: Some(error),
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_manager(workers: usize) -> Result<TransferManager, ManagerError> {
        TransferManager::new(workers, RetryPolicy::default(), DownloadClient::new())
    }

    #[test]
    fn test_manager_new_valid_worker_counts() {
        assert_eq!(test_manager(1).unwrap().workers(), 1);
        assert_eq!(test_manager(3).unwrap().workers(), 3);
        assert_eq!(test_manager(20).unwrap().workers(), 20);
    }

    #[test]
    fn test_manager_new_invalid_worker_count_zero() {
        let result = test_manager(0);
        assert!(matches!(
            result,
            Err(ManagerError::InvalidWorkerCount { value: 0 })
        ));
    }

    #[test]
    fn test_manager_new_invalid_worker_count_too_high() {
        let result = test_manager(21);
        assert!(matches!(
            result,
            Err(ManagerError::InvalidWorkerCount { value: 21 })
        ));
    }

    #[test]
    fn test_counters_default_and_outstanding() {
        let counters = TransferCounters::default();
        assert_eq!(counters.total, 0);
        assert_eq!(counters.completed, 0);
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.outstanding(), 0);

        let counters = TransferCounters {
            total: 5,
            completed: 2,
            failed: 1,
        };
        assert_eq!(counters.outstanding(), 2);
    }

    #[test]
    fn test_destination_label_for_download() {
        let request = TransferRequest::Download {
            url: "https://example.com/a.pdf".into(),
            referer: None,
            dest: PathBuf::from("/tmp/course/lesson/a.pdf"),
        };
        assert_eq!(request.destination_label(), "a.pdf");
    }

    #[test]
    fn test_destination_label_for_upload() {
        let request = TransferRequest::Upload {
            local: PathBuf::from("/tmp/course/lesson/video.mp4"),
            folder_id: "folder123".into(),
        };
        assert_eq!(request.destination_label(), "video.mp4");
    }

    #[tokio::test]
    async fn test_submit_skips_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("already-there.pdf");
        std::fs::write(&dest, b"previous run").unwrap();

        let manager = test_manager(3).unwrap();
        manager.submit(TransferRequest::Download {
            url: "https://example.com/already-there.pdf".into(),
            referer: None,
            dest,
        });

        assert_eq!(manager.counters().total, 0, "existing destination is a no-op");
    }

    #[tokio::test]
    async fn test_drain_with_no_submissions_returns_immediately() {
        let manager = test_manager(3).unwrap();
        let report = manager.drain(Duration::from_secs(1)).await;
        assert_eq!(report.counters, TransferCounters::default());
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_store_fails_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("file.bin");
        std::fs::write(&local, b"data").unwrap();

        let manager = test_manager(1).unwrap();
        manager.submit(TransferRequest::Upload {
            local,
            folder_id: "folder".into(),
        });

        let report = manager.drain(Duration::from_secs(5)).await;
        assert_eq!(report.counters.total, 1);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.failures, vec!["file.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_ignored() {
        let manager = test_manager(1).unwrap();
        manager.shutdown(Duration::from_secs(1)).await;

        manager.submit(TransferRequest::Download {
            url: "https://example.com/late.pdf".into(),
            referer: None,
            dest: PathBuf::from("/tmp/late.pdf"),
        });

        assert_eq!(manager.counters().total, 0);
    }
}

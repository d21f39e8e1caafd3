//! Progress UI (spinner) for harvest runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use harvester_core::TransferManager;
use indicatif::{ProgressBar, ProgressStyle};

/// Spawns the progress UI (spinner) when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    manager: Arc<TransferManager>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner_inner(manager, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner_inner(
    manager: Arc<TransferManager>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let counters = manager.counters();
            let done = counters.completed + counters.failed;
            let mib = manager.bytes_transferred() / (1024 * 1024);

            spinner.set_message(format!(
                "[{}/{}] transferring... ({} MiB received)",
                done, counters.total, mib
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        spinner.finish_and_clear();
    })
}

#[cfg(test)]
mod tests {
    use super::spawn_progress_ui;
    use harvester_core::{DownloadClient, RetryPolicy, TransferManager};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn test_manager() -> Arc<TransferManager> {
        Arc::new(TransferManager::new(3, RetryPolicy::default(), DownloadClient::new()).unwrap())
    }

    #[tokio::test]
    async fn spawn_progress_ui_when_disabled_returns_none_handle_and_stop_already_true() {
        let (handle, stop) = spawn_progress_ui(false, test_manager());

        assert!(handle.is_none());
        assert!(
            stop.load(Ordering::SeqCst),
            "stop signal should be true when spinner disabled"
        );
    }

    #[tokio::test]
    async fn spawn_progress_ui_when_enabled_returns_handle_and_stop_and_stop_ends_task() {
        let (handle, stop) = spawn_progress_ui(true, test_manager());

        assert!(
            handle.is_some(),
            "handle should be Some when spinner enabled"
        );
        assert!(
            !stop.load(Ordering::SeqCst),
            "stop should be false initially"
        );

        stop.store(true, Ordering::SeqCst);
        let join_handle = handle.unwrap();
        let _ = join_handle.await;
        // If we get here without hanging, the spinner task exited on stop signal
    }
}

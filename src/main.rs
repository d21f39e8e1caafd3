//! CLI entry point for the harvester tool.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::harvest::DEFAULT_DRAIN_EVERY;
use harvester_core::{
    DownloadClient, HarvestOptions, Harvester, ManifestDiscovery, ObjectStore, ProgressLedger,
    RetryPolicy, StoredToken, TransferManager, spawn_interrupt_watcher,
};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Harvester starting");

    // Setup phase. Every failure below aborts the run (exit 1) before any
    // transfer is attempted.
    std::fs::create_dir_all(&args.download_dir).with_context(|| {
        format!(
            "could not create download directory {}",
            args.download_dir.display()
        )
    })?;
    info!(dir = %args.download_dir.display(), "download directory ready");

    let mut discovery =
        ManifestDiscovery::from_path(&args.manifest).context("could not load course manifest")?;

    let ledger_path = ProgressLedger::path_in(&args.download_dir);
    let ledger = if args.reset {
        ProgressLedger::reset()
    } else {
        ProgressLedger::load(&ledger_path)
    };

    let store = match &args.mirror {
        Some(folder) => {
            let token = StoredToken::load(&args.token_file)
                .context("mirroring requested but no usable credential")?;
            info!(folder = %folder, "remote mirroring enabled");
            Some(Arc::new(ObjectStore::new(Arc::new(token))))
        }
        None => None,
    };

    let workers = if args.no_parallel {
        info!("parallel transfers disabled");
        1
    } else {
        usize::from(args.concurrency)
    };
    let retry_policy = RetryPolicy::with_max_attempts(u32::from(args.max_retries));

    let mut manager = TransferManager::new(workers, retry_policy, DownloadClient::new())?;
    if let Some(store) = &store {
        manager = manager.with_store(Arc::clone(store));
    }
    let manager = Arc::new(manager);

    let options = HarvestOptions {
        download_dir: args.download_dir.clone(),
        drain_every: if args.no_parallel {
            1
        } else {
            DEFAULT_DRAIN_EVERY
        },
        item_timeout: Duration::from_secs(args.item_timeout),
        login_wait: Duration::from_secs(args.wait_time),
        headless: args.headless,
        mirror_folder: args.mirror.clone(),
    };

    let mut harvester = Harvester::new(Arc::clone(&manager), ledger, options);
    if let Some(store) = store {
        harvester = harvester.with_store(store);
    }

    let _watcher = spawn_interrupt_watcher(harvester.interrupt_flag());
    let (ui_handle, ui_stop) =
        progress::spawn_progress_ui(!args.quiet && !args.headless, Arc::clone(&manager));

    // Only setup-class discovery failures (e.g. an interactive login in
    // headless mode) propagate out of the run; item failures stay inside.
    let run_result = harvester.run(&mut discovery).await;

    ui_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = ui_handle {
        let _ = handle.await;
    }

    let report = run_result?;

    info!(
        completed = report.counters.completed,
        failed = report.counters.failed,
        total = report.counters.total,
        interrupted = report.interrupted,
        "harvest complete"
    );
    for name in &report.failures {
        warn!(destination = %name, "failed permanently");
    }

    // Partial item failures are reported above, not escalated to the exit
    // code: only setup failures and the `?`s above end with a non-zero exit.
    Ok(())
}

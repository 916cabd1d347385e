use super::stats::DrainReport;
use crate::core::{CacheError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Something the background worker can drain.
pub trait Drainable: Clone + Send + Sync + 'static {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// One drain pass; may block on store I/O.
    fn drain(&self) -> Result<DrainReport>;
}

#[derive(Debug, Default)]
struct WorkerCounters {
    ticks: AtomicU64,
    errors: AtomicU64,
}

/// Background worker that runs drain passes so idle entries get paged out
/// even when no caller thread is around to piggy-back on.
pub struct PageOutWorker {
    counters: Arc<WorkerCounters>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PageOutWorker {
    /// Completed drain passes.
    pub fn ticks(&self) -> u64 {
        self.counters.ticks.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| CacheError::Worker(format!("page-out worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for PageOutWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns a page-out worker on the current Tokio runtime.
///
/// The worker exits on `stop()`, on drop, or once the source reports closed.
pub fn spawn_page_out_worker<S: Drainable>(source: S, interval: Duration) -> Result<PageOutWorker> {
    let runtime = Handle::try_current()
        .map_err(|err| CacheError::Worker(format!("no Tokio runtime available: {}", err)))?;
    let interval = interval.max(Duration::from_millis(10));

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let counters = Arc::new(WorkerCounters::default());
    let counters_for_worker = Arc::clone(&counters);

    let join_handle = runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    if !source.is_open() {
                        debug!(cache = source.label(), "cache closed, page-out worker exiting");
                        break;
                    }
                    let pass = source.clone();
                    match tokio::task::spawn_blocking(move || pass.drain()).await {
                        Ok(Ok(report)) => {
                            counters_for_worker.ticks.fetch_add(1, Ordering::Relaxed);
                            if !report.is_idle() {
                                debug!(
                                    cache = source.label(),
                                    paged_out = report.paged_out,
                                    write_throughs = report.write_throughs,
                                    failed = report.failed,
                                    "page-out worker pass"
                                );
                            }
                        }
                        Ok(Err(err)) => {
                            counters_for_worker.errors.fetch_add(1, Ordering::Relaxed);
                            if matches!(err, CacheError::Closed(_)) {
                                break;
                            }
                            warn!(cache = source.label(), "page-out worker pass failed: {}", err);
                        }
                        Err(err) => {
                            counters_for_worker.errors.fetch_add(1, Ordering::Relaxed);
                            error!(cache = source.label(), "page-out worker task failed: {}", err);
                        }
                    }
                }
            }
        }
    });

    Ok(PageOutWorker {
        counters,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}

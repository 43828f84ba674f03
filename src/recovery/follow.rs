// Hot-follow: after cold recovery, keep tailing the wal directory on a
// dedicated thread until the system is finalized for serving.
//
// Correctness rests on the periodic directory rescan; watching the
// current file for growth is only a fast path, never a requirement.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::{Result, WalError};
use super::{RecoveryController, RowHandler, ScanOutcome};

/// A recovery controller running in follow mode. Finalizing stops the
/// thread, runs one last catch-up scan, and hands the controller back.
pub struct FollowHandle<H> {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<Result<RecoveryController<H>>>,
}

impl<H: RowHandler + Send + 'static> RecoveryController<H> {
    /// Move the controller onto a follower thread that keeps replaying
    /// new wal rows as they appear on disk.
    pub fn follow(self) -> Result<FollowHandle<H>> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("wal_follower".into())
            .spawn(move || run_follow(self, thread_stop))?;
        Ok(FollowHandle { stop, thread })
    }
}

impl<H: RowHandler> FollowHandle<H> {
    /// Stop following, catch any final appends, and warn if the tail
    /// file was not cleanly closed.
    pub fn finalize(self) -> Result<RecoveryController<H>> {
        self.stop.store(true, Ordering::Relaxed);
        let mut controller = self
            .thread
            .join()
            .map_err(|_| WalError::Recovery("wal follower panicked".into()))??;
        controller.finalize()?;
        Ok(controller)
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).map(|m| m.len()).ok()
}

fn run_follow<H: RowHandler>(
    mut controller: RecoveryController<H>,
    stop: Arc<AtomicBool>,
) -> Result<RecoveryController<H>> {
    let rescan_delay =
        Duration::from_secs_f64(controller.config.wal_dir_rescan_delay.max(0.001));
    let tick = (rescan_delay / 10).max(Duration::from_millis(1));

    info!("following wal directory");
    let mut last_rescan = Instant::now();
    let mut last_size = controller.current_wal_path().as_deref().and_then(file_size);

    while !stop.load(Ordering::Relaxed) {
        // fast path: the current wal grew (or was truncated away)
        if let Some(path) = controller.current_wal_path() {
            let size = file_size(&path);
            if size != last_size {
                last_size = size;
                if controller.scan_current()? == Some(ScanOutcome::Eof) {
                    // tail closed cleanly; look for its successor now
                    // instead of waiting out the rescan period
                    controller.recover_remaining_wals()?;
                    last_rescan = Instant::now();
                    last_size = controller.current_wal_path().as_deref().and_then(file_size);
                }
            }
        }

        if last_rescan.elapsed() >= rescan_delay {
            controller.recover_remaining_wals()?;
            last_rescan = Instant::now();
            last_size = controller.current_wal_path().as_deref().and_then(file_size);
        }

        thread::sleep(tick);
    }

    Ok(controller)
}

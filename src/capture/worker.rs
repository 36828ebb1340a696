//! The capture worker: one blocking thread driving a [`CaptureSource`].
//!
//! Started when the active-client count goes 0→1 and signalled to stop on
//! the 1→0 transition, so the capture facility (which may pin GPU
//! resources) never runs idle. The worker owns the only write path into the
//! [`FrameStore`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CaptureOutcome, CaptureSource, DirtySet, PixelOrder};
use crate::store::FrameStore;

/// Consecutive acquire failures tolerated before the worker tears down.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Upper bound on the error backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Where the capture worker currently is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CaptureStatus {
    /// Opening the source.
    Starting,
    /// Source opened; the store reflects the reported display mode.
    Running {
        /// Display width.
        width: u16,
        /// Display height.
        height: u16,
    },
    /// The source could not be opened.
    Failed(String),
    /// The worker has exited.
    Stopped,
}

/// Pacing parameters for the worker loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureSettings {
    /// Timeout handed to each acquire call.
    pub acquire_timeout: Duration,
    /// Pause between loop iterations, derived from `max_fps`.
    pub frame_interval: Duration,
}

/// Handle to a running capture worker.
#[derive(Debug)]
pub(crate) struct CaptureWorker {
    stop: Arc<AtomicBool>,
    status: watch::Receiver<CaptureStatus>,
    handle: JoinHandle<()>,
}

impl CaptureWorker {
    /// Subscribes to the worker's lifecycle status.
    pub(crate) fn status(&self) -> watch::Receiver<CaptureStatus> {
        self.status.clone()
    }

    /// Signals the worker to exit. Safe to call from sync contexts; the
    /// worker observes the flag within one acquire timeout.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the worker has been told to stop or has already exited.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.handle.is_finished()
    }

    /// Stops the worker and joins it.
    pub(crate) async fn stop(self) {
        self.request_stop();
        if tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .is_err()
        {
            warn!("capture worker did not exit in time");
        }
    }
}

/// Spawns the capture worker on a dedicated blocking thread.
///
/// `report_error` is invoked when the worker gives up (failed open or the
/// consecutive-error cap); transient failures are only logged.
pub(crate) fn spawn(
    mut source: Box<dyn CaptureSource>,
    store: Arc<FrameStore>,
    running: Arc<AtomicBool>,
    settings: CaptureSettings,
    report_error: Box<dyn Fn(String) + Send>,
) -> CaptureWorker {
    let stop = Arc::new(AtomicBool::new(false));
    let (status_tx, status_rx) = watch::channel(CaptureStatus::Starting);

    let stop_flag = Arc::clone(&stop);
    let handle = tokio::task::spawn_blocking(move || {
        run_loop(
            source.as_mut(),
            &store,
            &running,
            &stop_flag,
            settings,
            &status_tx,
            report_error.as_ref(),
        );
        status_tx.send_replace(CaptureStatus::Stopped);
    });

    CaptureWorker {
        stop,
        status: status_rx,
        handle,
    }
}

fn run_loop(
    source: &mut dyn CaptureSource,
    store: &FrameStore,
    running: &AtomicBool,
    stop: &AtomicBool,
    settings: CaptureSettings,
    status: &watch::Sender<CaptureStatus>,
    report_error: &(dyn Fn(String) + Send),
) {
    let mode = match source.open() {
        Ok(mode) => mode,
        Err(e) => {
            error!("capture source failed to open: {}", e);
            status.send_replace(CaptureStatus::Failed(e.to_string()));
            report_error(format!("screen capture unavailable: {e}"));
            return;
        }
    };

    // The store is sized to the true display mode before the first commit,
    // while no session can observe a committed generation yet.
    store.resize_blocking(mode.width, mode.height);
    status.send_replace(CaptureStatus::Running {
        width: mode.width,
        height: mode.height,
    });
    info!(
        "screen capture started at {}x{}",
        mode.width, mode.height
    );

    let mut frames: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    while running.load(Ordering::Acquire) && !stop.load(Ordering::Acquire) {
        match source.acquire(settings.acquire_timeout) {
            Ok(CaptureOutcome::Frame(delta)) => {
                consecutive_errors = 0;
                let mut pixels = delta.pixels;
                if mode.order == PixelOrder::Bgra {
                    super::convert::bgra_to_rgba_in_place(&mut pixels);
                }
                let rects = match delta.dirty {
                    DirtySet::Full => Vec::new(),
                    DirtySet::Rects(rects) => rects,
                };
                match store.commit_blocking(pixels, rects) {
                    Ok(generation) => {
                        frames += 1;
                        if frames % 300 == 0 {
                            debug!("capture at generation {}", generation);
                        }
                    }
                    Err(e) => warn!("dropping frame: {}", e),
                }
            }
            Ok(CaptureOutcome::Timeout) => {}
            Ok(CaptureOutcome::ModeChanged { width, height }) => {
                warn!(
                    "display mode changed to {}x{}, stopping capture",
                    width, height
                );
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "capture error ({}/{}): {}",
                    consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    report_error(format!("screen capture failing persistently: {e}"));
                    break;
                }
                let backoff = Duration::from_millis(100) * consecutive_errors;
                std::thread::sleep(backoff.min(MAX_BACKOFF));
                continue;
            }
        }

        std::thread::sleep(settings.frame_interval);
    }

    source.close();
    info!("capture worker exited after {} frames", frames);
}

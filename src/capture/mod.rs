//! Screen capture engine.
//!
//! The engine is split along the OS-abstraction seam: a blocking
//! [`CaptureSource`] capability that talks to the platform's capture
//! facility, and a worker loop ([`worker`], crate-internal) that runs the
//! source on a dedicated thread, normalizes pixel order, and commits frames
//! into the shared [`FrameStore`](crate::store::FrameStore).
//!
//! The shipped source is [`MonitorSource`], built on the cross-platform
//! `xcap` crate; a desktop-duplication source on Windows would implement
//! the same trait and report [`PixelOrder::Bgra`].

mod convert;
mod monitor;
pub(crate) mod worker;

pub use convert::bgra_to_rgba_in_place;
pub use monitor::MonitorSource;

use std::time::Duration;

use thiserror::Error;

use crate::store::Rect;

/// Byte order of the pixels a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrder {
    /// `B, G, R, A` per pixel, as desktop-duplication facilities produce;
    /// normalized by the worker before commit.
    Bgra,
    /// `R, G, B, A` per pixel, already the store's native order.
    Rgba,
}

/// The display mode a source reports when opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    /// Display width in pixels.
    pub width: u16,
    /// Display height in pixels.
    pub height: u16,
    /// Native byte order of acquired frames.
    pub order: PixelOrder,
}

/// Which parts of a frame changed since the previous acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtySet {
    /// The whole surface should be treated as changed.
    Full,
    /// Explicit changed regions. May be empty when the facility produced a
    /// frame without metadata; the store substitutes a full-surface rect.
    Rects(Vec<Rect>),
}

/// A successfully acquired frame.
#[derive(Debug)]
pub struct FrameDelta {
    /// The complete current frame in the source's native order,
    /// `width * height * 4` bytes.
    pub pixels: Vec<u8>,
    /// Regions that changed since the previous successful acquire.
    pub dirty: DirtySet,
}

/// Result of one acquire call.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// A new frame is available.
    Frame(FrameDelta),
    /// The screen has not changed within the timeout. Not an error.
    Timeout,
    /// The display mode changed. Fatal to the capture worker; the next
    /// worker start observes the new mode.
    ModeChanged {
        /// New display width.
        width: u16,
        /// New display height.
        height: u16,
    },
}

/// Errors reported by capture sources.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture facility could not be initialized.
    #[error("capture init failed: {0}")]
    Init(String),

    /// Acquiring a frame failed. Recoverable: the worker retries with
    /// backoff up to a cap.
    #[error("frame acquisition failed: {0}")]
    Acquire(String),
}

/// A blocking capture capability.
///
/// The worker drives this from a dedicated OS thread, so implementations
/// may block inside `acquire` up to the given timeout. Dirty rects describe
/// only what changed since the previous successful acquire; the backing
/// frame must always reflect the current display contents.
pub trait CaptureSource: Send {
    /// Initializes the facility and reports the display mode.
    fn open(&mut self) -> Result<DisplayMode, CaptureError>;

    /// Waits up to `timeout` for the next frame.
    fn acquire(&mut self, timeout: Duration) -> Result<CaptureOutcome, CaptureError>;

    /// Releases platform resources. Called exactly once per successful
    /// `open`, including on error paths.
    fn close(&mut self);
}

/// Factory producing a fresh source for each capture-worker start.
pub type CaptureFactory = Box<dyn Fn() -> Box<dyn CaptureSource> + Send + Sync>;

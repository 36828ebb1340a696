//! Shared framebuffer store and dirty rectangle tracking.
//!
//! The [`FrameStore`] is the single point of coordination between the
//! capture worker (the one writer) and the session tasks (many readers). A
//! committed frame is a tuple of pixel data, dirty rectangles and a
//! monotonically increasing generation counter; readers always observe a
//! consistent tuple, and a `tokio::sync::watch` channel wakes sessions that
//! are parked waiting for a newer generation.
//!
//! Pixel data is stored as RGBA32 regardless of the capture source's native
//! byte order; the wire byte order is produced at emission time by
//! [`crate::encoding`].

use thiserror::Error;
use tokio::sync::{watch, RwLock, RwLockReadGuard};

/// Bytes per stored pixel (RGBA32).
pub const BYTES_PER_PIXEL: usize = 4;

/// A rectangular region of the framebuffer.
///
/// Coordinates are measured from the top-left pixel. A valid rect has
/// non-zero extent and lies fully within the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
}

impl Rect {
    /// Creates a new `Rect`.
    #[must_use]
    pub fn new(x: u16, y: u16, w: u16, h: u16) -> Self {
        Self { x, y, w, h }
    }

    /// The rect covering the entire framebuffer.
    #[must_use]
    pub fn full_surface(width: u16, height: u16) -> Self {
        Self {
            x: 0,
            y: 0,
            w: width,
            h: height,
        }
    }

    /// Number of pixels covered by this rect.
    #[must_use]
    pub fn area(&self) -> usize {
        (self.w as usize) * (self.h as usize)
    }

    /// Merges this rect with another, returning the bounding rect of both.
    #[must_use]
    pub fn merge(&self, other: &Rect) -> Rect {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self
            .x
            .saturating_add(self.w)
            .max(other.x.saturating_add(other.w));
        let y2 = self
            .y
            .saturating_add(self.h)
            .max(other.y.saturating_add(other.h));

        Rect {
            x: x1,
            y: y1,
            w: x2.saturating_sub(x1),
            h: y2.saturating_sub(y1),
        }
    }

    /// Checks if this rect intersects another.
    #[must_use]
    pub fn intersects(&self, other: &Rect) -> bool {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self
            .x
            .saturating_add(self.w)
            .min(other.x.saturating_add(other.w));
        let y2 = self
            .y
            .saturating_add(self.h)
            .min(other.y.saturating_add(other.h));

        x1 < x2 && y1 < y2
    }

    /// Clamps this rect to the framebuffer bounds.
    ///
    /// A rect that was already in bounds is returned unchanged. Returns
    /// `None` if nothing of the rect survives clamping. An out-of-bounds
    /// rect is a writer bug, asserted in debug builds.
    pub(crate) fn clamped(self, width: u16, height: u16) -> Option<Rect> {
        debug_assert!(
            self.w > 0
                && self.h > 0
                && self.x.saturating_add(self.w) <= width
                && self.y.saturating_add(self.h) <= height,
            "rect {:?} exceeds framebuffer {}x{}",
            self,
            width,
            height
        );

        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.w.min(width - self.x);
        let h = self.h.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Rect {
            x: self.x,
            y: self.y,
            w,
            h,
        })
    }
}

/// Errors reported by [`FrameStore`] writers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The committed pixel buffer does not match the framebuffer size.
    #[error("pixel buffer size mismatch: expected {expected} bytes, got {got}")]
    BufferSize {
        /// Expected buffer length (`width * height * 4`).
        expected: usize,
        /// Length of the buffer that was committed.
        got: usize,
    },
}

#[derive(Debug)]
struct FrameState {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
    dirty: Vec<Rect>,
    generation: u64,
}

impl FrameState {
    fn apply(&mut self, pixels: Vec<u8>, rects: Vec<Rect>) -> Result<u64, StoreError> {
        let expected = (self.width as usize) * (self.height as usize) * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(StoreError::BufferSize {
                expected,
                got: pixels.len(),
            });
        }

        let mut dirty: Vec<Rect> = rects
            .into_iter()
            .filter_map(|r| r.clamped(self.width, self.height))
            .collect();

        // An empty dirty set records a single full-surface rect. This covers
        // the first frame (nothing to diff against) and the conservative
        // no-metadata case, and guarantees every update carries at least one
        // rectangle.
        if dirty.is_empty() {
            dirty.push(Rect::full_surface(self.width, self.height));
        }

        self.pixels = pixels;
        self.dirty = dirty;
        self.generation += 1;
        Ok(self.generation)
    }
}

/// The shared framebuffer.
///
/// One writer (the capture worker) commits frames; any number of sessions
/// read. The store outlives all sessions; the generation watch channel stays
/// open for the store's lifetime.
#[derive(Debug)]
pub struct FrameStore {
    state: RwLock<FrameState>,
    generation: watch::Sender<u64>,
}

impl FrameStore {
    /// Creates a store of the given dimensions with no committed frame.
    ///
    /// The pixel buffer starts zeroed at generation 0; sessions hold their
    /// first update until generation 1 is committed.
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        let size = (width as usize) * (height as usize) * BYTES_PER_PIXEL;
        let (generation, _) = watch::channel(0);
        Self {
            state: RwLock::new(FrameState {
                width,
                height,
                pixels: vec![0; size],
                dirty: Vec::new(),
                generation: 0,
            }),
            generation,
        }
    }

    /// Current generation counter. 0 means no frame has been committed.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Subscribe to generation changes.
    ///
    /// The receiver wakes whenever a commit lands; use
    /// `wait_for(|g| *g > last_seen)` to park until a newer frame exists.
    #[must_use]
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Current framebuffer dimensions.
    pub async fn dimensions(&self) -> (u16, u16) {
        let state = self.state.read().await;
        (state.width, state.height)
    }

    /// Commits a frame from an async context (used by tests and embedders
    /// that source frames without the capture worker).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BufferSize`] if `pixels` is not exactly
    /// `width * height * 4` bytes.
    pub async fn commit(&self, pixels: Vec<u8>, rects: Vec<Rect>) -> Result<u64, StoreError> {
        let generation = {
            let mut state = self.state.write().await;
            state.apply(pixels, rects)?
        };
        self.generation.send_replace(generation);
        Ok(generation)
    }

    /// Commits a frame from the capture worker's blocking thread.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BufferSize`] if `pixels` is not exactly
    /// `width * height * 4` bytes.
    ///
    /// # Panics
    ///
    /// Panics if called from an async context (the capture worker runs on a
    /// dedicated blocking thread).
    pub fn commit_blocking(&self, pixels: Vec<u8>, rects: Vec<Rect>) -> Result<u64, StoreError> {
        let generation = {
            let mut state = self.state.blocking_write();
            state.apply(pixels, rects)?
        };
        self.generation.send_replace(generation);
        Ok(generation)
    }

    /// Resizes the framebuffer to the display mode reported by the capture
    /// source.
    ///
    /// Called only during capture-worker startup, before the worker's first
    /// commit. The pixel buffer is reset to black and the dirty set cleared;
    /// the generation counter is left untouched.
    pub fn resize_blocking(&self, width: u16, height: u16) {
        let mut state = self.state.blocking_write();
        if state.width == width && state.height == height {
            return;
        }
        state.width = width;
        state.height = height;
        state.pixels = vec![0; (width as usize) * (height as usize) * BYTES_PER_PIXEL];
        state.dirty.clear();
    }

    /// Async counterpart of [`resize_blocking`](Self::resize_blocking) for
    /// embedders that drive the store without the capture worker.
    pub async fn resize(&self, width: u16, height: u16) {
        let mut state = self.state.write().await;
        if state.width == width && state.height == height {
            return;
        }
        state.width = width;
        state.height = height;
        state.pixels = vec![0; (width as usize) * (height as usize) * BYTES_PER_PIXEL];
        state.dirty.clear();
    }

    /// Acquires a read view of the current frame.
    ///
    /// The view pins the `(pixels, dirty, generation)` tuple for as long as
    /// it is held; sessions hold it for the span of one update emission.
    pub async fn read(&self) -> FrameView<'_> {
        FrameView {
            guard: self.state.read().await,
        }
    }
}

/// A stable read view of one committed frame.
#[derive(Debug)]
pub struct FrameView<'a> {
    guard: RwLockReadGuard<'a, FrameState>,
}

impl FrameView<'_> {
    /// Generation of the viewed frame (0 if none committed yet).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.guard.generation
    }

    /// Framebuffer width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.guard.width
    }

    /// Framebuffer height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.guard.height
    }

    /// The full RGBA pixel buffer, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.guard.pixels
    }

    /// Dirty rects recorded by the viewed commit, in commit order.
    #[must_use]
    pub fn dirty(&self) -> &[Rect] {
        &self.guard.dirty
    }
}

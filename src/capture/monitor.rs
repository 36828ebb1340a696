//! Primary-monitor capture source built on `xcap`.
//!
//! `xcap` has no change-notification facility, so this source derives dirty
//! rectangles itself: each acquired frame is diffed against the previous one
//! row by row, changed rows are grouped into bands, and each band's
//! horizontal extent is tightened to the columns that actually differ. An
//! unchanged frame maps to [`CaptureOutcome::Timeout`], meaning "the screen
//! has not changed".

use std::time::Duration;

use tracing::debug;

use super::{
    CaptureError, CaptureOutcome, CaptureSource, DirtySet, DisplayMode, FrameDelta, PixelOrder,
};
use crate::store::{Rect, BYTES_PER_PIXEL};

/// Rect-count cap before the dirty set collapses into one bounding rect.
const MAX_DIRTY_RECTS: usize = 8;

/// Dimension cap matching the store's limit.
const MAX_DIMENSION: u32 = 8192;

/// Captures the primary monitor through `xcap`.
#[derive(Debug, Default)]
pub struct MonitorSource {
    mode: Option<DisplayMode>,
    previous: Option<Vec<u8>>,
}

impl MonitorSource {
    /// Creates a source; no platform resources are touched until `open`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures one frame from the primary monitor.
    ///
    /// Monitors are re-enumerated per call: handles on some platforms go
    /// stale across display reconfiguration.
    fn grab_frame() -> Result<(Vec<u8>, u32, u32), CaptureError> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| CaptureError::Acquire(format!("failed to enumerate monitors: {e}")))?;

        if monitors.is_empty() {
            return Err(CaptureError::Acquire("no monitors available".to_string()));
        }

        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0]);

        let image = monitor
            .capture_image()
            .map_err(|e| CaptureError::Acquire(format!("failed to capture: {e}")))?;

        let width = image.width();
        let height = image.height();
        Ok((image.into_raw(), width, height))
    }
}

impl CaptureSource for MonitorSource {
    fn open(&mut self) -> Result<DisplayMode, CaptureError> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| CaptureError::Init(format!("failed to enumerate monitors: {e}")))?;

        if monitors.is_empty() {
            return Err(CaptureError::Init("no monitors found".to_string()));
        }

        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0]);

        let width = monitor
            .width()
            .map_err(|e| CaptureError::Init(format!("failed to get width: {e}")))?;
        let height = monitor
            .height()
            .map_err(|e| CaptureError::Init(format!("failed to get height: {e}")))?;
        let name = monitor.name().unwrap_or_else(|_| "unknown".to_string());

        let mode = DisplayMode {
            width: width.min(MAX_DIMENSION) as u16,
            height: height.min(MAX_DIMENSION) as u16,
            order: PixelOrder::Rgba,
        };

        debug!(
            "monitor '{}' opened at {}x{}",
            name, mode.width, mode.height
        );

        self.mode = Some(mode);
        self.previous = None;
        Ok(mode)
    }

    fn acquire(&mut self, _timeout: Duration) -> Result<CaptureOutcome, CaptureError> {
        let mode = self
            .mode
            .ok_or_else(|| CaptureError::Acquire("source not opened".to_string()))?;

        let (pixels, width, height) = Self::grab_frame()?;

        if width.min(MAX_DIMENSION) as u16 != mode.width
            || height.min(MAX_DIMENSION) as u16 != mode.height
        {
            return Ok(CaptureOutcome::ModeChanged {
                width: width.min(MAX_DIMENSION) as u16,
                height: height.min(MAX_DIMENSION) as u16,
            });
        }

        let dirty = match self.previous.as_deref() {
            None => DirtySet::Full,
            Some(prev) => {
                let rects = diff_frames(prev, &pixels, mode.width, mode.height);
                if rects.is_empty() {
                    return Ok(CaptureOutcome::Timeout);
                }
                DirtySet::Rects(rects)
            }
        };

        self.previous = Some(pixels.clone());
        Ok(CaptureOutcome::Frame(FrameDelta { pixels, dirty }))
    }

    fn close(&mut self) {
        self.mode = None;
        self.previous = None;
    }
}

/// Diffs two equally sized RGBA frames into a bounded set of dirty rects.
///
/// Consecutive changed rows form a band; each band is tightened to the
/// horizontal span of differing pixels. If the band count exceeds
/// [`MAX_DIRTY_RECTS`], everything collapses into one bounding rect.
fn diff_frames(prev: &[u8], next: &[u8], width: u16, height: u16) -> Vec<Rect> {
    let stride = (width as usize) * BYTES_PER_PIXEL;
    let mut bands: Vec<Rect> = Vec::new();
    let mut current: Option<(u16, u16, u16, u16)> = None; // (y0, y1, x0, x1) inclusive pixel span

    for y in 0..height {
        let offset = (y as usize) * stride;
        let prev_row = &prev[offset..offset + stride];
        let next_row = &next[offset..offset + stride];

        if prev_row == next_row {
            if let Some((y0, y1, x0, x1)) = current.take() {
                bands.push(Rect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1));
            }
            continue;
        }

        let (row_x0, row_x1) = row_extent(prev_row, next_row);
        current = Some(match current {
            None => (y, y, row_x0, row_x1),
            Some((y0, _, x0, x1)) => (y0, y, x0.min(row_x0), x1.max(row_x1)),
        });
    }
    if let Some((y0, y1, x0, x1)) = current {
        bands.push(Rect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1));
    }

    if bands.len() > MAX_DIRTY_RECTS {
        let merged = bands
            .iter()
            .skip(1)
            .fold(bands[0], |acc, r| acc.merge(r));
        return vec![merged];
    }
    bands
}

/// First and last differing pixel column of a changed row (inclusive).
fn row_extent(prev_row: &[u8], next_row: &[u8]) -> (u16, u16) {
    let first = prev_row
        .iter()
        .zip(next_row)
        .position(|(a, b)| a != b)
        .unwrap_or(0);
    let last = prev_row
        .iter()
        .zip(next_row)
        .rposition(|(a, b)| a != b)
        .unwrap_or(prev_row.len() - 1);
    (
        (first / BYTES_PER_PIXEL) as u16,
        (last / BYTES_PER_PIXEL) as u16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u16, height: u16, fill: u8) -> Vec<u8> {
        vec![fill; (width as usize) * (height as usize) * BYTES_PER_PIXEL]
    }

    fn set_pixel(pixels: &mut [u8], width: u16, x: u16, y: u16, value: u8) {
        let at = ((y as usize) * (width as usize) + (x as usize)) * BYTES_PER_PIXEL;
        pixels[at..at + 4].copy_from_slice(&[value; 4]);
    }

    // --- diff_frames tests ---

    #[test]
    fn test_diff_identical_frames() {
        let a = frame(8, 8, 0x10);
        assert!(diff_frames(&a, &a.clone(), 8, 8).is_empty());
    }

    #[test]
    fn test_diff_single_pixel() {
        let a = frame(8, 8, 0);
        let mut b = a.clone();
        set_pixel(&mut b, 8, 3, 5, 0xFF);

        let rects = diff_frames(&a, &b, 8, 8);
        assert_eq!(rects, vec![Rect::new(3, 5, 1, 1)]);
    }

    #[test]
    fn test_diff_corner_pixel() {
        let a = frame(8, 8, 0);
        let mut b = a.clone();
        set_pixel(&mut b, 8, 7, 7, 0xFF);

        let rects = diff_frames(&a, &b, 8, 8);
        assert_eq!(rects, vec![Rect::new(7, 7, 1, 1)]);
    }

    #[test]
    fn test_diff_two_separated_bands() {
        let a = frame(8, 8, 0);
        let mut b = a.clone();
        set_pixel(&mut b, 8, 1, 0, 0xFF);
        set_pixel(&mut b, 8, 6, 7, 0xFF);

        let rects = diff_frames(&a, &b, 8, 8);
        assert_eq!(
            rects,
            vec![Rect::new(1, 0, 1, 1), Rect::new(6, 7, 1, 1)]
        );
    }

    #[test]
    fn test_diff_band_spans_consecutive_rows() {
        let a = frame(8, 8, 0);
        let mut b = a.clone();
        set_pixel(&mut b, 8, 2, 3, 0xFF);
        set_pixel(&mut b, 8, 5, 4, 0xFF);

        let rects = diff_frames(&a, &b, 8, 8);
        // One band rows 3..=4, columns tightened to 2..=5.
        assert_eq!(rects, vec![Rect::new(2, 3, 4, 2)]);
    }

    #[test]
    fn test_diff_collapses_when_over_cap() {
        let a = frame(4, 64, 0);
        let mut b = a.clone();
        // A changed pixel every other row produces 32 bands.
        for y in (0..64).step_by(2) {
            set_pixel(&mut b, 4, 1, y, 0xFF);
        }

        let rects = diff_frames(&a, &b, 4, 64);
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0], Rect::new(1, 0, 1, 63));
    }

    #[test]
    fn test_diff_full_change() {
        let a = frame(8, 8, 0);
        let b = frame(8, 8, 0xFF);
        let rects = diff_frames(&a, &b, 8, 8);
        assert_eq!(rects, vec![Rect::full_surface(8, 8)]);
    }

    // --- MonitorSource tests (may not work in CI/headless) ---

    #[test]
    fn test_acquire_before_open_errors() {
        let mut source = MonitorSource::new();
        let result = source.acquire(Duration::from_millis(100));
        assert!(matches!(result, Err(CaptureError::Acquire(_))));
    }

    #[test]
    fn test_open_reports_mode() {
        let mut source = MonitorSource::new();
        match source.open() {
            Ok(mode) => {
                assert!(mode.width > 0);
                assert!(mode.height > 0);
                assert_eq!(mode.order, PixelOrder::Rgba);
                source.close();
            }
            Err(e) => {
                eprintln!("no monitor (headless?): {e}");
            }
        }
    }

    #[test]
    fn test_first_acquire_is_full_surface() {
        let mut source = MonitorSource::new();
        if source.open().is_err() {
            return; // headless environment
        }
        match source.acquire(Duration::from_millis(100)) {
            Ok(CaptureOutcome::Frame(delta)) => {
                assert_eq!(delta.dirty, DirtySet::Full);
                assert!(!delta.pixels.is_empty());
            }
            Ok(other) => panic!("expected first frame, got {other:?}"),
            Err(e) => eprintln!("cannot capture (headless?): {e}"),
        }
        source.close();
    }
}

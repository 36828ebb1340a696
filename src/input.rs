//! Input sink: where decoded pointer and keyboard events go.
//!
//! The session layer decodes RFB `PointerEvent` and `KeyEvent` payloads and
//! forwards them here. Synthesizing actual OS input is deliberately behind
//! the [`InputSink`] trait so hosts can plug in a platform implementation;
//! the shipped [`TraceSink`] logs events through `tracing`.

use std::fmt::Debug;

use tracing::{debug, trace};

/// Upper bound of the normalized absolute pointer axis used by common OS
/// injection APIs.
pub const ABSOLUTE_AXIS_MAX: u32 = 65535;

/// Receives decoded client input events.
///
/// Implementations are called from session tasks; they must be cheap or
/// hand off to their own queue. Coordinates arrive in framebuffer pixels;
/// use [`to_absolute_axis`] to map them onto a 0..65535 axis when the OS
/// expects normalized absolute positions.
pub trait InputSink: Send + Sync + Debug {
    /// A pointer event: position in framebuffer pixels plus the RFB button
    /// mask (bit 0 = left, bit 1 = middle, bit 2 = right, bits 3-4 = wheel).
    fn post_pointer(&self, x: u16, y: u16, button_mask: u8);

    /// A key event carrying an X11 keysym.
    fn post_key(&self, keysym: u32, down: bool);
}

/// Maps a framebuffer coordinate onto the 0..65535 absolute axis.
///
/// The input is clamped to the framebuffer extent first, so coordinates
/// from misbehaving clients never overshoot the axis.
#[must_use]
pub fn to_absolute_axis(value: u16, extent: u16) -> u16 {
    if extent == 0 {
        return 0;
    }
    let clamped = u32::from(value.min(extent - 1));
    (clamped * ABSOLUTE_AXIS_MAX / u32::from(extent)) as u16
}

/// Default sink that logs events instead of injecting them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceSink;

impl InputSink for TraceSink {
    fn post_pointer(&self, x: u16, y: u16, button_mask: u8) {
        trace!("pointer: ({}, {}) buttons=0x{:02X}", x, y, button_mask);
    }

    fn post_key(&self, keysym: u32, down: bool) {
        debug!("key event: down={} keysym=0x{:X}", down, keysym);
    }
}

//! Raw-encoding pixel extraction for framebuffer updates.
//!
//! The store holds RGBA32; the advertised pixel format (32-bit little-endian
//! true color, shifts 16/8/0) puts the bytes `B, G, R, X` on the wire. This
//! module performs the row-strided extraction and swizzle in one pass.

use bytes::{BufMut, BytesMut};

use crate::store::{Rect, BYTES_PER_PIXEL};

/// Appends the Raw-encoded payload for `rect` to `buf`.
///
/// `pixels` is the full RGBA framebuffer, row-major with `fb_width` pixels
/// per row. Exactly `rect.w * rect.h * 4` bytes are appended, row-contiguous
/// top-to-bottom, each pixel swizzled to the `B, G, R, 0` wire order.
///
/// The caller guarantees the rect is within bounds (the store clamps rects
/// on commit).
pub fn write_raw_rect(buf: &mut BytesMut, pixels: &[u8], fb_width: u16, rect: Rect) {
    let stride = (fb_width as usize) * BYTES_PER_PIXEL;
    let row_len = (rect.w as usize) * BYTES_PER_PIXEL;
    buf.reserve(rect.area() * BYTES_PER_PIXEL);

    for row in 0..rect.h as usize {
        let start = (rect.y as usize + row) * stride + (rect.x as usize) * BYTES_PER_PIXEL;
        let src = &pixels[start..start + row_len];
        for px in src.chunks_exact(BYTES_PER_PIXEL) {
            buf.put_u8(px[2]); // B
            buf.put_u8(px[1]); // G
            buf.put_u8(px[0]); // R
            buf.put_u8(0);
        }
    }
}

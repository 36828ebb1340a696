//! RFB (Remote Framebuffer) protocol constants and wire structures.
//!
//! Implements the slice of RFC 6143 this server speaks: protocol versions
//! 3.3/3.7/3.8, the `None` security type, ServerInit, and `Raw`-encoded
//! framebuffer updates. All multi-byte integers on the RFB wire are
//! big-endian.

use bytes::{BufMut, BytesMut};

use crate::store::Rect;

/// The protocol version string advertised by the server.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

// --- Client-to-Server Message Types ---

/// Message type: client requests a pixel format change (ignored here).
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: client lists its supported encodings.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: client sends cut text (drained and discarded).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// --- Server-to-Client Message Types ---

/// Message type: server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

// --- Encodings & Security ---

/// Encoding type: raw pixel data (the only encoding this server emits).
pub const ENCODING_RAW: i32 = 0;

/// Security type: None (no authentication).
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security result: handshake successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// A negotiated RFB protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// RFB 3.3
    V33,
    /// RFB 3.7
    V37,
    /// RFB 3.8
    V38,
}

impl ProtocolVersion {
    /// Parses a client's 12-byte version string.
    ///
    /// Returns `None` for anything other than the three versions this
    /// server accepts; the caller treats that as a protocol violation.
    #[must_use]
    pub fn parse(bytes: &[u8; 12]) -> Option<Self> {
        match bytes {
            b"RFB 003.003\n" => Some(Self::V33),
            b"RFB 003.007\n" => Some(Self::V37),
            b"RFB 003.008\n" => Some(Self::V38),
            _ => None,
        }
    }

    /// The version string form, 12 bytes with trailing newline.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V33 => "RFB 003.003\n",
            Self::V37 => "RFB 003.007\n",
            Self::V38 => "RFB 003.008\n",
        }
    }
}

/// The RFB PIXEL_FORMAT structure (16 bytes on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel (8, 16, or 32).
    pub bits_per_pixel: u8,
    /// Color depth (number of useful bits).
    pub depth: u8,
    /// Non-zero if multi-byte pixels are big-endian.
    pub big_endian_flag: u8,
    /// Non-zero if true color (as opposed to color map).
    pub true_colour_flag: u8,
    /// Maximum red value.
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Bits to left-shift the red value.
    pub red_shift: u8,
    /// Bits to left-shift the green value.
    pub green_shift: u8,
    /// Bits to left-shift the blue value.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The fixed format this server serves: 32 bpp, depth 24, little-endian
    /// true color with shifts 16/8/0.
    ///
    /// A pixel value with these shifts serializes little-endian as the
    /// bytes `B, G, R, X`; the emission path produces exactly that order
    /// regardless of the host framebuffer's native layout.
    #[must_use]
    pub fn bgrx32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Writes the pixel format to a buffer (16 bytes).
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Parses a pixel format from a 16-byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the buffer is too short.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, std::io::Error> {
        if buf.len() < 16 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "pixel format requires 16 bytes",
            ));
        }
        Ok(Self {
            bits_per_pixel: buf[0],
            depth: buf[1],
            big_endian_flag: buf[2],
            true_colour_flag: buf[3],
            red_max: u16::from_be_bytes([buf[4], buf[5]]),
            green_max: u16::from_be_bytes([buf[6], buf[7]]),
            blue_max: u16::from_be_bytes([buf[8], buf[9]]),
            red_shift: buf[10],
            green_shift: buf[11],
            blue_shift: buf[12],
            // bytes 13-15 are padding
        })
    }
}

/// The ServerInit message sent at the end of the handshake.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name.
    pub name: String,
}

impl ServerInit {
    /// Serializes the ServerInit message into a byte buffer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// Writes a framebuffer-update rectangle header (12 bytes).
pub fn write_rect_header(buf: &mut BytesMut, rect: Rect, encoding: i32) {
    buf.put_u16(rect.x);
    buf.put_u16(rect.y);
    buf.put_u16(rect.w);
    buf.put_u16(rect.h);
    buf.put_i32(encoding);
}

//! WebSocket transport layer.
//!
//! [`WsStream`] performs the HTTP upgrade handshake and then carries RFB
//! bytes inside binary WebSocket frames. The session layer reads a plain
//! byte stream: RFB messages may straddle frame boundaries, so inbound
//! binary and continuation payloads are concatenated into one buffer.
//! Control frames are handled here: `Ping` is answered with a matching
//! `Pong`, `Close` tears the connection down.
//!
//! Inbound parsing is incremental over a fill buffer, so the read path is
//! safe to use inside `tokio::select!`: the only suspension point appends
//! raw bytes, and frames are consumed only once complete.

mod handshake;

pub use handshake::accept_key;

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum size of the HTTP upgrade header block.
const MAX_HANDSHAKE_BYTES: usize = 8192;

/// Maximum payload of a single inbound frame (64 MiB).
const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Errors produced by the WebSocket layer.
#[derive(Debug, Error)]
pub enum WsError {
    /// IO error on the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The HTTP upgrade request was malformed.
    #[error("websocket handshake failed: {0}")]
    BadHandshake(String),

    /// A frame violated the protocol.
    #[error("websocket protocol error: {0}")]
    Protocol(String),

    /// An inbound frame exceeded the payload cap.
    #[error("frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The peer closed the connection (close frame or EOF).
    #[error("connection closed by peer")]
    Closed,
}

/// Inbound events surfaced to the session's select loop.
#[derive(Debug)]
pub enum WsEvent {
    /// At least one payload byte is buffered and can be read without
    /// blocking on the socket.
    Data,
    /// A ping arrived; the caller replies with [`WsStream::write_pong`].
    Ping(Vec<u8>),
}

/// A complete, unmasked frame.
#[derive(Debug)]
struct Frame {
    opcode: u8,
    payload: Vec<u8>,
}

/// A WebSocket connection carrying an RFB byte stream.
#[derive(Debug)]
pub struct WsStream<S> {
    stream: S,
    /// Undecoded wire bytes.
    raw: BytesMut,
    /// Unmasked binary payload ready for the session.
    payload: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsStream<S> {
    /// Accepts an incoming connection: performs the HTTP upgrade and
    /// returns the framed stream.
    ///
    /// # Errors
    ///
    /// Replies `400 Bad Request` and returns [`WsError::BadHandshake`] if
    /// the request is not a valid WebSocket upgrade.
    pub async fn accept(stream: S) -> Result<Self, WsError> {
        let mut ws = Self::from_upgraded(stream);

        let header_end = loop {
            if let Some(pos) = find_header_end(&ws.raw) {
                break pos;
            }
            if ws.raw.len() > MAX_HANDSHAKE_BYTES {
                return Err(WsError::BadHandshake("upgrade request too large".into()));
            }
            let n = ws.stream.read_buf(&mut ws.raw).await?;
            if n == 0 {
                return Err(WsError::Closed);
            }
        };

        let header = ws.raw.split_to(header_end + 4);
        let header = std::str::from_utf8(&header[..header_end])
            .map_err(|_| WsError::BadHandshake("non-UTF8 request header".into()))?;

        match handshake::parse_upgrade(header) {
            Ok(req) => {
                let response = handshake::switching_protocols(&req.key);
                ws.stream.write_all(response.as_bytes()).await?;
                ws.stream.flush().await?;
                trace!("websocket upgrade complete");
                Ok(ws)
            }
            Err(e) => {
                let _ = ws.stream.write_all(handshake::BAD_REQUEST.as_bytes()).await;
                Err(e)
            }
        }
    }

    /// Wraps a stream that has already completed the upgrade. Used by tests
    /// and by embedders that terminate HTTP elsewhere.
    pub fn from_upgraded(stream: S) -> Self {
        Self {
            stream,
            raw: BytesMut::with_capacity(4096),
            payload: BytesMut::new(),
        }
    }

    /// Waits for inbound traffic.
    ///
    /// Returns [`WsEvent::Data`] once at least one payload byte is
    /// buffered, or [`WsEvent::Ping`] when a ping needs answering. This
    /// method is cancel-safe: dropping the future mid-poll loses nothing,
    /// because partial frames stay in the fill buffer.
    ///
    /// # Errors
    ///
    /// [`WsError::Closed`] on a close frame or EOF.
    pub async fn poll_event(&mut self) -> Result<WsEvent, WsError> {
        loop {
            if !self.payload.is_empty() {
                return Ok(WsEvent::Data);
            }
            if let Some(frame) = self.try_parse_frame()? {
                match self.absorb(frame)? {
                    Some(event) => return Ok(event),
                    None => continue,
                }
            }
            let n = self.stream.read_buf(&mut self.raw).await?;
            if n == 0 {
                return Err(WsError::Closed);
            }
        }
    }

    /// Reads exactly `buf.len()` RFB bytes, reading across frame
    /// boundaries as needed. Pings encountered along the way are answered
    /// inline. Not cancel-safe; use [`poll_event`](Self::poll_event) inside
    /// `select!` and this method outside it.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WsError> {
        while self.payload.len() < buf.len() {
            if let Some(frame) = self.try_parse_frame()? {
                if let Some(WsEvent::Ping(data)) = self.absorb(frame)? {
                    self.write_pong(&data).await?;
                }
                continue;
            }
            let n = self.stream.read_buf(&mut self.raw).await?;
            if n == 0 {
                return Err(WsError::Closed);
            }
        }
        self.payload.split_to(buf.len()).copy_to_slice(buf);
        Ok(())
    }

    /// Reads one byte from the RFB stream.
    pub async fn read_u8(&mut self) -> Result<u8, WsError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    /// Sends an unmasked binary frame.
    pub async fn write_binary(&mut self, payload: &[u8]) -> Result<(), WsError> {
        let header = frame_header(OPCODE_BINARY, payload.len());
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a pong echoing the given ping payload.
    pub async fn write_pong(&mut self, payload: &[u8]) -> Result<(), WsError> {
        let header = frame_header(OPCODE_PONG, payload.len());
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a close frame. Best-effort; errors are reported but the
    /// caller usually drops the stream regardless.
    pub async fn send_close(&mut self) -> Result<(), WsError> {
        let header = frame_header(OPCODE_CLOSE, 0);
        self.stream.write_all(&header).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Routes one complete frame: data payloads are buffered, control
    /// frames become events or errors.
    fn absorb(&mut self, frame: Frame) -> Result<Option<WsEvent>, WsError> {
        match frame.opcode {
            OPCODE_BINARY | OPCODE_CONTINUATION => {
                self.payload.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OPCODE_PING => Ok(Some(WsEvent::Ping(frame.payload))),
            OPCODE_PONG => Ok(None),
            OPCODE_CLOSE => Err(WsError::Closed),
            OPCODE_TEXT => Err(WsError::Protocol("unexpected text frame".into())),
            n => Err(WsError::Protocol(format!("unknown opcode {n:#x}"))),
        }
    }

    /// Attempts to decode one frame from the fill buffer, consuming its
    /// bytes only if it is complete.
    fn try_parse_frame(&mut self) -> Result<Option<Frame>, WsError> {
        if self.raw.len() < 2 {
            return Ok(None);
        }
        let b0 = self.raw[0];
        let b1 = self.raw[1];

        if b0 & 0x70 != 0 {
            return Err(WsError::Protocol("reserved bits set".into()));
        }
        let opcode = b0 & 0x0F;
        let masked = b1 & 0x80 != 0;
        let len7 = (b1 & 0x7F) as usize;

        let (payload_len, header_len) = match len7 {
            126 => {
                if self.raw.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.raw[2], self.raw[3]]) as usize, 4)
            }
            127 => {
                if self.raw.len() < 10 {
                    return Ok(None);
                }
                let mut be = [0u8; 8];
                be.copy_from_slice(&self.raw[2..10]);
                let len = u64::from_be_bytes(be);
                if len > MAX_FRAME_PAYLOAD as u64 {
                    return Err(WsError::FrameTooLarge(len as usize));
                }
                (len as usize, 10)
            }
            n => (n, 2),
        };

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(WsError::FrameTooLarge(payload_len));
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len;
        if self.raw.len() < total {
            return Ok(None);
        }

        self.raw.advance(header_len);
        let payload = if masked {
            let mut key = [0u8; 4];
            self.raw.split_to(4).copy_to_slice(&mut key);
            let mut payload = self.raw.split_to(payload_len).to_vec();
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
            payload
        } else {
            self.raw.split_to(payload_len).to_vec()
        };

        Ok(Some(Frame { opcode, payload }))
    }
}

/// Builds a server-to-client frame header (FIN set, unmasked).
fn frame_header(opcode: u8, payload_len: usize) -> BytesMut {
    let mut header = BytesMut::with_capacity(10);
    header.put_u8(0x80 | opcode);
    if payload_len < 126 {
        header.put_u8(payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.put_u8(126);
        header.put_u16(payload_len as u16);
    } else {
        header.put_u8(127);
        header.put_u64(payload_len as u64);
    }
    header
}

/// Finds the end of the HTTP header block (`\r\n\r\n`).
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

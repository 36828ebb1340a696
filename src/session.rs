//! Per-client RFB session.
//!
//! A [`Session`] owns one upgraded WebSocket stream and drives the RFB
//! protocol on it: version and security negotiation, ServerInit, then the
//! streaming loop that interleaves inbound message parsing with outbound
//! framebuffer updates. State moves forward only; any read/write failure or
//! protocol violation ends the session.
//!
//! Update pacing follows the request/update model: an update is emitted
//! when the client has a request outstanding *and* the store holds a
//! generation the client has not seen (or a full refresh was demanded).
//! Because only the latest generation is observable, a slow client
//! implicitly coalesces intermediate frames.

use std::io;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::encoding;
use crate::input::InputSink;
use crate::protocol::{
    self, PixelFormat, ProtocolVersion, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT,
    CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT,
    CLIENT_MSG_SET_ENCODINGS, CLIENT_MSG_SET_PIXEL_FORMAT, ENCODING_RAW, SECURITY_RESULT_OK,
    SECURITY_TYPE_NONE, SERVER_MSG_FRAMEBUFFER_UPDATE,
};
use crate::store::{FrameStore, Rect};
use crate::ws::{WsError, WsEvent, WsStream};

/// Largest ClientCutText payload drained before the peer is considered
/// hostile.
const MAX_CUT_TEXT: u32 = 1 << 20;

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// IO error on the transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket layer error.
    #[error(transparent)]
    Ws(#[from] WsError),

    /// The client violated the RFB protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client sent a message type this server does not speak.
    #[error("unknown client message type: {0}")]
    UnknownMessage(u8),
}

/// One client's RFB state machine over an upgraded WebSocket stream.
#[derive(Debug)]
pub struct Session<S> {
    ws: WsStream<S>,
    store: Arc<FrameStore>,
    input: Arc<dyn InputSink>,
    generation: watch::Receiver<u64>,
    version: ProtocolVersion,
    last_seen: u64,
    update_requested: bool,
    full_refresh: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    /// Runs the RFB handshake and returns the streaming-ready session.
    ///
    /// Sequence: server version → client version → security list → client
    /// choice → SecurityResult (3.8 only) → ClientInit (ignored, always
    /// shared) → ServerInit with the store's current dimensions.
    ///
    /// # Errors
    ///
    /// Any transport failure or protocol violation; the caller closes the
    /// connection.
    pub async fn handshake(
        mut ws: WsStream<S>,
        store: Arc<FrameStore>,
        input: Arc<dyn InputSink>,
        desktop_name: &str,
    ) -> Result<Self, SessionError> {
        ws.write_binary(protocol::PROTOCOL_VERSION.as_bytes())
            .await?;

        let mut client_version = [0u8; 12];
        ws.read_exact(&mut client_version).await?;
        let version = ProtocolVersion::parse(&client_version).ok_or_else(|| {
            SessionError::Protocol(format!(
                "unsupported protocol version: {}",
                String::from_utf8_lossy(&client_version).trim_end()
            ))
        })?;

        // Security list: one entry, None.
        ws.write_binary(&[1, SECURITY_TYPE_NONE]).await?;

        let chosen = ws.read_u8().await?;
        if chosen != SECURITY_TYPE_NONE {
            return Err(SessionError::Protocol(format!(
                "client chose unsupported security type {chosen}"
            )));
        }

        if version == ProtocolVersion::V38 {
            ws.write_binary(&SECURITY_RESULT_OK.to_be_bytes()).await?;
        }

        // ClientInit: the shared flag is read and ignored, sessions are
        // always shared.
        let _shared = ws.read_u8().await?;

        let (width, height) = store.dimensions().await;
        let mut init = BytesMut::new();
        ServerInit {
            framebuffer_width: width,
            framebuffer_height: height,
            pixel_format: PixelFormat::bgrx32(),
            name: desktop_name.to_string(),
        }
        .write_to(&mut init);
        ws.write_binary(&init).await?;

        debug!("RFB handshake complete ({})", version.as_str().trim_end());

        let generation = store.watch_generation();
        Ok(Self {
            ws,
            store,
            input,
            generation,
            version,
            last_seen: 0,
            // An initial update is owed as soon as the first frame lands.
            update_requested: true,
            full_refresh: false,
        })
    }

    /// The protocol version negotiated with this client.
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Drives the streaming phase until the peer disconnects, the protocol
    /// is violated, or `shutdown` fires.
    ///
    /// A clean close by the peer (close frame, EOF, connection reset) is a
    /// normal end and returns `Ok`.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        match self.run_inner(shutdown).await {
            Err(SessionError::Ws(WsError::Closed)) => Ok(()),
            Err(SessionError::Ws(WsError::Io(e))) | Err(SessionError::Io(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
                ) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    async fn run_inner(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        loop {
            if self.update_due() {
                self.send_update().await?;
            }

            let last_seen = self.last_seen;
            let waiting = self.update_requested;
            enum Woken {
                Ping(Vec<u8>),
                Data,
                GenerationReady,
                Shutdown,
                Continue,
            }
            let woken = tokio::select! {
                event = self.ws.poll_event() => match event? {
                    WsEvent::Ping(payload) => Woken::Ping(payload),
                    WsEvent::Data => Woken::Data,
                },
                result = self.generation.wait_for(move |g| *g > last_seen), if waiting => {
                    result.map_err(|_| {
                        SessionError::Protocol("framebuffer store went away".into())
                    })?;
                    // Loop back to emit.
                    Woken::GenerationReady
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the server is gone; treat it
                    // like a shutdown signal.
                    if changed.is_err() || *shutdown.borrow() {
                        Woken::Shutdown
                    } else {
                        Woken::Continue
                    }
                }
            };
            match woken {
                Woken::Ping(payload) => self.ws.write_pong(&payload).await?,
                Woken::Data => self.handle_message().await?,
                Woken::GenerationReady | Woken::Continue => {}
                Woken::Shutdown => {
                    info!("session closing on server shutdown");
                    let _ = self.ws.send_close().await;
                    return Ok(());
                }
            }
        }
    }

    /// Both emission conditions hold: a request is outstanding and there is
    /// something servable (a newer generation, or any committed frame for a
    /// full refresh).
    fn update_due(&self) -> bool {
        let generation = *self.generation.borrow();
        self.update_requested
            && generation > 0
            && (generation > self.last_seen || self.full_refresh)
    }

    /// Reads and dispatches one client-to-server message.
    async fn handle_message(&mut self) -> Result<(), SessionError> {
        let msg_type = self.ws.read_u8().await?;
        match msg_type {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                let mut body = [0u8; 19];
                self.ws.read_exact(&mut body).await?;
                // Parsed and accepted; this server keeps serving its native
                // format.
                if let Ok(requested) = PixelFormat::from_bytes(&body[3..]) {
                    debug!(
                        "client requested pixel format {}bpp depth {}, continuing to serve native",
                        requested.bits_per_pixel, requested.depth
                    );
                }
            }
            CLIENT_MSG_SET_ENCODINGS => {
                let mut head = [0u8; 3];
                self.ws.read_exact(&mut head).await?;
                let count = u16::from_be_bytes([head[1], head[2]]);
                let mut raw_offered = false;
                for _ in 0..count {
                    let mut enc = [0u8; 4];
                    self.ws.read_exact(&mut enc).await?;
                    if i32::from_be_bytes(enc) == ENCODING_RAW {
                        raw_offered = true;
                    }
                }
                trace!(
                    "client offered {} encodings (raw={})",
                    count,
                    raw_offered
                );
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                let mut body = [0u8; 9];
                self.ws.read_exact(&mut body).await?;
                let incremental = body[0] != 0;
                // The requested region is parsed but not honored: updates
                // always carry the store's dirty rects.
                self.update_requested = true;
                if !incremental {
                    self.full_refresh = true;
                }
            }
            CLIENT_MSG_KEY_EVENT => {
                let mut body = [0u8; 7];
                self.ws.read_exact(&mut body).await?;
                let down = body[0] != 0;
                let keysym = u32::from_be_bytes([body[3], body[4], body[5], body[6]]);
                self.input.post_key(keysym, down);
            }
            CLIENT_MSG_POINTER_EVENT => {
                let mut body = [0u8; 5];
                self.ws.read_exact(&mut body).await?;
                let button_mask = body[0];
                let x = u16::from_be_bytes([body[1], body[2]]);
                let y = u16::from_be_bytes([body[3], body[4]]);
                self.input.post_pointer(x, y, button_mask);
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                let mut head = [0u8; 7];
                self.ws.read_exact(&mut head).await?;
                let len = u32::from_be_bytes([head[3], head[4], head[5], head[6]]);
                if len > MAX_CUT_TEXT {
                    return Err(SessionError::Protocol(format!(
                        "cut text of {len} bytes exceeds limit"
                    )));
                }
                // Drained and discarded; clipboard is out of scope.
                let mut remaining = len as usize;
                let mut chunk = [0u8; 4096];
                while remaining > 0 {
                    let take = remaining.min(chunk.len());
                    self.ws.read_exact(&mut chunk[..take]).await?;
                    remaining -= take;
                }
                trace!("discarded {} bytes of cut text", len);
            }
            other => return Err(SessionError::UnknownMessage(other)),
        }
        Ok(())
    }

    /// Emits one FramebufferUpdate for the store's current frame.
    ///
    /// The read view pins `(pixels, rects, generation)` while the message
    /// is built; the socket write happens after the view drops so readers
    /// never hold the store across a slow peer.
    async fn send_update(&mut self) -> Result<(), SessionError> {
        let (payload, generation) = {
            let view = self.store.read().await;
            let generation = view.generation();
            debug_assert!(generation > 0);

            let full = Rect::full_surface(view.width(), view.height());
            let rects: &[Rect] = if self.full_refresh {
                std::slice::from_ref(&full)
            } else {
                view.dirty()
            };

            let pixel_bytes: usize = rects.iter().map(|r| r.area() * 4).sum();
            let mut buf = BytesMut::with_capacity(4 + rects.len() * 12 + pixel_bytes);
            buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
            buf.put_u8(0); // padding
            buf.put_u16(rects.len() as u16);
            for rect in rects {
                protocol::write_rect_header(&mut buf, *rect, ENCODING_RAW);
                encoding::write_raw_rect(&mut buf, view.pixels(), view.width(), *rect);
            }
            (buf.freeze(), generation)
        };

        self.ws.write_binary(&payload).await?;

        self.last_seen = generation;
        self.update_requested = false;
        self.full_refresh = false;
        trace!(
            "sent update for generation {} ({} bytes)",
            generation,
            payload.len()
        );
        Ok(())
    }
}

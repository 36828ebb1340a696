//! Test utilities for webrfb integration tests.
//!
//! Provides a raw WebSocket viewer that speaks just enough of the protocol
//! to drive the server end-to-end, plus scripted capture sources so tests
//! never depend on a real display.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use webrfb::capture::{
    CaptureError, CaptureFactory, CaptureOutcome, CaptureSource, DirtySet, DisplayMode,
    FrameDelta, PixelOrder,
};
use webrfb::ws::accept_key;
use webrfb::{InputSink, ServerConfig};

/// The sample key from RFC 6455; any fixed key works for tests.
pub const TEST_WS_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

const MASK: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];

/// A minimal WebSocket VNC viewer for driving the server in tests.
pub struct TestViewer {
    stream: TcpStream,
    raw: Vec<u8>,
    payload: Vec<u8>,
    pongs: VecDeque<Vec<u8>>,
}

impl TestViewer {
    /// Connects and performs the WebSocket upgrade, asserting the accept
    /// key the server must produce.
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "GET /vnc HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {TEST_WS_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.expect("upgrade");

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.expect("101 response");
            response.push(byte[0]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(
            response.starts_with("HTTP/1.1 101"),
            "unexpected upgrade response: {response}"
        );
        let expected = format!("Sec-WebSocket-Accept: {}\r\n", accept_key(TEST_WS_KEY));
        assert!(
            response.contains(&expected),
            "bad accept key in: {response}"
        );

        Self {
            stream,
            raw: Vec::new(),
            payload: Vec::new(),
            pongs: VecDeque::new(),
        }
    }

    /// Sends RFB bytes as one masked binary frame.
    pub async fn send(&mut self, payload: &[u8]) {
        self.send_frame(0x2, payload).await;
    }

    /// Sends a masked ping with the given payload.
    pub async fn send_ping(&mut self, payload: &[u8]) {
        self.send_frame(0x9, payload).await;
    }

    async fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(0x80 | opcode);
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() <= u16::MAX as usize {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&MASK);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
        self.stream.write_all(&frame).await.expect("send frame");
    }

    /// Collects exactly `n` RFB payload bytes from server binary frames.
    /// Pongs arriving in between are stashed for [`expect_pong`].
    pub async fn recv(&mut self, n: usize) -> Vec<u8> {
        while self.payload.len() < n {
            let (opcode, body) = self.next_frame().await;
            match opcode {
                0x2 | 0x0 => self.payload.extend_from_slice(&body),
                0xA => self.pongs.push_back(body),
                0x8 => panic!("server closed while awaiting {n} bytes"),
                other => panic!("unexpected server opcode {other:#x}"),
            }
        }
        self.payload.drain(..n).collect()
    }

    /// Waits for a pong and returns its payload.
    pub async fn expect_pong(&mut self) -> Vec<u8> {
        if let Some(p) = self.pongs.pop_front() {
            return p;
        }
        loop {
            let (opcode, body) = self.next_frame().await;
            match opcode {
                0xA => return body,
                0x2 | 0x0 => self.payload.extend_from_slice(&body),
                other => panic!("expected pong, got opcode {other:#x}"),
            }
        }
    }

    /// Waits until the server closes the connection (close frame or EOF).
    pub async fn expect_close(&mut self) {
        loop {
            if self.parse_frame_header().is_none() {
                let mut chunk = [0u8; 4096];
                match self.stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return, // EOF counts as closed
                    Ok(read) => self.raw.extend_from_slice(&chunk[..read]),
                }
                continue;
            }
            let (opcode, _) = self.next_frame().await;
            if opcode == 0x8 {
                return;
            }
        }
    }

    /// Reads one complete unmasked server frame.
    async fn next_frame(&mut self) -> (u8, Vec<u8>) {
        loop {
            if let Some((header_len, payload_len)) = self.parse_frame_header() {
                if self.raw.len() >= header_len + payload_len {
                    let opcode = self.raw[0] & 0x0F;
                    self.raw.drain(..header_len);
                    let body = self.raw.drain(..payload_len).collect();
                    return (opcode, body);
                }
            }
            let mut chunk = [0u8; 65536];
            let read = self.stream.read(&mut chunk).await.expect("read frame");
            assert!(read > 0, "server closed mid-frame");
            self.raw.extend_from_slice(&chunk[..read]);
        }
    }

    fn parse_frame_header(&self) -> Option<(usize, usize)> {
        if self.raw.len() < 2 {
            return None;
        }
        assert_eq!(self.raw[1] & 0x80, 0, "server frames must be unmasked");
        match self.raw[1] & 0x7F {
            126 => {
                if self.raw.len() < 4 {
                    return None;
                }
                Some((4, u16::from_be_bytes([self.raw[2], self.raw[3]]) as usize))
            }
            127 => {
                if self.raw.len() < 10 {
                    return None;
                }
                let mut be = [0u8; 8];
                be.copy_from_slice(&self.raw[2..10]);
                Some((10, u64::from_be_bytes(be) as usize))
            }
            n => Some((2, n as usize)),
        }
    }

    /// Drives the RFB 3.8 handshake and asserts the advertised dimensions.
    pub async fn rfb_handshake(&mut self, width: u16, height: u16) {
        assert_eq!(self.recv(12).await, b"RFB 003.008\n");
        self.send(b"RFB 003.008\n").await;

        assert_eq!(self.recv(2).await, [1, 1]);
        self.send(&[1]).await;

        assert_eq!(self.recv(4).await, [0, 0, 0, 0]);
        self.send(&[1]).await; // shared

        let init = self.recv(24).await;
        assert_eq!(u16::from_be_bytes([init[0], init[1]]), width);
        assert_eq!(u16::from_be_bytes([init[2], init[3]]), height);
        let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]) as usize;
        self.recv(name_len).await;
    }

    /// Sends a FramebufferUpdateRequest for the whole surface.
    pub async fn request_update(&mut self, incremental: bool, width: u16, height: u16) {
        let mut msg = vec![3u8, u8::from(incremental), 0, 0, 0, 0];
        msg.extend_from_slice(&width.to_be_bytes());
        msg.extend_from_slice(&height.to_be_bytes());
        self.send(&msg).await;
    }

    /// Tears the TCP connection down without a close frame.
    pub fn abort(self) {
        drop(self.stream);
    }
}

/// Shared script of capture outcomes; tests push, the source pops.
#[derive(Clone, Default)]
pub struct FrameScript {
    outcomes: Arc<Mutex<VecDeque<CaptureOutcome>>>,
}

impl FrameScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a full frame of one solid RGBA color.
    pub fn push_solid(&self, mode: DisplayMode, rgba: [u8; 4]) {
        let pixels = rgba.repeat((mode.width as usize) * (mode.height as usize));
        self.outcomes
            .lock()
            .unwrap()
            .push_back(CaptureOutcome::Frame(FrameDelta {
                pixels,
                dirty: DirtySet::Full,
            }));
    }

    /// Queues an arbitrary outcome.
    pub fn push(&self, outcome: CaptureOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }
}

/// Capture source driven by a [`FrameScript`]; reports a timeout whenever
/// the script is empty.
pub struct ScriptedSource {
    mode: Arc<Mutex<DisplayMode>>,
    script: FrameScript,
    closed: Arc<AtomicUsize>,
}

impl CaptureSource for ScriptedSource {
    fn open(&mut self) -> Result<DisplayMode, CaptureError> {
        Ok(*self.mode.lock().unwrap())
    }

    fn acquire(&mut self, _timeout: Duration) -> Result<CaptureOutcome, CaptureError> {
        Ok(self
            .script
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CaptureOutcome::Timeout))
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle pair for observing a scripted capture factory from tests.
pub struct CaptureProbe {
    /// Frames queued here appear on the next acquire.
    pub script: FrameScript,
    /// How many sources have been closed.
    pub closes: Arc<AtomicUsize>,
    /// How many sources the factory has produced.
    pub spawns: Arc<AtomicUsize>,
    mode: Arc<Mutex<DisplayMode>>,
}

impl CaptureProbe {
    pub fn closed_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Changes the mode the next opened source reports.
    pub fn set_mode(&self, mode: DisplayMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

/// Builds a factory of scripted sources reporting the given mode.
pub fn scripted_capture(width: u16, height: u16) -> (CaptureFactory, CaptureProbe) {
    let script = FrameScript::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let spawns = Arc::new(AtomicUsize::new(0));
    let mode = Arc::new(Mutex::new(DisplayMode {
        width,
        height,
        order: PixelOrder::Rgba,
    }));

    let probe = CaptureProbe {
        script: script.clone(),
        closes: Arc::clone(&closes),
        spawns: Arc::clone(&spawns),
        mode: Arc::clone(&mode),
    };

    let factory: CaptureFactory = Box::new(move || {
        spawns.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedSource {
            mode: Arc::clone(&mode),
            script: script.clone(),
            closed: Arc::clone(&closes),
        })
    });

    (factory, probe)
}

/// Input sink that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub pointers: Mutex<Vec<(u16, u16, u8)>>,
    pub keys: Mutex<Vec<(u32, bool)>>,
}

impl InputSink for RecordingSink {
    fn post_pointer(&self, x: u16, y: u16, button_mask: u8) {
        self.pointers.lock().unwrap().push((x, y, button_mask));
    }

    fn post_key(&self, keysym: u32, down: bool) {
        self.keys.lock().unwrap().push((keysym, down));
    }
}

/// Config bound to an ephemeral port with small default dimensions.
pub fn test_config(width: u16, height: u16) -> ServerConfig {
    ServerConfig {
        port: 0,
        width,
        height,
        ..ServerConfig::default()
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

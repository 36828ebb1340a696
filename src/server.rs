//! Server lifecycle: accept loop, capture gating, shutdown.
//!
//! [`VncServer`] is the control surface a host embeds: `start` binds the
//! listener and begins accepting, `stop` joins the workers, and three
//! callbacks report client arrival, departure and persistent errors.
//! Callbacks run on worker tasks; embedders marshal to their own threads.
//!
//! The capture worker is gated on the active-client count: the first
//! completed handshake starts it, the last departure signals it to stop, so
//! the capture facility never runs without an audience.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::worker::{self, CaptureSettings, CaptureStatus, CaptureWorker};
use crate::capture::{CaptureFactory, MonitorSource};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::input::{InputSink, TraceSink};
use crate::session::Session;
use crate::store::FrameStore;
use crate::ws::WsStream;

/// Accept poll bound; shutdown is honored within this window.
const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Budget for the WebSocket upgrade plus the RFB handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a session waits for the capture worker to settle before
/// falling back to the configured framebuffer dimensions.
const CAPTURE_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

type ConnectedCallback = Box<dyn Fn(SocketAddr) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connected: RwLock<Option<ConnectedCallback>>,
    disconnected: RwLock<Option<ConnectedCallback>>,
    error: RwLock<Option<ErrorCallback>>,
}

struct Shared {
    config: ServerConfig,
    store: Arc<FrameStore>,
    input: Arc<dyn InputSink>,
    factory: CaptureFactory,
    running: Arc<AtomicBool>,
    active_clients: AtomicUsize,
    shutdown: watch::Sender<bool>,
    capture: Mutex<Option<CaptureWorker>>,
    callbacks: Callbacks,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn fire_connected(&self, addr: SocketAddr) {
        if let Some(cb) = self.callbacks.connected.read().unwrap().as_ref() {
            cb(addr);
        }
    }

    fn fire_disconnected(&self, addr: SocketAddr) {
        if let Some(cb) = self.callbacks.disconnected.read().unwrap().as_ref() {
            cb(addr);
        }
    }

    fn fire_error(&self, message: &str) {
        if let Some(cb) = self.callbacks.error.read().unwrap().as_ref() {
            cb(message);
        }
    }
}

/// The embeddable WebSocket VNC server.
pub struct VncServer {
    shared: Arc<Shared>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for VncServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VncServer")
            .field("port", &self.shared.config.port)
            .field("running", &self.is_running())
            .field("active_clients", &self.active_clients())
            .finish()
    }
}

impl VncServer {
    /// Creates a server that mirrors the primary monitor and logs input
    /// events.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(|| Box::new(MonitorSource::new())),
            Arc::new(TraceSink),
        )
    }

    /// Creates a server with a custom capture source factory and input
    /// sink. The factory is invoked on every 0→1 client transition so a
    /// torn-down capture facility is re-initialized fresh.
    #[must_use]
    pub fn with_parts(
        config: ServerConfig,
        factory: CaptureFactory,
        input: Arc<dyn InputSink>,
    ) -> Self {
        let store = Arc::new(FrameStore::new(config.width, config.height));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                input,
                factory,
                running: Arc::new(AtomicBool::new(false)),
                active_clients: AtomicUsize::new(0),
                shutdown,
                capture: Mutex::new(None),
                callbacks: Callbacks::default(),
                local_addr: Mutex::new(None),
            }),
            accept_handle: Mutex::new(None),
        }
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// The shared framebuffer store.
    #[must_use]
    pub fn framebuffer(&self) -> &Arc<FrameStore> {
        &self.shared.store
    }

    /// Number of clients that have completed the RFB handshake and not yet
    /// disconnected.
    #[must_use]
    pub fn active_clients(&self) -> usize {
        self.shared.active_clients.load(Ordering::Acquire)
    }

    /// Whether the accept loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The bound listener address, once started. Useful when configured
    /// with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// Registers the client-connected callback. Fired from worker tasks
    /// after a client completes the RFB handshake.
    pub fn on_client_connected(&self, callback: impl Fn(SocketAddr) + Send + Sync + 'static) {
        *self.shared.callbacks.connected.write().unwrap() = Some(Box::new(callback));
    }

    /// Registers the client-disconnected callback. Fired from worker tasks
    /// on every session exit path.
    pub fn on_client_disconnected(&self, callback: impl Fn(SocketAddr) + Send + Sync + 'static) {
        *self.shared.callbacks.disconnected.write().unwrap() = Some(Box::new(callback));
    }

    /// Registers the error callback, fired for persistent capture failures
    /// and other conditions the server recovers from but a host should see.
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.callbacks.error.write().unwrap() = Some(Box::new(callback));
    }

    /// Binds the listener and starts accepting clients. Idempotent.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the port cannot be bound; no workers are
    /// started in that case.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let port = self.shared.config.port;
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(ServerError::Bind { port, source });
            }
        };

        let addr = listener.local_addr()?;
        *self.shared.local_addr.lock().unwrap() = Some(addr);
        self.shared.shutdown.send_replace(false);

        info!("listening on {}", addr);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(accept_loop(shared, listener));
        *self.accept_handle.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Stops accepting, signals sessions and the capture worker, and joins
    /// the accept and capture workers. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shared.shutdown.send_replace(true);

        let accept = self.accept_handle.lock().unwrap().take();
        if let Some(handle) = accept {
            if tokio::time::timeout(ACCEPT_POLL + Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("accept loop did not exit in time");
            }
        }

        let capture = self.shared.capture.lock().unwrap().take();
        if let Some(worker) = capture {
            worker.stop().await;
        }

        info!("server stopped");
    }
}

/// Polls for connections with a bounded timeout so shutdown is honored
/// within one poll interval.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while shared.running.load(Ordering::Acquire) {
        match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Err(_) => continue, // poll bound elapsed; re-check running
            Ok(Ok((stream, addr))) => {
                debug!("connection from {}", addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(handle_client(shared, stream, addr));
            }
            Ok(Err(e)) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("accept loop exited");
}

/// Decrements the active-client count on every exit path and signals the
/// capture worker when the last client leaves.
struct ClientGuard {
    shared: Arc<Shared>,
    addr: SocketAddr,
}

impl ClientGuard {
    fn new(shared: Arc<Shared>, addr: SocketAddr) -> Self {
        let count = shared.active_clients.fetch_add(1, Ordering::AcqRel) + 1;
        info!("client {} connected ({} active)", addr, count);
        shared.fire_connected(addr);
        Self { shared, addr }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let remaining = self.shared.active_clients.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(
            "client {} disconnected ({} active)",
            self.addr, remaining
        );
        if remaining == 0 {
            if let Some(worker) = self.shared.capture.lock().unwrap().as_ref() {
                worker.request_stop();
            }
        }
        self.shared.fire_disconnected(self.addr);
    }
}

/// One connection from accept to close.
async fn handle_client(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }

    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, WsStream::accept(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("websocket upgrade failed for {}: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("websocket upgrade timed out for {}", addr);
            return;
        }
    };

    // The capture worker must be up (or known failed) before ServerInit so
    // the advertised dimensions match the real display mode.
    ensure_capture(&shared).await;

    let session = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        Session::handshake(
            ws,
            Arc::clone(&shared.store),
            Arc::clone(&shared.input),
            &shared.config.desktop_name,
        ),
    )
    .await;

    let mut session = match session {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            debug!("RFB handshake failed for {}: {}", addr, e);
            stop_capture_if_unwatched(&shared);
            return;
        }
        Err(_) => {
            debug!("RFB handshake timed out for {}", addr);
            stop_capture_if_unwatched(&shared);
            return;
        }
    };

    let _guard = ClientGuard::new(Arc::clone(&shared), addr);

    match session.run(shared.shutdown.subscribe()).await {
        Ok(()) => debug!("session {} ended", addr),
        Err(e) => {
            info!("session {} failed: {}", addr, e);
        }
    }
}

/// Stops the capture worker if no handshake-completed client remains.
/// Covers connections that started capture but never finished the RFB
/// handshake.
fn stop_capture_if_unwatched(shared: &Shared) {
    if shared.active_clients.load(Ordering::Acquire) == 0 {
        if let Some(worker) = shared.capture.lock().unwrap().as_ref() {
            worker.request_stop();
        }
    }
}

/// Starts the capture worker if none is running and waits for its status
/// to settle so the store reflects the display mode.
async fn ensure_capture(shared: &Arc<Shared>) {
    let mut status = {
        let mut slot = shared.capture.lock().unwrap();
        let needs_spawn = match slot.as_ref() {
            Some(worker) => worker.is_stopped(),
            None => true,
        };
        if needs_spawn {
            let source = (shared.factory)();
            let weak = Arc::downgrade(shared);
            let worker = worker::spawn(
                source,
                Arc::clone(&shared.store),
                Arc::clone(&shared.running),
                CaptureSettings {
                    acquire_timeout: Duration::from_millis(shared.config.capture_timeout_ms),
                    frame_interval: Duration::from_millis(
                        1000 / u64::from(shared.config.max_fps.clamp(1, 60)),
                    ),
                },
                Box::new(move |message| {
                    if let Some(shared) = weak.upgrade() {
                        shared.fire_error(&message);
                    }
                }),
            );
            let status = worker.status();
            *slot = Some(worker);
            status
        } else {
            slot.as_ref().expect("worker present").status()
        }
    };

    // Wait for Starting to resolve; a failed or slow capture falls back to
    // the configured framebuffer (blank), clients still get served.
    let settled = tokio::time::timeout(
        CAPTURE_SETTLE_TIMEOUT,
        status.wait_for(|s| !matches!(s, CaptureStatus::Starting)),
    )
    .await;

    match settled {
        Ok(Ok(state)) => {
            if let CaptureStatus::Failed(reason) = &*state {
                warn!("serving without capture: {}", reason);
            }
        }
        Ok(Err(_)) | Err(_) => warn!("capture worker slow to start; serving current store"),
    }
}

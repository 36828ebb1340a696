//! # webrfb - WebSocket RFB screen sharing server
//!
//! webrfb streams the host's primary display to browser-based VNC viewers
//! over WebSocket, and feeds pointer and keyboard input from the viewers
//! back into a pluggable input sink. The wire protocol above the WebSocket
//! frame payload is standard RFB 3.3/3.7/3.8, restricted to the `None`
//! security type and the `Raw` encoding.
//!
//! ## Architecture
//!
//! ```text
//! screen ──▶ CaptureSource ──▶ FrameStore ──▶ Session ──▶ WsStream ──▶ viewer
//!                                  ▲              │
//!                             generation      InputSink
//!                               watch        (pointer/key)
//! ```
//!
//! A single capture worker (one blocking OS thread, gated on the
//! active-client count) writes frames and dirty rectangles into the shared
//! [`store::FrameStore`]. Each connected viewer gets its own session task
//! that parks on the store's generation watch and emits incremental
//! `FramebufferUpdate` messages on demand. The [`server::VncServer`] owns
//! the accept loop and the worker lifecycles.
//!
//! ## Example
//!
//! ```rust,ignore
//! use webrfb::{ServerConfig, VncServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = VncServer::new(ServerConfig::default());
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod capture;
pub mod config;
pub mod encoding;
pub mod error;
pub mod input;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
pub mod ws;

// Re-export commonly used items
pub use config::{load_config, Config, ServerConfig};
pub use error::ServerError;
pub use input::InputSink;
pub use server::VncServer;
pub use store::{FrameStore, Rect};

/// Version of the webrfb library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "webrfb");
    }
}

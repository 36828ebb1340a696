//! Error types for webrfb
//!
//! Each subsystem defines its own error enum (see [`crate::ws`],
//! [`crate::session`], [`crate::capture`]); this module holds the
//! crate-level error returned by the server control surface.

use std::io;
use thiserror::Error;

/// Errors reported by the server control surface.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The listener could not be bound to the configured port.
    ///
    /// Returned synchronously from `start()`; no workers are running when
    /// this is reported.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// The port that could not be bound.
        port: u16,
        /// The underlying bind error.
        source: io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: ServerError = io_err.into();
        assert!(matches!(err, ServerError::Io(_)));
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_server_error_bind_display() {
        let err = ServerError::Bind {
            port: 5900,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("5900"));
        assert!(msg.contains("in use"));
    }

    #[test]
    fn test_server_error_config_display() {
        let err = ServerError::Config("bad port".to_string());
        assert_eq!(err.to_string(), "configuration error: bad port");
    }
}

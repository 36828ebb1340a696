//! HTTP/1.1 upgrade handshake for incoming WebSocket connections.
//!
//! Accepts a `GET` request carrying `Upgrade: websocket`, `Connection:
//! Upgrade` and `Sec-WebSocket-Key`, and produces the `101 Switching
//! Protocols` response. No subprotocol negotiation, no extensions, no
//! origin validation; hosts that need gating add it upstream.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use super::WsError;

/// GUID appended to the client key, per RFC 6455 §1.3.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let digest = Sha1::new()
        .chain_update(key.as_bytes())
        .chain_update(WEBSOCKET_GUID.as_bytes())
        .finalize();
    BASE64.encode(digest)
}

/// A parsed upgrade request; only the key matters to this server.
#[derive(Debug)]
pub(super) struct UpgradeRequest {
    pub(super) key: String,
}

/// Parses the HTTP header block (everything before the blank line).
pub(super) fn parse_upgrade(header: &str) -> Result<UpgradeRequest, WsError> {
    let mut lines = header.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    if !request_line.starts_with("GET ") {
        return Err(WsError::BadHandshake(format!(
            "expected GET request, got: {}",
            request_line.chars().take(32).collect::<String>()
        )));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut key = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                // The Connection header is a token list; browsers may send
                // "keep-alive, Upgrade".
                connection_ok = value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
            }
            "sec-websocket-key" => key = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err(WsError::BadHandshake("missing Upgrade: websocket".into()));
    }
    if !connection_ok {
        return Err(WsError::BadHandshake("missing Connection: Upgrade".into()));
    }
    let key = key.filter(|k| !k.is_empty()).ok_or_else(|| {
        WsError::BadHandshake("missing Sec-WebSocket-Key".into())
    })?;

    Ok(UpgradeRequest { key })
}

/// Renders the 101 response for an accepted upgrade.
pub(super) fn switching_protocols(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

/// Response sent before closing a connection that failed the upgrade.
pub(super) const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\n\r\n";

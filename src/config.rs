//! Configuration types and parsing for webrfb
//!
//! Configuration is a single record fixed at construction time. The binary
//! loads it from a TOML file; embedders construct [`ServerConfig`] directly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default listen port (the conventional VNC display-0 port)
fn default_port() -> u16 {
    5900
}

/// Default desktop name advertised in ServerInit
fn default_desktop_name() -> String {
    "WebRFB".to_string()
}

/// Default framebuffer width before the capture source reports a mode
fn default_width() -> u16 {
    1920
}

/// Default framebuffer height before the capture source reports a mode
fn default_height() -> u16 {
    1080
}

/// Default maximum capture frames per second
fn default_max_fps() -> u8 {
    30
}

/// Default capture acquire timeout in milliseconds
fn default_capture_timeout_ms() -> u64 {
    100
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// VNC server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional password, reserved for future security types (not enforced)
    #[serde(default)]
    pub password: Option<String>,

    /// Desktop name advertised to clients in ServerInit
    #[serde(default = "default_desktop_name")]
    pub desktop_name: String,

    /// Initial framebuffer width in pixels; replaced by the display mode
    /// once the capture source starts
    #[serde(default = "default_width")]
    pub width: u16,

    /// Initial framebuffer height in pixels
    #[serde(default = "default_height")]
    pub height: u16,

    /// Maximum capture frames per second (1-60)
    #[serde(default = "default_max_fps")]
    pub max_fps: u8,

    /// Timeout passed to the capture source's acquire call, in milliseconds
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            password: None,
            desktop_name: default_desktop_name(),
            width: default_width(),
            height: default_height(),
            max_fps: default_max_fps(),
            capture_timeout_ms: default_capture_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Maximum framebuffer dimension accepted by the store.
    pub const MAX_DIMENSION: u16 = 8192;

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("framebuffer dimensions must be greater than zero".to_string());
        }

        if self.width > Self::MAX_DIMENSION || self.height > Self::MAX_DIMENSION {
            return Err(format!(
                "framebuffer dimensions too large: {}x{} (max: {})",
                self.width,
                self.height,
                Self::MAX_DIMENSION
            ));
        }

        if self.max_fps == 0 {
            return Err("max_fps must be greater than zero".to_string());
        }

        if self.capture_timeout_ms == 0 || self.capture_timeout_ms > 1000 {
            return Err(format!(
                "capture_timeout_ms must be in 1..=1000, got: {}",
                self.capture_timeout_ms
            ));
        }

        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}

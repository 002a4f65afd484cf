//! Configuration
//!
//! TOML file with optional sections; every field has a default so an empty
//! file (or no file at all) yields a working configuration. CLI flags
//! override the file.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, TapError};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| TapError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| TapError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface to capture on; `None` picks the system default device.
    pub interface: Option<String>,
    /// Read frames from a pcap file instead of a live interface.
    pub file: Option<String>,
    /// BPF filter applied before decoding.
    pub filter: String,
    /// Bytes captured per frame. Must cover link + IP + TCP headers plus the
    /// HTTP head; a clipped frame desyncs its stream.
    pub snaplen: i32,
    pub promiscuous: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            file: None,
            filter: "tcp and port 80".to_string(),
            snaplen: 1600,
            promiscuous: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// How often the stale-flow reaper runs.
    pub reap_interval_secs: u64,
    /// Idle time after which a flow is evicted.
    pub stale_timeout_secs: u64,
    /// Hard cap on concurrently tracked directional flows.
    pub max_flows: usize,
    /// Per-flow cap on buffered out-of-order bytes.
    pub max_pending_bytes: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 60,
            stale_timeout_secs: 120,
            max_flows: 65536,
            max_pending_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Cap on a message's start line plus headers before the stream is
    /// abandoned as not-HTTP.
    pub max_head_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReportConfig {
    /// Emit one JSON object per message on stdout instead of log lines.
    pub json: bool,
}

use std::path::PathBuf;

use thiserror::Error;

/// Errors that are fatal at the capture/configuration boundary.
///
/// Per-frame and per-flow problems (malformed frames, sequence overlaps,
/// protocol desyncs) are deliberately not represented here: they are handled
/// inline and must never abort the process.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("capture device {0} does not exist")]
    NoSuchDevice(String),

    #[error("failed to open capture: {0}")]
    CaptureOpen(#[source] pcap::Error),

    #[error("invalid BPF filter {filter:?}: {source}")]
    BadFilter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("capture read error: {0}")]
    CaptureRead(#[source] pcap::Error),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, TapError>;

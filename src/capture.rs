//! Frame acquisition
//!
//! Wraps libpcap behind a blocking `FrameSource` so the engine can treat a
//! live interface and an offline capture file identically. The source runs on
//! a dedicated OS thread; pcap's read loop does not mix with async.

use chrono::{DateTime, TimeZone, Utc};
use pcap::{Active, Capture, Device, Offline};
use tracing::{info, warn};

use crate::error::{Result, TapError};

/// One link-layer frame as captured, with its capture timestamp.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Kernel-side capture counters, for the periodic stats log.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
}

/// Blocking frame supplier. `Ok(None)` means the source is exhausted (end of
/// a capture file; live captures only end on error).
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;

    fn stats(&mut self) -> CaptureStats {
        CaptureStats::default()
    }
}

fn frame_from_packet(packet: &pcap::Packet<'_>) -> CapturedFrame {
    let ts = &packet.header.ts;
    let timestamp = Utc
        .timestamp_opt(ts.tv_sec as i64, (ts.tv_usec as u32).saturating_mul(1000))
        .single()
        .unwrap_or_else(Utc::now);
    CapturedFrame {
        data: packet.data.to_vec(),
        timestamp,
    }
}

/// Live capture from a network interface.
pub struct LiveSource {
    capture: Capture<Active>,
}

impl LiveSource {
    /// Open `interface` (or the default device when `None`) with the given
    /// snapshot length and BPF filter.
    pub fn open(
        interface: Option<&str>,
        filter: &str,
        snaplen: i32,
        promiscuous: bool,
    ) -> Result<Self> {
        let device = match interface {
            Some(name) => Device::list()
                .map_err(TapError::CaptureOpen)?
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| TapError::NoSuchDevice(name.to_string()))?,
            None => Device::lookup()
                .map_err(TapError::CaptureOpen)?
                .ok_or_else(|| TapError::NoSuchDevice("<default>".to_string()))?,
        };
        info!(device = %device.name, snaplen, promiscuous, "opening capture device");

        let mut capture = Capture::from_device(device)
            .map_err(TapError::CaptureOpen)?
            .snaplen(snaplen)
            .promisc(promiscuous)
            .timeout(1000)
            .immediate_mode(true)
            .open()
            .map_err(TapError::CaptureOpen)?;

        capture.filter(filter, true).map_err(|source| TapError::BadFilter {
            filter: filter.to_string(),
            source,
        })?;
        info!(filter, "capture filter installed");

        Ok(Self { capture })
    }
}

impl FrameSource for LiveSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        loop {
            match self.capture.next_packet() {
                Ok(packet) => return Ok(Some(frame_from_packet(&packet))),
                // Read timeout with no traffic; keep polling.
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(TapError::CaptureRead(e)),
            }
        }
    }

    fn stats(&mut self) -> CaptureStats {
        match self.capture.stats() {
            Ok(s) => {
                if s.dropped > 0 {
                    warn!(dropped = s.dropped, "kernel dropped frames");
                }
                CaptureStats {
                    received: s.received,
                    dropped: s.dropped,
                }
            }
            Err(_) => CaptureStats::default(),
        }
    }
}

/// Offline replay of a pcap file.
pub struct FileSource {
    capture: Capture<Offline>,
    frames: u32,
}

impl FileSource {
    pub fn open(path: &str, filter: &str) -> Result<Self> {
        let mut capture = Capture::from_file(path).map_err(TapError::CaptureOpen)?;
        capture.filter(filter, true).map_err(|source| TapError::BadFilter {
            filter: filter.to_string(),
            source,
        })?;
        info!(path, filter, "reading capture file");
        Ok(Self { capture, frames: 0 })
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.frames += 1;
                Ok(Some(frame_from_packet(&packet)))
            }
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(TapError::CaptureRead(e)),
        }
    }

    fn stats(&mut self) -> CaptureStats {
        CaptureStats {
            received: self.frames,
            dropped: 0,
        }
    }
}

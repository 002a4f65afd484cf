//! Reassembled stream delivery
//!
//! Channel types connecting the reassembler (producer) to a per-flow consumer
//! task. Bytes arrive strictly in sequence order followed by exactly one
//! end-of-stream event.

use serde::Serialize;
use tokio::sync::mpsc;

/// How a directional stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEnd {
    /// FIN observed and all bytes up to it delivered.
    Clean,
    /// RST, staleness eviction, buffer overflow, or process shutdown.
    /// The stream may be incomplete.
    Abrupt,
}

/// One event on a directional stream.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Vec<u8>),
    End(StreamEnd),
}

/// Producer half held by the reassembler.
pub type StreamSender = mpsc::UnboundedSender<StreamEvent>;

/// Consumer half of a directional flow's byte stream.
///
/// The dispatch loop must never block on a slow consumer, so the underlying
/// channel is unbounded; memory is bounded upstream by the reassembler's
/// pending-byte cap and the stale-flow reaper.
pub struct ReassembledStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl ReassembledStream {
    pub fn channel() -> (StreamSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event, or `None` if the producer vanished without sending an
    /// explicit end (treated as abrupt by callers).
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant; `None` when no event is queued.
    pub fn try_next_event(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

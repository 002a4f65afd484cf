//! TCP stream reassembly
//!
//! Converts a feed of arbitrarily ordered TCP segments into per-direction
//! ordered byte streams, delivered over channels to consumer tasks. Two
//! instances run side by side in the engine: one feeding request parsers,
//! one feeding response parsers.

mod buffer;
mod table;

pub use buffer::{Delivery, StreamBuffer};
pub use table::{DirectionalFlow, FlowTable, TableStats};

use std::time::Duration;

use tracing::trace;

use crate::packet::{Direction, FlowKey, TcpSegment};
use crate::stream::{ReassembledStream, StreamEnd, StreamEvent};

/// A freshly created directional stream, to be handed to a consumer task.
pub struct NewStream {
    pub key: FlowKey,
    pub direction: Direction,
    pub stream: ReassembledStream,
}

/// Drives a `FlowTable` from the segment feed and forwards ordered bytes to
/// each flow's consumer. Owned by the dispatch loop; never shared.
pub struct StreamReassembler {
    table: FlowTable,
}

impl StreamReassembler {
    pub fn new(max_flows: usize, max_pending_bytes: usize) -> Self {
        Self {
            table: FlowTable::new(max_flows, max_pending_bytes),
        }
    }

    pub fn live_flows(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats
    }

    /// Fold one segment into its directional flow.
    ///
    /// Returns the consumer half of the stream when this segment created a
    /// new flow; the caller spawns the parser task for it.
    pub fn handle_segment(&mut self, segment: &TcpSegment) -> Option<NewStream> {
        let (flow, stream, evicted) = self
            .table
            .get_or_create(segment.key, segment.direction);

        let delivery = flow.buffer.accept(segment.seq, segment.flags, &segment.payload);
        if !delivery.data.is_empty() {
            trace!(
                flow = %segment.key,
                direction = %segment.direction,
                bytes = delivery.data.len(),
                "stream bytes"
            );
            // A send failure means the consumer already exited; the flow will
            // be dropped on close or reaping.
            let _ = flow.tx.send(StreamEvent::Data(delivery.data));
        }
        if let Some(end) = delivery.end {
            let _ = flow.tx.send(StreamEvent::End(end));
            self.table.remove(segment.key, segment.direction);
        }

        // A capacity eviction displaced some other flow; its consumer still
        // needs to observe termination.
        if let Some(victim) = evicted {
            let _ = victim.tx.send(StreamEvent::End(StreamEnd::Abrupt));
        }

        stream.map(|stream| NewStream {
            key: segment.key,
            direction: segment.direction,
            stream,
        })
    }

    /// Evict flows idle longer than `staleness`, delivering an abrupt
    /// end-of-stream to each. Returns the number evicted.
    pub fn reap(&mut self, staleness: Duration) -> usize {
        let reaped = self.table.reap_idle(staleness);
        let count = reaped.len();
        for flow in reaped {
            let _ = flow.tx.send(StreamEvent::End(StreamEnd::Abrupt));
        }
        count
    }

    /// Terminate every live flow (end of capture or shutdown). Flows without
    /// a clean FIN are by definition incomplete, so the end is abrupt.
    pub fn close_all(&mut self) {
        for flow in self.table.drain_all() {
            let _ = flow.tx.send(StreamEvent::End(StreamEnd::Abrupt));
        }
    }
}

//! Directional flow table
//!
//! Storage and lookup for live directional flows, with idle-flow reaping and
//! capacity eviction so abandoned connections cannot grow memory without
//! bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::packet::{Direction, FlowKey};
use crate::stream::{ReassembledStream, StreamSender};

use super::buffer::StreamBuffer;

/// One half of a TCP connection: the sequencing state plus the channel to its
/// consumer task.
pub struct DirectionalFlow {
    pub key: FlowKey,
    pub direction: Direction,
    pub buffer: StreamBuffer,
    pub tx: StreamSender,
    pub last_activity: Instant,
}

/// Table statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub created: u64,
    pub closed: u64,
    pub reaped: u64,
    pub evicted: u64,
}

pub struct FlowTable {
    flows: HashMap<(FlowKey, Direction), DirectionalFlow>,
    max_flows: usize,
    max_pending_bytes: usize,
    pub stats: TableStats,
}

impl FlowTable {
    pub fn new(max_flows: usize, max_pending_bytes: usize) -> Self {
        Self {
            flows: HashMap::with_capacity(max_flows.min(4096)),
            max_flows,
            max_pending_bytes,
            stats: TableStats::default(),
        }
    }

    /// Look up the flow for a directed segment, creating it on first sight.
    ///
    /// On creation the consumer half of the new stream is returned so the
    /// caller can hand it to a parser task. When the table is full the oldest
    /// flow is evicted first; the caller must deliver its abrupt end.
    pub fn get_or_create(
        &mut self,
        key: FlowKey,
        direction: Direction,
    ) -> (&mut DirectionalFlow, Option<ReassembledStream>, Option<DirectionalFlow>) {
        let id = (key, direction);
        if self.flows.contains_key(&id) {
            let flow = self.flows.get_mut(&id).expect("checked above");
            flow.last_activity = Instant::now();
            return (flow, None, None);
        }

        let evicted = if self.flows.len() >= self.max_flows {
            self.evict_oldest()
        } else {
            None
        };

        let (tx, stream) = ReassembledStream::channel();
        self.stats.created += 1;
        let flow = self.flows.entry(id).or_insert(DirectionalFlow {
            key,
            direction,
            buffer: StreamBuffer::new(self.max_pending_bytes),
            tx,
            last_activity: Instant::now(),
        });
        (flow, Some(stream), evicted)
    }

    pub fn remove(&mut self, key: FlowKey, direction: Direction) -> Option<DirectionalFlow> {
        let removed = self.flows.remove(&(key, direction));
        if removed.is_some() {
            self.stats.closed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Remove every flow idle longer than `staleness`. The caller delivers
    /// the abrupt end-of-stream to each returned flow's consumer.
    pub fn reap_idle(&mut self, staleness: Duration) -> Vec<DirectionalFlow> {
        let now = Instant::now();
        let stale: Vec<(FlowKey, Direction)> = self
            .flows
            .iter()
            .filter(|(_, f)| now.duration_since(f.last_activity) > staleness)
            .map(|(&id, _)| id)
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(flow) = self.flows.remove(&id) {
                self.stats.reaped += 1;
                reaped.push(flow);
            }
        }
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped stale flows");
        }
        reaped
    }

    /// Remove and return every live flow (process shutdown).
    pub fn drain_all(&mut self) -> Vec<DirectionalFlow> {
        self.flows.drain().map(|(_, f)| f).collect()
    }

    fn evict_oldest(&mut self) -> Option<DirectionalFlow> {
        let oldest = self
            .flows
            .iter()
            .min_by_key(|(_, f)| f.last_activity)
            .map(|(&id, _)| id)?;
        self.stats.evicted += 1;
        self.flows.remove(&oldest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn key(port: u16) -> FlowKey {
        let src: SocketAddr = format!("192.168.1.100:{}", port).parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:80".parse().unwrap();
        FlowKey::from_endpoints(src, dst).0
    }

    #[test]
    fn test_create_then_hit() {
        let mut table = FlowTable::new(100, 1 << 20);
        let (_, stream, _) = table.get_or_create(key(1000), Direction::AToB);
        assert!(stream.is_some());
        assert_eq!(table.len(), 1);

        let (_, stream, _) = table.get_or_create(key(1000), Direction::AToB);
        assert!(stream.is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats.created, 1);
    }

    #[test]
    fn test_directions_are_distinct_flows() {
        let mut table = FlowTable::new(100, 1 << 20);
        table.get_or_create(key(1000), Direction::AToB);
        table.get_or_create(key(1000), Direction::BToA);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_capacity_eviction() {
        let mut table = FlowTable::new(2, 1 << 20);
        table.get_or_create(key(1), Direction::AToB);
        table.get_or_create(key(2), Direction::AToB);
        let (_, _, evicted) = table.get_or_create(key(3), Direction::AToB);
        assert!(evicted.is_some());
        assert_eq!(table.len(), 2);
        assert_eq!(table.stats.evicted, 1);
    }

    #[test]
    fn test_reap_idle() {
        let mut table = FlowTable::new(100, 1 << 20);
        table.get_or_create(key(1), Direction::AToB);
        // Zero staleness: everything with any age at all is stale.
        std::thread::sleep(Duration::from_millis(5));
        let reaped = table.reap_idle(Duration::ZERO);
        assert_eq!(reaped.len(), 1);
        assert!(table.is_empty());
        assert_eq!(table.stats.reaped, 1);
    }

    #[test]
    fn test_drain_all() {
        let mut table = FlowTable::new(100, 1 << 20);
        table.get_or_create(key(1), Direction::AToB);
        table.get_or_create(key(2), Direction::BToA);
        assert_eq!(table.drain_all().len(), 2);
        assert!(table.is_empty());
    }
}

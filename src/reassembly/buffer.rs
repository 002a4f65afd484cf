//! Per-direction TCP sequencing
//!
//! Turns arbitrarily ordered, duplicated, or overlapping segments into the
//! in-order byte stream for one direction of a connection. All sequence
//! comparisons are wraparound-aware; plain numeric ordering is wrong near the
//! 32-bit rollover.

use std::collections::BTreeMap;

use crate::packet::TcpFlags;
use crate::stream::StreamEnd;

/// Bytes released by one segment, plus stream termination if it occurred.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Newly contiguous bytes, in sequence order. Empty when the segment
    /// filled no gap (buffered, duplicate, or control-only).
    pub data: Vec<u8>,
    /// Set at most once over the life of a buffer.
    pub end: Option<StreamEnd>,
}

impl Delivery {
    fn end(end: StreamEnd) -> Self {
        Self { data: Vec::new(), end: Some(end) }
    }
}

/// Sequencing state for one directional flow.
#[derive(Debug)]
pub struct StreamBuffer {
    /// First delivered sequence number; fixed at the first segment.
    origin: Option<u32>,
    /// Next expected sequence number. `None` until the first segment.
    next_seq: Option<u32>,
    /// Out-of-order fragments keyed by byte offset from `origin`, so map
    /// order equals sequence order even when raw sequence numbers straddle
    /// the 32-bit rollover.
    pending: BTreeMap<u32, Vec<u8>>,
    /// Total bytes held in `pending`.
    pending_bytes: usize,
    /// Cap on `pending_bytes`; exceeding it closes the stream abruptly.
    max_pending_bytes: usize,
    /// Sequence number one past the last data byte, from a FIN.
    fin_seq: Option<u32>,
    closed: bool,

    pub segments: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
}

impl StreamBuffer {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            origin: None,
            next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_pending_bytes,
            fin_seq: None,
            closed: false,
            segments: 0,
            duplicates: 0,
            out_of_order: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Fold one segment into the stream.
    pub fn accept(&mut self, seq: u32, flags: TcpFlags, payload: &[u8]) -> Delivery {
        if self.closed {
            return Delivery::default();
        }
        self.segments += 1;

        if flags.rst {
            return self.close(StreamEnd::Abrupt);
        }

        // A SYN consumes one sequence number; data starts at ISN+1.
        let mut seq = seq;
        if flags.syn {
            seq = seq.wrapping_add(1);
        }

        // Mid-stream pickup: first observed segment sets the origin.
        if self.next_seq.is_none() {
            self.origin = Some(seq);
            self.next_seq = Some(seq);
        }
        let next = self.next_seq.expect("origin set above");

        let mut delivery = Delivery::default();
        if !payload.is_empty() {
            if seq_lt(seq, next) {
                // Retransmission: trim the already-delivered prefix.
                let overlap = next.wrapping_sub(seq) as usize;
                if overlap >= payload.len() {
                    self.duplicates += 1;
                } else {
                    self.ingest(next, &payload[overlap..], &mut delivery);
                }
            } else {
                self.ingest(seq, payload, &mut delivery);
            }
            if delivery.end.is_some() {
                return delivery;
            }
        }

        if flags.fin {
            let fin_at = seq_add(seq, payload.len());
            if self.fin_seq.is_none() {
                self.fin_seq = Some(fin_at);
            }
        }
        self.maybe_finish(&mut delivery);
        delivery
    }

    /// Abandon the stream, discarding buffered fragments.
    pub fn force_close(&mut self) -> Delivery {
        if self.closed {
            return Delivery::default();
        }
        self.close(StreamEnd::Abrupt)
    }

    fn close(&mut self, end: StreamEnd) -> Delivery {
        self.closed = true;
        self.pending.clear();
        self.pending_bytes = 0;
        Delivery::end(end)
    }

    /// Offset of `seq` from the stream origin. Pending-map coordinates.
    fn offset_of(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.origin.expect("origin set"))
    }

    fn seq_at(&self, offset: u32) -> u32 {
        self.origin.expect("origin set").wrapping_add(offset)
    }

    /// Place a segment at or beyond `next_seq`, emitting whatever becomes
    /// contiguous.
    fn ingest(&mut self, seq: u32, payload: &[u8], delivery: &mut Delivery) {
        let next = self.next_seq.expect("ingest requires an origin");

        if seq == next {
            delivery.data.extend_from_slice(payload);
            self.next_seq = Some(seq_add(seq, payload.len()));
            self.flush_pending(delivery);
            return;
        }

        // Early arrival: buffer by stream offset with overlap trimming
        // against neighbors. Offsets only saturate after 4 GiB of backlog,
        // far past the pending-byte cap.
        self.out_of_order += 1;
        let mut start = self.offset_of(seq);
        let mut data = payload.to_vec();

        // Predecessor overlap trims our prefix.
        if let Some((&prev_start, prev)) = self.pending.range(..=start).next_back() {
            let prev_end = prev_start.saturating_add(prev.len() as u32);
            if start < prev_end {
                let cut = (prev_end - start) as usize;
                if cut >= data.len() {
                    self.duplicates += 1;
                    return;
                }
                data.drain(..cut);
                start = prev_end;
            }
        }

        // Successors fully inside our range are replaced by our bytes; one
        // that extends past us trims our tail instead.
        let end = start.saturating_add(data.len() as u32);
        let overlapping: Vec<u32> = self.pending.range(start..end).map(|(&s, _)| s).collect();
        for s in overlapping {
            let frag_end = s.saturating_add(self.pending[&s].len() as u32);
            if end < frag_end {
                // Successor continues beyond us; keep it, end our data at s.
                data.truncate((s - start) as usize);
                break;
            }
            let frag = self.pending.remove(&s).expect("fragment present");
            self.pending_bytes -= frag.len();
        }

        if data.is_empty() {
            return;
        }
        self.pending_bytes += data.len();
        self.pending.insert(start, data);

        if self.pending_bytes > self.max_pending_bytes {
            *delivery = self.close(StreamEnd::Abrupt);
        }
    }

    /// Emit buffered fragments that are now contiguous, transitively.
    fn flush_pending(&mut self, delivery: &mut Delivery) {
        loop {
            let next = self.offset_of(self.next_seq.expect("flush requires an origin"));
            let (&start, _) = match self.pending.first_key_value() {
                Some(kv) => kv,
                None => return,
            };
            if start == next {
                let frag = self.pending.remove(&start).expect("fragment present");
                self.pending_bytes -= frag.len();
                self.next_seq = Some(seq_add(self.seq_at(start), frag.len()));
                delivery.data.extend_from_slice(&frag);
            } else if start < next {
                // Late retransmission that got buffered; keep any new suffix.
                let frag = self.pending.remove(&start).expect("fragment present");
                self.pending_bytes -= frag.len();
                let overlap = (next - start) as usize;
                if overlap < frag.len() {
                    self.next_seq = Some(seq_add(self.seq_at(start), frag.len()));
                    delivery.data.extend_from_slice(&frag[overlap..]);
                } else {
                    self.duplicates += 1;
                }
            } else {
                return;
            }
        }
    }

    /// Clean close once everything up to the FIN has been delivered.
    fn maybe_finish(&mut self, delivery: &mut Delivery) {
        if let (Some(fin), Some(next)) = (self.fin_seq, self.next_seq) {
            if !seq_lt(next, fin) {
                self.closed = true;
                self.pending.clear();
                self.pending_bytes = 0;
                delivery.end = Some(StreamEnd::Clean);
            }
        }
    }
}

/// `a < b` in sequence space, tolerant of 32-bit rollover.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_FLAGS: TcpFlags = TcpFlags {
        fin: false,
        syn: false,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
    };
    const FIN: TcpFlags = TcpFlags { fin: true, ..NO_FLAGS };
    const RST: TcpFlags = TcpFlags { rst: true, ..NO_FLAGS };
    const SYN: TcpFlags = TcpFlags { syn: true, ..NO_FLAGS };

    fn buffer() -> StreamBuffer {
        StreamBuffer::new(1 << 20)
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 1 {
            return vec![vec![0]];
        }
        let mut out = Vec::new();
        for p in permutations(n - 1) {
            for i in 0..=p.len() {
                let mut q = p.clone();
                q.insert(i, n - 1);
                out.push(q);
            }
        }
        out
    }

    #[test]
    fn test_in_order() {
        let mut buf = buffer();
        let d1 = buf.accept(1000, NO_FLAGS, b"Hello");
        let d2 = buf.accept(1005, NO_FLAGS, b" World");
        assert_eq!(d1.data, b"Hello");
        assert_eq!(d2.data, b" World");
    }

    #[test]
    fn test_reordering_invariance() {
        // Four non-overlapping segments covering a contiguous range: every
        // delivery order must reassemble to the same bytes.
        let segs: [(u32, &[u8]); 4] =
            [(1000, b"ab"), (1002, b"cde"), (1005, b"f"), (1006, b"ghij")];
        for perm in permutations(segs.len()) {
            let mut buf = StreamBuffer::new(1 << 20);
            // Pin the origin so early arrivals are buffered, not adopted.
            buf.accept(999, NO_FLAGS, b"_");
            let mut out = Vec::new();
            for &i in &perm {
                let (seq, data) = segs[i];
                out.extend(buf.accept(seq, NO_FLAGS, data).data);
            }
            assert_eq!(out, b"abcdefghij", "order {:?}", perm);
        }
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut buf = buffer();
        assert_eq!(buf.accept(1000, NO_FLAGS, b"Hello").data, b"Hello");
        let dup = buf.accept(1000, NO_FLAGS, b"Hello");
        assert!(dup.data.is_empty());
        assert_eq!(buf.duplicates, 1);
    }

    #[test]
    fn test_partial_overlap_emits_only_new_bytes() {
        let mut buf = buffer();
        assert_eq!(buf.accept(1000, NO_FLAGS, b"Hello").data, b"Hello");
        // Overlaps "llo", carries "XY" beyond.
        let d = buf.accept(1002, NO_FLAGS, b"lloXY");
        assert_eq!(d.data, b"XY");
    }

    #[test]
    fn test_gap_holds_bytes_back() {
        let mut buf = buffer();
        assert_eq!(buf.accept(1000, NO_FLAGS, b"Hello").data, b"Hello");
        assert!(buf.accept(1010, NO_FLAGS, b"World").data.is_empty());
        // Filling the gap releases both the filler and the buffered fragment.
        let d = buf.accept(1005, NO_FLAGS, b"_____");
        assert_eq!(d.data, b"_____World");
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buf = buffer();
        let near_max = u32::MAX - 2;
        assert_eq!(buf.accept(near_max, NO_FLAGS, b"ABC").data, b"ABC");
        let d = buf.accept(near_max.wrapping_add(3), NO_FLAGS, b"DEF");
        assert_eq!(d.data, b"DEF");
    }

    #[test]
    fn test_buffered_fragments_across_rollover() {
        let mut buf = buffer();
        let base = u32::MAX - 15;
        assert_eq!(buf.accept(base, NO_FLAGS, b"AAAAA").data, b"AAAAA");

        // Early fragments buffered on both sides of the 32-bit rollover,
        // one of them spanning it.
        assert!(buf.accept(base.wrapping_add(10), NO_FLAGS, b"BB").data.is_empty());
        assert!(buf.accept(base.wrapping_add(12), NO_FLAGS, b"CCCC").data.is_empty());
        assert!(buf.accept(2, NO_FLAGS, b"DD").data.is_empty());
        assert_eq!(buf.pending_bytes(), 8);

        // Filling the first gap must release the pre-wrap and spanning
        // fragments together.
        let d = buf.accept(base.wrapping_add(5), NO_FLAGS, b"EEEEE");
        assert_eq!(d.data, b"EEEEEBBCCCC");

        // And the post-wrap fragment drains once its own gap closes.
        let d = buf.accept(0, NO_FLAGS, b"FF");
        assert_eq!(d.data, b"FFDD");
        assert_eq!(buf.pending_bytes(), 0);
    }

    #[test]
    fn test_duplicate_across_rollover_not_misordered() {
        let mut buf = buffer();
        let base = u32::MAX - 2;
        assert_eq!(buf.accept(base, NO_FLAGS, b"abc").data, b"abc");
        // Post-wrap bytes, then a stale pre-wrap retransmission.
        assert_eq!(buf.accept(base.wrapping_add(3), NO_FLAGS, b"def").data, b"def");
        assert!(buf.accept(base, NO_FLAGS, b"abc").data.is_empty());
        assert_eq!(buf.duplicates, 1);
        // The stream continues past the stale segment untouched.
        assert_eq!(buf.accept(base.wrapping_add(6), NO_FLAGS, b"ghi").data, b"ghi");
    }

    #[test]
    fn test_syn_consumes_one_seq() {
        let mut buf = buffer();
        assert!(buf.accept(1000, SYN, b"").data.is_empty());
        let d = buf.accept(1001, NO_FLAGS, b"data");
        assert_eq!(d.data, b"data");
    }

    #[test]
    fn test_fin_closes_cleanly_in_order() {
        let mut buf = buffer();
        buf.accept(1000, NO_FLAGS, b"bye");
        let d = buf.accept(1003, FIN, b"");
        assert_eq!(d.end, Some(StreamEnd::Clean));
        assert!(buf.is_closed());
    }

    #[test]
    fn test_fin_waits_for_gap_fill() {
        let mut buf = buffer();
        buf.accept(1000, NO_FLAGS, b"He");
        // FIN arrives with the tail while bytes 1002..1004 are missing.
        let early = buf.accept(1004, FIN, b"o");
        assert!(early.data.is_empty());
        assert!(early.end.is_none());

        let fill = buf.accept(1002, NO_FLAGS, b"ll");
        assert_eq!(fill.data, b"llo");
        assert_eq!(fill.end, Some(StreamEnd::Clean));
    }

    #[test]
    fn test_rst_closes_immediately() {
        let mut buf = buffer();
        buf.accept(1000, NO_FLAGS, b"He");
        buf.accept(1010, NO_FLAGS, b"ahead");
        let d = buf.accept(1005, RST, b"");
        assert_eq!(d.end, Some(StreamEnd::Abrupt));
        assert_eq!(buf.pending_bytes(), 0);
        // Anything after close is ignored.
        assert!(buf.accept(1002, NO_FLAGS, b"xx").data.is_empty());
    }

    #[test]
    fn test_pending_cap_closes_abruptly() {
        let mut buf = StreamBuffer::new(8);
        buf.accept(1000, NO_FLAGS, b"a");
        // 10 buffered out-of-order bytes blow the 8-byte cap.
        let d = buf.accept(2000, NO_FLAGS, b"0123456789");
        assert_eq!(d.end, Some(StreamEnd::Abrupt));
        assert!(buf.is_closed());
    }

    #[test]
    fn test_buffered_fragment_overlap_trim() {
        let mut buf = buffer();
        buf.accept(1000, NO_FLAGS, b"a");
        // Two overlapping early fragments: [1005..1010) and [1008..1012).
        buf.accept(1005, NO_FLAGS, b"BCDEF");
        buf.accept(1008, NO_FLAGS, b"EFGH");
        let d = buf.accept(1001, NO_FLAGS, b"bcde");
        assert_eq!(d.data, b"bcdeBCDEFGH");
    }

    #[test]
    fn test_force_close_is_abrupt_once() {
        let mut buf = buffer();
        buf.accept(1000, NO_FLAGS, b"x");
        assert_eq!(buf.force_close().end, Some(StreamEnd::Abrupt));
        assert_eq!(buf.force_close(), Delivery::default());
    }
}

//! Frame decoding and flow demultiplexing
//!
//! Unwraps link/network/transport headers from captured frames and produces
//! `TcpSegment`s keyed by flow and direction. Non-TCP and malformed frames
//! are discarded silently; this stage holds no state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use etherparse::SlicedPacket;
use serde::Serialize;

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Direction of a segment relative to the normalized flow key endpoints.
///
/// `AToB` means the segment travels from endpoint A (the smaller of the two
/// after normalization) toward endpoint B. Both halves of one connection map
/// to the same `FlowKey`; direction is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::AToB => Direction::BToA,
            Direction::BToA => Direction::AToB,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

/// Connection identity: unordered endpoint pair, normalized so both
/// directions of one TCP connection produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub addr_a: SocketAddr,
    pub addr_b: SocketAddr,
}

impl FlowKey {
    /// Build the normalized key for a src->dst segment, returning the key and
    /// the direction the segment travels relative to it.
    pub fn from_endpoints(src: SocketAddr, dst: SocketAddr) -> (Self, Direction) {
        if (src.ip(), src.port()) <= (dst.ip(), dst.port()) {
            (Self { addr_a: src, addr_b: dst }, Direction::AToB)
        } else {
            (Self { addr_a: dst, addr_b: src }, Direction::BToA)
        }
    }

    /// Source and destination endpoints for a given direction.
    pub fn endpoints(&self, direction: Direction) -> (SocketAddr, SocketAddr) {
        match direction {
            Direction::AToB => (self.addr_a, self.addr_b),
            Direction::BToA => (self.addr_b, self.addr_a),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.addr_a, self.addr_b)
    }
}

/// One TCP payload fragment extracted from a captured frame.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub key: FlowKey,
    pub direction: Direction,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Source and destination endpoints of this segment.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        self.key.endpoints(self.direction)
    }
}

/// Decode a link-layer frame into a TCP segment.
///
/// Returns `None` for anything that is not a well-formed TCP-over-IP frame:
/// ARP, non-IP ethertypes, truncated headers, non-TCP transports. Zero-length
/// payloads with control flags still produce a segment so FIN/RST handling
/// sees them.
pub fn decode_frame(data: &[u8]) -> Option<TcpSegment> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let (src_ip, dst_ip): (IpAddr, IpAddr) = match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (header.source_addr().into(), header.destination_addr().into())
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (header.source_addr().into(), header.destination_addr().into())
        }
        _ => return None,
    };

    let tcp = match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    let src = SocketAddr::new(src_ip, tcp.source_port());
    let dst = SocketAddr::new(dst_ip, tcp.destination_port());
    let (key, direction) = FlowKey::from_endpoints(src, dst);

    Some(TcpSegment {
        key,
        direction,
        seq: tcp.sequence_number(),
        flags: TcpFlags {
            fin: tcp.fin(),
            syn: tcp.syn(),
            rst: tcp.rst(),
            psh: tcp.psh(),
            ack: tcp.ack(),
            urg: tcp.urg(),
        },
        payload: tcp.payload().to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod test_frames {
    /// Build an Ethernet/IPv4/TCP frame with the given ports, seq, flags and
    /// payload. Checksums are left zeroed; the slicer does not verify them.
    pub fn tcp_frame(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut pkt = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // dst mac
            0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, // src mac
            0x08, 0x00, // ethertype IPv4
        ];

        let total_len = (20 + 20 + payload.len()) as u16;
        pkt.extend_from_slice(&[0x45, 0x00]);
        pkt.extend_from_slice(&total_len.to_be_bytes());
        pkt.extend_from_slice(&[
            0x12, 0x34, // identification
            0x40, 0x00, // flags (DF), fragment offset
            0x40, // TTL
            0x06, // protocol TCP
            0x00, 0x00, // checksum
        ]);
        pkt.extend_from_slice(&src_ip);
        pkt.extend_from_slice(&dst_ip);

        pkt.extend_from_slice(&src_port.to_be_bytes());
        pkt.extend_from_slice(&dst_port.to_be_bytes());
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // ack
        pkt.push(0x50); // data offset = 5
        pkt.push(flags);
        pkt.extend_from_slice(&[0xff, 0xff]); // window
        pkt.extend_from_slice(&[0x00, 0x00]); // checksum
        pkt.extend_from_slice(&[0x00, 0x00]); // urgent pointer
        pkt.extend_from_slice(payload);

        pkt
    }

    pub const FLAG_FIN: u8 = 0x01;
    pub const FLAG_SYN: u8 = 0x02;
    pub const FLAG_RST: u8 = 0x04;
    pub const FLAG_PSH: u8 = 0x08;
    pub const FLAG_ACK: u8 = 0x10;
}

#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    #[test]
    fn test_decode_tcp_frame() {
        let data = tcp_frame(
            [192, 168, 1, 100],
            [10, 0, 0, 1],
            54321,
            80,
            1000,
            FLAG_PSH | FLAG_ACK,
            b"hello",
        );

        let seg = decode_frame(&data).expect("should decode");
        let (src, dst) = seg.endpoints();
        assert_eq!(src.to_string(), "192.168.1.100:54321");
        assert_eq!(dst.to_string(), "10.0.0.1:80");
        assert_eq!(seg.seq, 1000);
        assert!(seg.flags.psh);
        assert!(seg.flags.ack);
        assert_eq!(seg.payload, b"hello");
    }

    #[test]
    fn test_both_directions_share_key() {
        let fwd = tcp_frame([192, 168, 1, 100], [10, 0, 0, 1], 54321, 80, 1, FLAG_ACK, b"");
        let bwd = tcp_frame([10, 0, 0, 1], [192, 168, 1, 100], 80, 54321, 1, FLAG_ACK, b"");

        let a = decode_frame(&fwd).unwrap();
        let b = decode_frame(&bwd).unwrap();
        assert_eq!(a.key, b.key);
        assert_ne!(a.direction, b.direction);
        assert_eq!(a.direction, b.direction.flip());
    }

    #[test]
    fn test_non_ip_discarded() {
        // ARP ethertype
        let mut data = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb,
            0x08, 0x06,
        ];
        data.extend_from_slice(&[0u8; 28]);
        assert!(decode_frame(&data).is_none());
    }

    #[test]
    fn test_truncated_frame_discarded() {
        let data = tcp_frame([1, 2, 3, 4], [5, 6, 7, 8], 1, 2, 0, FLAG_SYN, b"");
        assert!(decode_frame(&data[..20]).is_none());
    }

    #[test]
    fn test_zero_payload_control_segment_kept() {
        let data = tcp_frame([1, 2, 3, 4], [5, 6, 7, 8], 1234, 80, 99, FLAG_FIN | FLAG_ACK, b"");
        let seg = decode_frame(&data).expect("control segment must decode");
        assert!(seg.payload.is_empty());
        assert!(seg.flags.fin);
    }
}

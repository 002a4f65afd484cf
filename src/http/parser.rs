//! Incremental HTTP/1.x message framing
//!
//! Decodes a sequence of HTTP messages from a reassembled byte stream without
//! ever buffering a whole connection: header bytes accumulate only until the
//! blank line, body bytes are counted and discarded as they arrive.
//!
//! Framing is unrecoverable after a desync, so any unparseable start line or
//! header abandons the stream permanently.

use crate::stream::StreamEnd;

use super::{HttpLimits, MessageSummary, ParserMode};

/// Parsed start line plus the headers the summary needs.
#[derive(Debug)]
struct Head {
    start: StartLine,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
}

impl Head {
    fn new(start: StartLine) -> Self {
        Self {
            start,
            host: None,
            content_length: None,
            chunked: false,
        }
    }
}

#[derive(Debug)]
enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        status: u16,
        reason: String,
        version: String,
    },
}

impl Head {
    fn summarize(self, body_bytes: u64, truncated: bool) -> MessageSummary {
        match self.start {
            StartLine::Request {
                method,
                target,
                version,
            } => MessageSummary::Request {
                method,
                target,
                version,
                host: self.host,
                body_bytes,
                truncated,
            },
            StartLine::Response {
                status,
                reason,
                version,
            } => MessageSummary::Response {
                status,
                reason,
                version,
                body_bytes,
                truncated,
            },
        }
    }

    /// Whether a response with no length determinant can carry a body.
    fn body_possible(&self) -> bool {
        match &self.start {
            StartLine::Request { .. } => false,
            StartLine::Response { status, .. } => {
                !(*status >= 100 && *status < 200) && *status != 204 && *status != 304
            }
        }
    }
}

#[derive(Debug)]
enum State {
    AwaitingStartLine,
    ReadingHeaders { head: Head, header_bytes: usize },
    FixedBody { head: Head, remaining: u64, total: u64 },
    ChunkSize { head: Head, body_so_far: u64 },
    ChunkData { head: Head, body_so_far: u64, remaining: u64 },
    ChunkDataEnd { head: Head, body_so_far: u64 },
    Trailers { head: Head, body_so_far: u64 },
    UntilClose { head: Head, body_so_far: u64 },
    /// Framing lost; all further input is discarded.
    Desynced,
    Closed,
}

/// One directional stream's message decoder.
pub struct MessageParser {
    mode: ParserMode,
    limits: HttpLimits,
    state: State,
    buf: Vec<u8>,
}

impl MessageParser {
    pub fn new(mode: ParserMode, limits: HttpLimits) -> Self {
        Self {
            mode,
            limits,
            state: State::AwaitingStartLine,
            buf: Vec::new(),
        }
    }

    pub fn is_desynced(&self) -> bool {
        matches!(self.state, State::Desynced)
    }

    /// Feed stream bytes; returns every message completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<MessageSummary> {
        let mut completed = Vec::new();
        if matches!(self.state, State::Desynced | State::Closed) {
            return completed;
        }
        self.buf.extend_from_slice(bytes);

        loop {
            let state = std::mem::replace(&mut self.state, State::Desynced);
            match self.step(state, &mut completed) {
                Progress::Continue => {}
                Progress::NeedMore => break,
            }
            if matches!(self.state, State::Desynced) {
                self.buf.clear();
                break;
            }
        }
        completed
    }

    /// The stream ended; emit a truncated summary if a body was underway.
    pub fn finish(&mut self, end: StreamEnd) -> Option<MessageSummary> {
        let state = std::mem::replace(&mut self.state, State::Closed);
        self.buf.clear();
        match state {
            State::FixedBody { head, remaining, total } => {
                Some(head.summarize(total - remaining, true))
            }
            State::ChunkSize { head, body_so_far }
            | State::ChunkData { head, body_so_far, .. }
            | State::ChunkDataEnd { head, body_so_far }
            | State::Trailers { head, body_so_far } => Some(head.summarize(body_so_far, true)),
            State::UntilClose { head, body_so_far } => {
                Some(head.summarize(body_so_far, end == StreamEnd::Abrupt))
            }
            // Nothing in flight, or the head never completed: no summary.
            State::AwaitingStartLine
            | State::ReadingHeaders { .. }
            | State::Desynced
            | State::Closed => None,
        }
    }

    fn step(&mut self, state: State, completed: &mut Vec<MessageSummary>) -> Progress {
        match state {
            State::AwaitingStartLine => self.step_start_line(),
            State::ReadingHeaders { head, header_bytes } => {
                self.step_headers(head, header_bytes, completed)
            }
            State::FixedBody { head, remaining, total } => {
                let take = (self.buf.len() as u64).min(remaining) as usize;
                self.buf.drain(..take);
                let remaining = remaining - take as u64;
                if remaining == 0 {
                    completed.push(head.summarize(total, false));
                    self.state = State::AwaitingStartLine;
                    Progress::Continue
                } else {
                    self.state = State::FixedBody { head, remaining, total };
                    Progress::NeedMore
                }
            }
            State::ChunkSize { head, body_so_far } => {
                let line = match self.take_line(self.limits.max_head_bytes) {
                    LineResult::Line(line) => line,
                    LineResult::NeedMore => {
                        self.state = State::ChunkSize { head, body_so_far };
                        return Progress::NeedMore;
                    }
                    LineResult::Overflow => return Progress::Continue, // state stays Desynced
                };
                // Chunk extensions after ';' are tolerated and ignored.
                let size_part = line.split(';').next().unwrap_or("").trim();
                let size = match u64::from_str_radix(size_part, 16) {
                    Ok(n) => n,
                    Err(_) => return Progress::Continue, // desync
                };
                if size == 0 {
                    self.state = State::Trailers { head, body_so_far };
                } else {
                    self.state = State::ChunkData {
                        head,
                        body_so_far,
                        remaining: size,
                    };
                }
                Progress::Continue
            }
            State::ChunkData { head, body_so_far, remaining } => {
                let take = (self.buf.len() as u64).min(remaining) as usize;
                self.buf.drain(..take);
                let body_so_far = body_so_far + take as u64;
                let remaining = remaining - take as u64;
                if remaining == 0 {
                    self.state = State::ChunkDataEnd { head, body_so_far };
                    Progress::Continue
                } else {
                    self.state = State::ChunkData { head, body_so_far, remaining };
                    Progress::NeedMore
                }
            }
            State::ChunkDataEnd { head, body_so_far } => {
                // The CRLF that closes each chunk's data.
                if self.buf.len() < 2 {
                    self.state = State::ChunkDataEnd { head, body_so_far };
                    return Progress::NeedMore;
                }
                if &self.buf[..2] != b"\r\n" {
                    return Progress::Continue; // desync
                }
                self.buf.drain(..2);
                self.state = State::ChunkSize { head, body_so_far };
                Progress::Continue
            }
            State::Trailers { head, body_so_far } => {
                match self.take_line(self.limits.max_head_bytes) {
                    LineResult::Line(line) if line.is_empty() => {
                        completed.push(head.summarize(body_so_far, false));
                        self.state = State::AwaitingStartLine;
                        Progress::Continue
                    }
                    LineResult::Line(_) => {
                        // Trailer header; framing only, content ignored.
                        self.state = State::Trailers { head, body_so_far };
                        Progress::Continue
                    }
                    LineResult::NeedMore => {
                        self.state = State::Trailers { head, body_so_far };
                        Progress::NeedMore
                    }
                    LineResult::Overflow => Progress::Continue, // desync
                }
            }
            State::UntilClose { head, body_so_far } => {
                let take = self.buf.len();
                self.buf.drain(..take);
                self.state = State::UntilClose {
                    head,
                    body_so_far: body_so_far + take as u64,
                };
                Progress::NeedMore
            }
            State::Desynced | State::Closed => Progress::NeedMore,
        }
    }

    fn step_start_line(&mut self) -> Progress {
        let line = match self.take_line(self.limits.max_head_bytes) {
            LineResult::Line(line) => line,
            LineResult::NeedMore => {
                self.state = State::AwaitingStartLine;
                return Progress::NeedMore;
            }
            LineResult::Overflow => return Progress::Continue, // desync
        };
        // Tolerate blank lines between pipelined messages.
        if line.is_empty() {
            self.state = State::AwaitingStartLine;
            return Progress::Continue;
        }

        let start = match self.mode {
            ParserMode::Request => parse_request_line(&line),
            ParserMode::Response => parse_status_line(&line),
        };
        match start {
            Some(start) => {
                self.state = State::ReadingHeaders {
                    head: Head::new(start),
                    header_bytes: 0,
                };
                Progress::Continue
            }
            None => Progress::Continue, // desync
        }
    }

    fn step_headers(
        &mut self,
        mut head: Head,
        mut header_bytes: usize,
        completed: &mut Vec<MessageSummary>,
    ) -> Progress {
        loop {
            if header_bytes > self.limits.max_head_bytes {
                return Progress::Continue; // desync
            }
            let line = match self.take_line(self.limits.max_head_bytes) {
                LineResult::Line(line) => line,
                LineResult::NeedMore => {
                    self.state = State::ReadingHeaders { head, header_bytes };
                    return Progress::NeedMore;
                }
                LineResult::Overflow => return Progress::Continue, // desync
            };
            header_bytes += line.len() + 2;

            if line.is_empty() {
                // End of headers; pick the body framing.
                if head.chunked {
                    self.state = State::ChunkSize { head, body_so_far: 0 };
                } else if let Some(total) = head.content_length {
                    if total == 0 {
                        completed.push(head.summarize(0, false));
                        self.state = State::AwaitingStartLine;
                    } else {
                        self.state = State::FixedBody {
                            head,
                            remaining: total,
                            total,
                        };
                    }
                } else if head.body_possible() {
                    self.state = State::UntilClose { head, body_so_far: 0 };
                } else {
                    completed.push(head.summarize(0, false));
                    self.state = State::AwaitingStartLine;
                }
                return Progress::Continue;
            }

            let (name, value) = match line.split_once(':') {
                Some((n, v)) => (n.trim().to_ascii_lowercase(), v.trim().to_string()),
                None => return Progress::Continue, // desync
            };
            match name.as_str() {
                "content-length" => match value.parse::<u64>() {
                    Ok(n) => head.content_length = Some(n),
                    Err(_) => return Progress::Continue, // desync
                },
                "transfer-encoding" => {
                    if value.to_ascii_lowercase().contains("chunked") {
                        head.chunked = true;
                    }
                }
                "host" => head.host = Some(value),
                _ => {}
            }
        }
    }

    /// Pop one CRLF-terminated line off the buffer. Bare LF is tolerated.
    fn take_line(&mut self, cap: usize) -> LineResult {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
                line.pop(); // '\n'
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                match String::from_utf8(line) {
                    Ok(s) => LineResult::Line(s),
                    Err(_) => LineResult::Overflow, // binary data is not HTTP
                }
            }
            None if self.buf.len() > cap => LineResult::Overflow,
            None => LineResult::NeedMore,
        }
    }
}

enum Progress {
    Continue,
    NeedMore,
}

enum LineResult {
    Line(String),
    NeedMore,
    Overflow,
}

/// `"METHOD target HTTP/x.y"`
fn parse_request_line(line: &str) -> Option<StartLine> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }
    // Methods are tokens: uppercase letters in practice.
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'-') {
        return None;
    }
    Some(StartLine::Request {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

/// `"HTTP/x.y STATUS reason..."`
fn parse_status_line(line: &str) -> Option<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status: u16 = parts.next()?.parse().ok()?;
    if !(100..=599).contains(&status) {
        return None;
    }
    let reason = parts.next().unwrap_or("").to_string();
    Some(StartLine::Response {
        status,
        reason,
        version: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_parser() -> MessageParser {
        MessageParser::new(ParserMode::Request, HttpLimits::default())
    }

    fn response_parser() -> MessageParser {
        MessageParser::new(ParserMode::Response, HttpLimits::default())
    }

    #[test]
    fn test_get_with_content_length() {
        let mut p = request_parser();
        let out = p.push(b"GET /a HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(out.len(), 1);
        match &out[0] {
            MessageSummary::Request { method, target, host, body_bytes, truncated, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(target, "/a");
                assert_eq!(host.as_deref(), Some("x"));
                assert_eq!(*body_bytes, 5);
                assert!(!truncated);
            }
            other => panic!("expected request, got {:?}", other),
        }
        // Back in start-line state: a second message parses.
        let out = p.push(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let mut p = request_parser();
        let msg = b"POST /up HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let mut out = Vec::new();
        for &b in msg.iter() {
            out.extend(p.push(&[b]));
        }
        assert_eq!(out.len(), 1);
        match &out[0] {
            MessageSummary::Request { method, body_bytes, .. } => {
                assert_eq!(method, "POST");
                assert_eq!(*body_bytes, 3);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_chunked_body_counts_data_only() {
        let mut p = response_parser();
        let out = p.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            MessageSummary::Response { status, body_bytes, truncated, .. } => {
                assert_eq!(*status, 200);
                assert_eq!(*body_bytes, 3);
                assert!(!truncated);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_chunked_with_extension_and_trailer() {
        let mut p = response_parser();
        let out = p.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nwxyz\r\n0\r\nX-Sum: 1\r\n\r\n",
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            MessageSummary::Response { body_bytes, .. } => assert_eq!(*body_bytes, 4),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_fixed_body() {
        let mut p = request_parser();
        let out = p.push(b"PUT /big HTTP/1.1\r\nContent-Length: 100\r\n\r\n");
        assert!(out.is_empty());
        assert!(p.push(&[0x61; 40]).is_empty());

        let summary = p.finish(StreamEnd::Abrupt).expect("truncated summary");
        match summary {
            MessageSummary::Request { body_bytes, truncated, .. } => {
                assert_eq!(body_bytes, 40);
                assert!(truncated);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_clean_end_with_empty_buffer() {
        let mut p = request_parser();
        p.push(b"GET / HTTP/1.1\r\n\r\n");
        assert!(p.finish(StreamEnd::Clean).is_none());
    }

    #[test]
    fn test_response_body_until_close() {
        let mut p = response_parser();
        let out = p.push(b"HTTP/1.0 200 OK\r\n\r\nsome body text");
        assert!(out.is_empty());
        p.push(b" and more");

        let summary = p.finish(StreamEnd::Clean).expect("read-to-close summary");
        match summary {
            MessageSummary::Response { body_bytes, truncated, .. } => {
                assert_eq!(body_bytes, 23);
                assert!(!truncated);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_status_204_has_no_body() {
        let mut p = response_parser();
        let out = p.push(b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_desync_on_garbage_start_line() {
        let mut p = request_parser();
        let out = p.push(b"\x16\x03\x01\x02\x00random tls bytes\r\n rest");
        assert!(out.is_empty());
        assert!(p.is_desynced());
        // Once desynced the stream stays abandoned.
        assert!(p.push(b"GET / HTTP/1.1\r\n\r\n").is_empty());
        assert!(p.finish(StreamEnd::Clean).is_none());
    }

    #[test]
    fn test_desync_on_response_stream_in_request_mode() {
        // The wrong-direction parser must abandon, not misparse.
        let mut p = request_parser();
        p.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
        assert!(p.is_desynced());
    }

    #[test]
    fn test_oversized_start_line_desyncs() {
        let mut p = MessageParser::new(
            ParserMode::Request,
            HttpLimits { max_head_bytes: 64 },
        );
        p.push(&[b'A'; 100]);
        assert!(p.is_desynced());
    }

    #[test]
    fn test_keepalive_three_messages_one_push() {
        let mut p = request_parser();
        let out = p.push(
            b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nPOST /3 HTTP/1.1\r\nContent-Length: 2\r\n\r\nok",
        );
        assert_eq!(out.len(), 3);
    }
}

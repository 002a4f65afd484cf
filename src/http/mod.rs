//! HTTP message summarization
//!
//! Consumes a reassembled directional byte stream and reports one summary per
//! HTTP message framed on it. Bodies are never retained, only measured.

mod parser;

pub use parser::MessageParser;

use serde::Serialize;

use crate::packet::{Direction, FlowKey};
use crate::report::ReportSink;
use crate::stream::{ReassembledStream, StreamEnd, StreamEvent};

/// Which side of the conversation a parser expects to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    Request,
    Response,
}

/// Framing limits for the head of a message.
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    /// Cap on start line and header bytes before the stream is abandoned as
    /// not-HTTP.
    pub max_head_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
        }
    }
}

/// What gets reported about one HTTP message. Body content is discarded
/// during parsing; only its length survives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSummary {
    Request {
        method: String,
        target: String,
        version: String,
        host: Option<String>,
        body_bytes: u64,
        truncated: bool,
    },
    Response {
        status: u16,
        reason: String,
        version: String,
        body_bytes: u64,
        truncated: bool,
    },
}

/// Per-flow consumer task body: pump stream events through a message parser
/// and report each completed summary.
///
/// Every flow is fed to both a request-mode and a response-mode consumer; the
/// one reading the wrong direction desyncs on the first start line and then
/// just drains the channel so the producer never sees backpressure.
pub async fn consume_stream(
    key: FlowKey,
    direction: Direction,
    mode: ParserMode,
    limits: HttpLimits,
    mut stream: ReassembledStream,
    sink: impl ReportSink,
) {
    let mut parser = MessageParser::new(mode, limits);
    loop {
        match stream.next_event().await {
            Some(StreamEvent::Data(bytes)) => {
                for summary in parser.push(&bytes) {
                    sink.report(&key, direction, &summary);
                }
            }
            Some(StreamEvent::End(end)) => {
                if let Some(summary) = parser.finish(end) {
                    sink.report(&key, direction, &summary);
                }
                return;
            }
            // Producer dropped without an end event; treat as abrupt.
            None => {
                if let Some(summary) = parser.finish(StreamEnd::Abrupt) {
                    sink.report(&key, direction, &summary);
                }
                return;
            }
        }
    }
}

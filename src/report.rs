//! Summary reporting
//!
//! A `ReportSink` receives one call per completed (or truncated) HTTP message.
//! The default sink writes human-readable log lines; the JSON sink emits one
//! object per line on stdout for downstream tooling.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::http::MessageSummary;
use crate::packet::{Direction, FlowKey};

pub trait ReportSink: Clone + Send + 'static {
    fn report(&self, key: &FlowKey, direction: Direction, summary: &MessageSummary);
}

/// Reports through the `tracing` pipeline.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, key: &FlowKey, direction: Direction, summary: &MessageSummary) {
        let (src, dst) = key.endpoints(direction);
        match summary {
            MessageSummary::Request {
                method,
                target,
                host,
                body_bytes,
                truncated,
                ..
            } => {
                info!(
                    %src,
                    %dst,
                    method = %method,
                    target = %target,
                    host = host.as_deref().unwrap_or("-"),
                    body_bytes,
                    truncated,
                    "request"
                );
            }
            MessageSummary::Response {
                status,
                reason,
                body_bytes,
                truncated,
                ..
            } => {
                info!(
                    %src,
                    %dst,
                    status,
                    reason = %reason,
                    body_bytes,
                    truncated,
                    "response"
                );
            }
        }
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    time: DateTime<Utc>,
    src: String,
    dst: String,
    #[serde(flatten)]
    summary: &'a MessageSummary,
}

/// One JSON object per message on stdout.
#[derive(Debug, Clone, Default)]
pub struct JsonSink;

impl ReportSink for JsonSink {
    fn report(&self, key: &FlowKey, direction: Direction, summary: &MessageSummary) {
        let (src, dst) = key.endpoints(direction);
        let record = JsonRecord {
            time: Utc::now(),
            src: src.to_string(),
            dst: dst.to_string(),
            summary,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize report");
                return;
            }
        };
        line.push('\n');
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        // A broken stdout pipe is not worth crashing the capture over.
        let _ = out.write_all(line.as_bytes());
    }
}

/// Accumulates reports in memory; test use only.
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    reports: Arc<Mutex<Vec<(FlowKey, Direction, MessageSummary)>>>,
}

impl CollectSink {
    pub fn take(&self) -> Vec<(FlowKey, Direction, MessageSummary)> {
        std::mem::take(&mut *self.reports.lock())
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl ReportSink for CollectSink {
    fn report(&self, key: &FlowKey, direction: Direction, summary: &MessageSummary) {
        self.reports
            .lock()
            .push((*key, direction, summary.clone()));
    }
}

//! Capture engine
//!
//! Owns the whole pipeline: a dedicated capture thread reads frames and hands
//! them over a bounded channel to the async dispatch loop, which decodes,
//! reassembles, and spawns one parser task per directional stream.
//!
//! Request/response direction is never guessed from ports or handshake state.
//! Instead every segment feeds two independent reassemblers, one whose
//! consumers parse requests and one whose consumers parse responses; the
//! wrong-direction parser desyncs on its first start line and goes quiet.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::capture::{CapturedFrame, FrameSource};
use crate::config::Config;
use crate::error::Result;
use crate::http::{consume_stream, HttpLimits, ParserMode};
use crate::packet::decode_frame;
use crate::reassembly::{NewStream, StreamReassembler};
use crate::report::ReportSink;

/// Backlog between the capture thread and the dispatch loop. The capture
/// thread blocks when dispatch falls behind, pushing loss into the kernel
/// drop counter instead of unbounded memory.
const FRAME_QUEUE_DEPTH: usize = 4096;

pub struct Engine {
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the pipeline to completion: end of the capture file, a fatal
    /// capture error, or Ctrl-C.
    pub async fn run(self, source: Box<dyn FrameSource>, sink: impl ReportSink) -> Result<()> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<Result<CapturedFrame>>(FRAME_QUEUE_DEPTH);

        let capture_thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(source, frame_tx))
            .expect("spawn capture thread");

        let reassembly = &self.config.reassembly;
        let mut request_side =
            StreamReassembler::new(reassembly.max_flows, reassembly.max_pending_bytes);
        let mut response_side =
            StreamReassembler::new(reassembly.max_flows, reassembly.max_pending_bytes);
        let staleness = Duration::from_secs(reassembly.stale_timeout_secs);
        let mut reap_timer =
            tokio::time::interval(Duration::from_secs(reassembly.reap_interval_secs.max(1)));

        let limits = HttpLimits {
            max_head_bytes: self.config.http.max_head_bytes,
        };
        let mut consumers = JoinSet::new();
        let mut frames: u64 = 0;
        let mut segments: u64 = 0;
        let mut fatal = None;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(Ok(frame)) => {
                            frames += 1;
                            let Some(segment) = decode_frame(&frame.data) else {
                                continue;
                            };
                            segments += 1;
                            spawn_consumer(
                                &mut consumers,
                                request_side.handle_segment(&segment),
                                ParserMode::Request,
                                limits,
                                &sink,
                            );
                            spawn_consumer(
                                &mut consumers,
                                response_side.handle_segment(&segment),
                                ParserMode::Response,
                                limits,
                                &sink,
                            );
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "capture failed");
                            fatal = Some(e);
                            break;
                        }
                        // Capture thread finished: end of file or shutdown.
                        None => break,
                    }
                }
                _ = reap_timer.tick() => {
                    // Reclaim finished consumer entries; a long-lived capture
                    // must not accumulate one per flow ever seen.
                    while consumers.try_join_next().is_some() {}
                    let reaped =
                        request_side.reap(staleness) + response_side.reap(staleness);
                    info!(
                        frames,
                        segments,
                        request_flows = request_side.live_flows(),
                        response_flows = response_side.live_flows(),
                        reaped,
                        "engine stats"
                    );
                }
                _ = &mut ctrl_c => {
                    info!("interrupt received, shutting down");
                    break;
                }
            }
        }

        // Terminate every live stream so the parser tasks can emit their
        // truncated summaries, then wait for them.
        request_side.close_all();
        response_side.close_all();
        drop(frame_rx);
        while consumers.join_next().await.is_some() {}

        // The capture thread unblocks once the channel is gone.
        if capture_thread.join().is_err() {
            error!("capture thread panicked");
        }

        let req_stats = request_side.stats();
        info!(
            frames,
            segments,
            flows_seen = req_stats.created,
            "capture finished"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_consumer(
    consumers: &mut JoinSet<()>,
    new_stream: Option<NewStream>,
    mode: ParserMode,
    limits: HttpLimits,
    sink: &impl ReportSink,
) {
    if let Some(NewStream { key, direction, stream }) = new_stream {
        debug!(flow = %key, %direction, ?mode, "new directional stream");
        consumers.spawn(consume_stream(
            key,
            direction,
            mode,
            limits,
            stream,
            sink.clone(),
        ));
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    tx: mpsc::Sender<Result<CapturedFrame>>,
) {
    loop {
        match source.next_frame() {
            Ok(Some(frame)) => {
                // Send fails only when the dispatch loop is gone.
                if tx.blocking_send(Ok(frame)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("frame source exhausted");
                return;
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

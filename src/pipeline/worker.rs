//! Pipeline worker loops
//!
//! One [`DecodeWorker`] runs per source and feeds a shared frame queue; a
//! single [`DispatchWorker`] drains that queue into the sink channels.

use super::stats::PipelineStats;
use crate::config::QueuePolicy;
use crate::dispatch::Dispatcher;
use crate::pool::{Pool, Pooled};
use crate::protocol::{Decoder, DiscreteContext, ExecutionContext, FrameError, RingReader, StreamContext};
use crate::scripting::Environment;
use crate::types::{FrameBatch, Point, SinkBatch};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a worker waits on an empty queue before re-checking `running`
const RECV_POLL: Duration = Duration::from_millis(100);
/// How long a blocked send waits before re-checking `running`
const SEND_POLL: Duration = Duration::from_millis(50);
/// Interval between periodic stats log lines
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Send `item` according to `policy`.
///
/// Returns the item back when it could not be delivered, with `true` when
/// the receiver is gone for good.
fn send_with_policy<T>(
    tx: &Sender<T>,
    item: T,
    policy: QueuePolicy,
    running: &AtomicBool,
) -> Result<(), (T, bool)> {
    match policy {
        QueuePolicy::Block => {
            let mut pending = item;
            loop {
                match tx.send_timeout(pending, SEND_POLL) {
                    Ok(()) => return Ok(()),
                    Err(SendTimeoutError::Timeout(item)) => {
                        if !running.load(Ordering::Relaxed) {
                            return Err((item, false));
                        }
                        pending = item;
                    }
                    Err(SendTimeoutError::Disconnected(item)) => return Err((item, true)),
                }
            }
        }
        QueuePolicy::Drop => match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => Err((item, false)),
            Err(TrySendError::Disconnected(item)) => Err((item, true)),
        },
    }
}

/// Decodes the frames of one source
pub(crate) struct DecodeWorker {
    source: String,
    decoder: Decoder,
    env: Environment,
    points: Arc<Pool<Point>>,
    out: Sender<FrameBatch>,
    policy: QueuePolicy,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
}

impl DecodeWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source: impl Into<String>,
        decoder: Decoder,
        env: Environment,
        points: Arc<Pool<Point>>,
        out: Sender<FrameBatch>,
        policy: QueuePolicy,
        stats: Arc<PipelineStats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source: source.into(),
            decoder,
            env,
            points,
            out,
            policy,
            stats,
            running,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run a frame source until its handles are dropped or the pipeline stops
    pub(crate) fn run_frames(mut self, rx: Receiver<Pooled<Vec<u8>>>) {
        info!(source = %self.source, "Frame decode worker started");

        while self.is_running() {
            let frame = match rx.recv_timeout(RECV_POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            self.stats.record_received();
            let started = Instant::now();
            let result = self
                .decoder
                .decode_frame(&mut self.env, &mut DiscreteContext::new(&frame));
            drop(frame);

            if !self.complete(result, started) {
                break;
            }
        }

        info!(source = %self.source, "Frame decode worker stopped");
    }

    /// Run a stream source until the ring closes or the pipeline stops
    pub(crate) fn run_stream(mut self, mut reader: RingReader) {
        info!(source = %self.source, "Stream decode worker started");
        let mut scratch = Vec::new();

        while self.is_running() {
            let started = Instant::now();
            let mut ctx = StreamContext::with_scratch(&mut reader, scratch);
            let result = self.decoder.decode_frame(&mut self.env, &mut ctx);
            let consumed = ctx.position();
            scratch = ctx.into_scratch();

            // Nothing read yet: the stream is idle or finished, not broken
            match &result {
                Err(FrameError::Timeout { .. }) if consumed == 0 => continue,
                Err(FrameError::Closed { .. }) if consumed == 0 => break,
                _ => {}
            }

            self.stats.record_received();
            let closed = matches!(&result, Err(e) if e.is_closed());
            if !self.complete(result, started) || closed {
                break;
            }
        }

        reader.close();
        info!(source = %self.source, "Stream decode worker stopped");
    }

    /// Account for one decode result and forward the batch.
    ///
    /// Returns false once the dispatch side is gone.
    fn complete(&mut self, result: Result<FrameBatch, FrameError>, started: Instant) -> bool {
        let mut batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_frame_error();
                warn!(source = %self.source, "Frame dropped: {}", e);
                return true;
            }
        };

        batch.source.clone_from(&self.source);
        self.stats.record_decoded(batch.len(), started.elapsed());
        debug!(
            source = %self.source,
            frame_id = %batch.frame_id,
            points = batch.len(),
            "Frame decoded"
        );

        match send_with_policy(&self.out, batch, self.policy, &self.running) {
            Ok(()) => true,
            Err((batch, disconnected)) => {
                if !disconnected {
                    self.stats.record_dropped();
                    warn!(source = %self.source, frame_id = %batch.frame_id, "Frame queue full, frame dropped");
                }
                batch.points.into_iter().for_each(|p| self.points.put(p));
                !disconnected
            }
        }
    }
}

/// Routes decoded frames to the sink channels
pub(crate) struct DispatchWorker {
    dispatcher: Box<dyn Dispatcher>,
    sinks: HashMap<String, Sender<SinkBatch>>,
    points: Arc<Pool<Point>>,
    policy: QueuePolicy,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
}

impl DispatchWorker {
    pub(crate) fn new(
        dispatcher: Box<dyn Dispatcher>,
        sinks: HashMap<String, Sender<SinkBatch>>,
        points: Arc<Pool<Point>>,
        policy: QueuePolicy,
        stats: Arc<PipelineStats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dispatcher,
            sinks,
            points,
            policy,
            stats,
            running,
        }
    }

    /// Run until every decode worker has exited or the pipeline stops
    pub(crate) fn run(mut self, rx: Receiver<FrameBatch>) {
        info!(sinks = self.sinks.len(), "Dispatch worker started");
        let mut last_report = Instant::now();

        loop {
            if !self.running.load(Ordering::Relaxed) {
                let abandoned = rx.try_iter().map(|frame| self.recycle(frame)).count();
                if abandoned > 0 {
                    debug!(abandoned, "Discarded queued frames on shutdown");
                }
                break;
            }

            match rx.recv_timeout(RECV_POLL) {
                Ok(frame) => self.handle(frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_report.elapsed() >= STATS_INTERVAL {
                let snap = self.stats.snapshot();
                info!(
                    received = snap.frames_received,
                    decoded = snap.frames_decoded,
                    errors = snap.frames_errored,
                    dropped = snap.frames_dropped,
                    batches = snap.batches_delivered,
                    avg_decode_us = format!("{:.1}", snap.avg_decode_us()),
                    "Pipeline stats"
                );
                last_report = Instant::now();
            }
        }

        info!("Dispatch worker stopped");
    }

    fn handle(&mut self, frame: FrameBatch) {
        let started = Instant::now();
        match self.dispatcher.dispatch(&frame) {
            Ok(batches) => {
                let count = batches.len();
                for (name, batch) in batches {
                    self.deliver(name, batch);
                }
                self.stats.record_dispatched(count, started.elapsed());
            }
            Err(e) => {
                self.stats.record_dispatch_error();
                warn!(frame_id = %frame.frame_id, source = %frame.source, "Dispatch failed: {}", e);
            }
        }
        self.recycle(frame);
    }

    fn deliver(&mut self, name: String, batch: SinkBatch) {
        let Some(tx) = self.sinks.get(&name) else {
            return;
        };

        if let Err((batch, disconnected)) = send_with_policy(tx, batch, self.policy, &self.running) {
            if disconnected {
                warn!(sink = %name, "Sink receiver dropped, sink disabled");
                self.sinks.remove(&name);
            } else {
                warn!(sink = %name, frame_id = %batch.frame_id, "Sink queue full, batch dropped");
            }
        }
    }

    /// Sinks hold their own clones, so the frame's points can be reused
    fn recycle(&self, frame: FrameBatch) {
        frame.points.into_iter().for_each(|p| self.points.put(p));
    }
}

//! Thread boundary between connectors, the pipeline and sink consumers.
//!
//! Connectors push bytes through a [`SourceHandle`]; sink consumers pull
//! [`SinkBatch`]es from a [`SinkReceiver`]. Everything in between runs on
//! pipeline threads.

use crate::config::SourceMode;
use crate::error::{GatewayError, Result};
use crate::pool::{Pool, Pooled};
use crate::protocol::RingWriter;
use crate::types::SinkBatch;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Channel capacity per sink (dispatch → consumer).
/// 4,096 batches ≈ 4s at 1kHz frame rate.
pub(crate) const SINK_CHANNEL_CAPACITY: usize = 4_096;

/// Connector-side handle of one input source.
///
/// Frame sources take whole frames; stream sources take arbitrary chunks
/// of a continuous byte stream. Dropping every handle of a source ends it
/// once the pipeline has drained what was already sent.
#[derive(Debug, Clone)]
pub enum SourceHandle {
    Frames {
        tx: Sender<Pooled<Vec<u8>>>,
        buffers: Arc<Pool<Vec<u8>>>,
    },
    Stream(RingWriter),
}

impl SourceHandle {
    pub(crate) fn frames(
        capacity: usize,
        buffers: Arc<Pool<Vec<u8>>>,
    ) -> (Self, Receiver<Pooled<Vec<u8>>>) {
        let (tx, rx) = bounded(capacity);
        (Self::Frames { tx, buffers }, rx)
    }

    pub fn mode(&self) -> SourceMode {
        match self {
            Self::Frames { .. } => SourceMode::Frames,
            Self::Stream(_) => SourceMode::Stream,
        }
    }

    /// Submit bytes to the source.
    ///
    /// For a frame source `bytes` is exactly one frame; for a stream source
    /// it is appended to the stream. Blocks while the source queue is full.
    pub fn send_frame(&self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Frames { tx, buffers } => {
                let mut buf = buffers.guard();
                buf.extend_from_slice(bytes);
                tx.send(buf)
                    .map_err(|_| GatewayError::Channel("Decode worker has stopped".to_string()))
            }
            Self::Stream(writer) => {
                let mut writer = writer.clone();
                writer.write_all(bytes)?;
                Ok(())
            }
        }
    }

    /// Ring writer of a stream source, for use with `io::copy` and friends
    pub fn stream_writer(&self) -> Option<RingWriter> {
        match self {
            Self::Stream(writer) => Some(writer.clone()),
            Self::Frames { .. } => None,
        }
    }

    /// End a stream source now, even while other handles are alive
    pub fn close(&self) {
        if let Self::Stream(writer) = self {
            writer.close();
        }
    }
}

/// Consumer-side end of one sink
#[derive(Debug)]
pub struct SinkReceiver {
    name: String,
    rx: Receiver<SinkBatch>,
}

impl SinkReceiver {
    pub(crate) fn new(name: impl Into<String>) -> (Self, Sender<SinkBatch>) {
        let (tx, rx) = bounded(SINK_CHANNEL_CAPACITY);
        (
            Self {
                name: name.into(),
                rx,
            },
            tx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drain all pending batches.
    pub fn drain(&self) -> Vec<SinkBatch> {
        let mut batches = Vec::new();
        while let Ok(batch) = self.rx.try_recv() {
            batches.push(batch);
        }
        batches
    }

    /// Try to receive a single batch without blocking.
    pub fn try_recv(&self) -> Option<SinkBatch> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a batch
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SinkBatch> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Blocking iterator that ends when the pipeline stops
    pub fn iter(&self) -> impl Iterator<Item = SinkBatch> + '_ {
        std::iter::from_fn(move || loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(batch) => return Some(batch),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        })
    }
}

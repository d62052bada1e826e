//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use framegate::pipeline::SinkReceiver;
use framegate::protocol::{Decoder, DiscreteContext, ExecutionContext, FrameError};
use framegate::scripting::Environment;
use framegate::types::{FieldMap, FrameBatch, SinkBatch, TagMap};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Decode `bytes` as one discrete frame with a fresh environment.
///
/// Returns the result and the final cursor position.
pub fn decode(decoder: &Decoder, bytes: &[u8]) -> (Result<FrameBatch, FrameError>, usize) {
    let mut env = Environment::new(&BTreeMap::new());
    let mut ctx = DiscreteContext::new(bytes);
    let result = decoder.decode_frame(&mut env, &mut ctx);
    (result, ctx.position())
}

/// Tags and fields of each point, without timestamps
pub fn point_contents(batch: &FrameBatch) -> Vec<(TagMap, FieldMap)> {
    batch
        .points
        .iter()
        .map(|p| (p.tags.clone(), p.fields.clone()))
        .collect()
}

/// Collect `count` batches from a sink or panic after [`test_timeout`]
pub fn collect_batches(receiver: &SinkReceiver, count: usize) -> Vec<SinkBatch> {
    let deadline = Instant::now() + test_timeout();
    let mut batches = Vec::new();
    while batches.len() < count {
        let left = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(left) {
            Some(batch) => batches.push(batch),
            None => panic!(
                "sink '{}' produced {} of {} batches",
                receiver.name(),
                batches.len(),
                count
            ),
        }
    }
    batches
}

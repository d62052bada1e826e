//! Decode driver
//!
//! Walks the graph from node 0 until a node returns no successor, with a
//! bound on node visits so backward label jumps cannot spin forever.

use super::context::ExecutionContext;
use super::error::FrameError;
use super::graph::Graph;
use crate::config::DEFAULT_MAX_ITERATIONS;
use crate::scripting::{Environment, ExprEngine};
use crate::types::FrameBatch;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Frame decoder, cheap to clone into each worker
#[derive(Debug, Clone)]
pub struct Decoder {
    graph: Arc<Graph>,
    engine: Arc<ExprEngine>,
    max_iterations: usize,
    /// Shared across clones so frame ids stay unique per pipeline
    next_frame: Arc<AtomicU64>,
}

impl Decoder {
    pub fn new(graph: Arc<Graph>, engine: Arc<ExprEngine>) -> Self {
        Self {
            graph,
            engine,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            next_frame: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Set the maximum node visits per frame
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn engine(&self) -> &Arc<ExprEngine> {
        &self.engine
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Decode one frame from `ctx`.
    ///
    /// The environment is reset first. On error the partially accumulated
    /// points are discarded and the environment is left clean.
    pub fn decode_frame(
        &self,
        env: &mut Environment,
        ctx: &mut dyn ExecutionContext,
    ) -> Result<FrameBatch, FrameError> {
        let timestamp = Utc::now();
        env.reset();

        let mut current = if self.graph.is_empty() { None } else { Some(0) };
        let mut visits = 0usize;

        while let Some(index) = current {
            visits += 1;
            if visits > self.max_iterations {
                env.reset();
                return Err(FrameError::LoopProtection {
                    limit: self.max_iterations,
                });
            }

            let Some(node) = self.graph.node(index) else {
                break;
            };

            trace!(index, desc = node.desc(), cursor = ctx.position(), "Visiting node");
            current = match node.process(&self.graph, &self.engine, env, ctx, timestamp) {
                Ok(next) => next,
                Err(e) => {
                    env.reset();
                    return Err(e);
                }
            };
        }

        let frame_id = self.next_frame.fetch_add(1, Ordering::Relaxed);
        Ok(FrameBatch {
            frame_id: frame_id.to_string(),
            timestamp,
            source: String::new(),
            points: env.take_points(),
        })
    }
}

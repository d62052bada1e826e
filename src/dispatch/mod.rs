//! Dispatch stage
//!
//! Routes the points of a decoded frame to sinks. Two strategies implement
//! [`Dispatcher`]:
//!
//! - [`FilterHandler`] - per-sink boolean filters over point tags (primary)
//! - [`AggregationTree`] - hierarchical, regex-filtered, change-detecting
//!
//! Both share one clone of a point between every sink it matches.

mod handler;
mod tree;

pub use handler::FilterHandler;
pub use tree::AggregationTree;

use crate::types::{FrameBatch, SinkBatch};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Sink '{sink}': failed to compile filter: {message}")]
    Compile { sink: String, message: String },

    #[error("Sink '{sink}': invalid pattern: {message}")]
    Pattern { sink: String, message: String },

    #[error("Duplicate sink '{0}'")]
    DuplicateSink(String),

    #[error("Sink '{sink}': filter failed on frame {frame_id}: {message}")]
    Filter {
        sink: String,
        frame_id: String,
        message: String,
    },

    #[error("Sink '{sink}': filter returned {found}, expected bool")]
    NonBoolean { sink: String, found: String },
}

/// Turns one frame's points into per-sink batches.
///
/// Only sinks that received at least one point appear in the result. An
/// error means no sink receives anything from this frame.
pub trait Dispatcher: Send {
    fn dispatch(&mut self, frame: &FrameBatch) -> Result<BTreeMap<String, SinkBatch>, DispatchError>;

    /// Names of the sinks this dispatcher can route to
    fn sink_names(&self) -> Vec<String>;
}

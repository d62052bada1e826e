//! Threaded decode/dispatch pipeline.
//!
//! Each source gets a decode worker on its own thread; all of them feed one
//! dispatch worker over a bounded crossbeam channel. Sinks are bounded
//! channels the caller drains.
//!
//! # Architecture
//!
//! ```text
//! [SourceHandle] ──► [DecodeWorker] ──┐
//! [SourceHandle] ──► [DecodeWorker] ──┼──► [DispatchWorker] ──► [SinkReceiver]
//!                                     │                    └──► [SinkReceiver]
//! ```
//!
//! # Design
//!
//! - **Compile once**: the graph and sink filters are compiled in
//!   [`PipelineBuilder::build`]; workers only run programs.
//! - **One environment per worker**: decode state never crosses threads.
//! - **Backpressure**: full queues block or drop per `queue.policy`.
//! - **Pooled buffers**: frame buffers and points are recycled.

pub mod bridge;
pub mod executor;
pub mod stats;
mod worker;

pub use bridge::{SinkReceiver, SourceHandle};
pub use executor::{Pipeline, PipelineBuilder, PipelineHandles};
pub use stats::{PipelineStats, StatsSnapshot};

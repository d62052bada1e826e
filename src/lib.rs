//! # framegate: Protocol Decoding Gateway
//!
//! A configurable gateway that ingests binary frames or continuous byte
//! streams, decodes them according to a user-authored protocol description,
//! and routes the resulting measurement points to downstream sinks by
//! declarative filter rules.
//!
//! ## Architecture
//!
//! - **Scripting**: Rhai-based expressions compiled once per node, rule and sink filter
//! - **Protocol**: A graph of `Section`/`Skip` nodes walked per frame by the [`Decoder`]
//! - **Dispatch**: Filter handler (primary) or aggregation tree routing points to sinks
//! - **Pipeline**: Decode worker threads feeding a single dispatch worker over
//!   bounded crossbeam channels
//!
//! ```text
//! bytes ──► ExecutionContext ──► Decoder(Graph) ──► FrameBatch ──► Dispatcher ──► SinkBatch per sink
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use framegate::{config::GatewayConfig, pipeline::PipelineBuilder};
//!
//! let config = GatewayConfig::load("gateway.toml")?;
//! let (pipeline, handles) = PipelineBuilder::new(config).build()?;
//!
//! let (sources, sinks) = handles.split();
//! sources["default"].send_frame(&[0x01, 0x02, 0xAA, 0xFF])?;
//! drop(sources);
//!
//! let stats = pipeline.join();
//! for batch in sinks["influx"].drain() {
//!     println!("{} -> {} points", batch.frame_id, batch.points.len());
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use dispatch::{AggregationTree, Dispatcher, FilterHandler};
pub use error::{GatewayError, Result};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandles};
pub use protocol::{Decoder, Graph, Node};
pub use scripting::{Environment, ExprEngine, Program};
pub use types::{FrameBatch, Point, SinkBatch, Value};

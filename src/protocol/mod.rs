//! Protocol decoding
//!
//! A protocol description compiles into a [`Graph`]: an immutable array of
//! [`Node`]s plus a label table. The [`Decoder`] walks that graph once per
//! frame over an [`ExecutionContext`], collecting the points the sections
//! emit.
//!
//! ```text
//! [Section 0] --DEFAULT--> [Skip 1] --> [Section 2 "item"] --Vars.left > 0--> [Section 2 "item"]
//!                                                   \--true--> END
//! ```
//!
//! Nodes refer to each other by index only, so backward jumps need no
//! shared ownership. The graph and its programs are read concurrently by
//! every decode worker; only the per-walk [`Environment`](crate::scripting::Environment)
//! is mutated.

pub mod context;
pub mod decoder;
pub mod error;
pub mod graph;
pub mod node;
pub mod ring_buffer;

pub use context::{ByteStream, DiscreteContext, ExecutionContext, StreamContext};
pub use decoder::Decoder;
pub use error::{BuildError, FrameError, ReadError};
pub use graph::{Graph, GraphCompiler};
pub use node::{Node, RouteRule, SectionNode, SkipNode, Target, TARGET_DEFAULT, TARGET_END};
pub use ring_buffer::{ring_buffer, RingReader, RingWriter};

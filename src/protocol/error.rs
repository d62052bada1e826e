//! Protocol-specific error types.

use thiserror::Error;

/// Errors raised while building a graph from configuration.
///
/// Any of these aborts the whole build; no partial graph is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("Protocol description is empty")]
    Empty,

    #[error("Node {index}: malformed entry: {message}")]
    Malformed { index: usize, message: String },

    #[error("Node {index} ({desc}): size must be greater than 0, got {size}")]
    NonPositiveSize { index: usize, desc: String, size: i64 },

    #[error("Node {index}: skip must be a positive integer, got {value}")]
    InvalidSkip { index: usize, value: String },

    #[error("Node {index}: duplicate label '{label}' (first declared at node {first})")]
    DuplicateLabel {
        label: String,
        index: usize,
        first: usize,
    },

    #[error("Node {index} ({desc}): failed to compile {what}: {message}")]
    Compile {
        index: usize,
        desc: String,
        what: String,
        message: String,
    },
}

/// Errors that abandon a single frame.
///
/// The decode worker logs these and continues with the next frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error(
        "Node {index} ({desc}): insufficient data at cursor {cursor}: need {needed} bytes, {available} available"
    )]
    InsufficientData {
        index: usize,
        desc: String,
        cursor: usize,
        needed: usize,
        available: usize,
    },

    #[error("Node {index}: unexpected end of data after {read} of {needed} bytes")]
    UnexpectedEof {
        index: usize,
        read: usize,
        needed: usize,
    },

    #[error("Node {index}: read timed out")]
    Timeout { index: usize },

    #[error("Node {index}: stream closed")]
    Closed { index: usize },

    #[error("Routing loop protection triggered after {limit} node visits")]
    LoopProtection { limit: usize },

    #[error("Node {index} ({desc}): no route matched; vars: {vars}; conditions: {conditions:?}")]
    NoRouteMatched {
        index: usize,
        desc: String,
        vars: String,
        conditions: Vec<String>,
    },

    #[error("Node {index}: target label '{label}' not found")]
    LabelNotFound { label: String, index: usize },

    #[error("Node {index} ({desc}): condition `{condition}` returned {found}, expected bool")]
    NonBoolean {
        index: usize,
        desc: String,
        condition: String,
        found: String,
    },

    #[error("Node {index} ({desc}): {map}.{key} has unsupported type {found}")]
    UnsupportedValue {
        index: usize,
        desc: String,
        map: String,
        key: String,
        found: String,
    },

    #[error("Node {index} ({desc}): runtime error: {message}")]
    Runtime {
        index: usize,
        desc: String,
        message: String,
    },
}

impl FrameError {
    /// Whether the error means the byte source is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(self, FrameError::Closed { .. })
    }
}

/// Failure of a single cursor operation, before node context is attached
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("need {needed} bytes, {available} available")]
    Insufficient { needed: usize, available: usize },

    #[error("unexpected end of data after {read} bytes")]
    UnexpectedEof { read: usize },

    #[error("read timed out")]
    Timeout,

    #[error("stream closed")]
    Closed,
}

impl ReadError {
    /// Attach the node and cursor the read was issued for
    pub fn at_node(self, index: usize, desc: &str, cursor: usize, needed: usize) -> FrameError {
        match self {
            ReadError::Insufficient { needed, available } => FrameError::InsufficientData {
                index,
                desc: desc.to_string(),
                cursor,
                needed,
                available,
            },
            ReadError::UnexpectedEof { read } => FrameError::UnexpectedEof {
                index,
                read,
                needed,
            },
            ReadError::Timeout => FrameError::Timeout { index },
            ReadError::Closed => FrameError::Closed { index },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_label_names_both_indices() {
        let err = BuildError::DuplicateLabel {
            label: "dup".into(),
            index: 3,
            first: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("'dup'"));
        assert!(msg.contains("Node 3"));
        assert!(msg.contains("node 1"));
    }

    #[test]
    fn test_read_error_at_node() {
        let err = ReadError::Insufficient {
            needed: 4,
            available: 3,
        }
        .at_node(2, "payload", 6, 4);
        assert_eq!(
            err,
            FrameError::InsufficientData {
                index: 2,
                desc: "payload".into(),
                cursor: 6,
                needed: 4,
                available: 3,
            }
        );
        assert!(err.to_string().contains("insufficient data"));
    }

    #[test]
    fn test_is_closed() {
        assert!(ReadError::Closed.at_node(0, "", 0, 1).is_closed());
        assert!(!ReadError::Timeout.at_node(0, "", 0, 1).is_closed());
    }
}

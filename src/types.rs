//! Core data types for framegate
//!
//! This module contains the values that flow out of the decode stage and
//! through the dispatch stage.
//!
//! # Main Types
//!
//! - [`Value`] - A scalar tag or field value (int, float, bool, string)
//! - [`Point`] - One measurement emission: identity tags, value fields, timestamp
//! - [`FrameBatch`] - All points decoded from one frame
//! - [`SinkBatch`] - The points of one frame routed to one sink
//!
//! Points are plain values with no identity beyond their content. They are
//! pooled between frames, so [`Point::clear`] must leave no residue.

use chrono::{DateTime, Utc};
use rhai::Dynamic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A scalar value carried in a point's tags or fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Convert a Rhai value into a scalar, if it is one
    pub fn from_dynamic(value: &Dynamic) -> Option<Self> {
        if let Ok(b) = value.as_bool() {
            return Some(Value::Bool(b));
        }
        if let Ok(i) = value.as_int() {
            return Some(Value::Int(i));
        }
        if let Ok(f) = value.as_float() {
            return Some(Value::Float(f));
        }
        if let Ok(c) = value.as_char() {
            return Some(Value::Str(c.to_string()));
        }
        if value.is_string() {
            return value.clone().into_string().ok().map(Value::Str);
        }
        None
    }

    /// Convert this scalar into a Rhai value
    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            Value::Bool(b) => Dynamic::from(*b),
            Value::Int(i) => Dynamic::from(*i),
            Value::Float(f) => Dynamic::from(*f),
            Value::Str(s) => Dynamic::from(s.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Identity map of a point, used for routing
pub type TagMap = BTreeMap<String, Value>;

/// Value map of a point, the payload
pub type FieldMap = BTreeMap<String, Value>;

/// One measurement emitted by a decode node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Point {
    pub tags: TagMap,
    pub fields: FieldMap,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style tag insertion
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Builder-style field insertion
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Reset the point for reuse
    pub fn clear(&mut self) {
        self.tags.clear();
        self.fields.clear();
        self.timestamp = DateTime::<Utc>::default();
    }
}

/// The points decoded from a single frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameBatch {
    /// Monotonically generated frame identifier
    pub frame_id: String,
    /// Capture timestamp (when decoding of the frame started)
    pub timestamp: DateTime<Utc>,
    /// Name of the source the frame arrived on
    pub source: String,
    pub points: Vec<Point>,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// The points of one frame routed to one sink
///
/// Sinks matching the same point share a single clone of it.
#[derive(Debug, Clone)]
pub struct SinkBatch {
    pub sink: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub points: Vec<Arc<Point>>,
}

impl SinkBatch {
    pub fn new(sink: impl Into<String>, frame: &FrameBatch) -> Self {
        Self {
            sink: sink.into(),
            frame_id: frame.frame_id.clone(),
            timestamp: frame.timestamp,
            points: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

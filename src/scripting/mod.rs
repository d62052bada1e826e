//! Rhai Expression Engine for Decoding and Routing
//!
//! This module compiles the expressions found in a protocol description and
//! in sink filters into reusable [`Program`]s. Programs are compiled once
//! against a declared scope shape and evaluated per frame against an
//! [`Environment`] passed in explicitly.
//!
//! ## Decode Scope
//!
//! - `Bytes` - blob holding the current node's slice only
//! - `Vars` - frame variables, cleared between frames
//! - `Global` - read-only constants from configuration
//! - `Tag` - identity tags of the frame, copied into every emitted point
//! - `Field` - fields of the point under construction
//!
//! ## Filter Scope
//!
//! - `Tag` - the tags of the point being routed
//!
//! ## Builtins
//!
//! - `Field.set_field(name, value)`, `Tag.set_tag(name, value)`,
//!   `Vars.set_var(name, value)` - write into the environment, return `()`
//! - `u8(b, off)`, `i8(b, off)` - single byte
//! - `u16_be`, `u16_le`, `i16_be`, `i16_le`, `u32_be`, `u32_le`, `i32_be`,
//!   `i32_le`, `f32_be`, `f32_le` - `(b, off)` multi-byte reads
//! - `bcd(b, off, len)` - packed BCD digits
//! - `hex(b)` - lowercase hex string of a blob
//! - `bit(v, n)`, `bits(v, lo, len)` - bit extraction from an integer
//!
//! Reads past the end of `Bytes` are runtime errors.
//!
//! ## Example Section
//!
//! ```toml
//! [[protocol]]
//! desc = "reading"
//! size = 4
//! vars = { kind = "Bytes[0]" }
//! fields = { celsius = "i16_be(Bytes, 2) * Global.scale", raw = "hex(Bytes)" }
//! ```

mod engine;
mod environment;

pub use engine::ExprEngine;
pub use environment::{Environment, FilterEnvironment};

use rhai::AST;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Scope a program is compiled against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeShape {
    /// `Bytes`, `Vars`, `Global`, `Tag`, `Field`
    Decode,
    /// `Tag` only
    Filter,
}

/// Errors from compiling or evaluating an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("compilation error: {0}")]
    Compile(String),

    #[error("{0}")]
    Runtime(String),

    #[error("expected bool, found {0}")]
    NonBoolean(String),

    #[error("{map}.{key} has unsupported type {found}")]
    Unsupported {
        map: &'static str,
        key: String,
        found: String,
    },
}

impl From<Box<rhai::EvalAltResult>> for ExprError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        ExprError::Runtime(err.to_string())
    }
}

/// A compiled expression that can be evaluated repeatedly
#[derive(Clone)]
pub struct Program {
    /// The compiled AST
    ast: Arc<AST>,
    /// The original source code
    source: String,
    /// Name/identifier for this program
    name: String,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

/// Cache of compiled programs keyed by shape and source
#[derive(Default)]
pub struct ProgramCache {
    cache: HashMap<(ScopeShape, String), Program>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached program or compile and cache it
    pub fn get_or_compile(
        &mut self,
        compile: impl FnOnce() -> Result<AST, ExprError>,
        name: &str,
        source: &str,
        shape: ScopeShape,
    ) -> Result<Program, ExprError> {
        let key = (shape, source.to_string());
        if let Some(program) = self.cache.get(&key) {
            return Ok(program.clone());
        }

        let program = Program {
            ast: Arc::new(compile()?),
            source: source.to_string(),
            name: name.to_string(),
        };

        self.cache.insert(key, program.clone());
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Quote a map key as a Rhai string literal
fn quote(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    out.push('"');
    for c in key.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Build the single program source for a section's expressions.
///
/// Variables are assigned first, then tags, then fields; each group in key
/// order. An expression may read variables assigned earlier in the same
/// section. Returns `None` when the section has no expressions.
pub fn section_source(
    vars: &BTreeMap<String, String>,
    tags: &BTreeMap<String, String>,
    fields: &BTreeMap<String, String>,
) -> Option<String> {
    if vars.is_empty() && tags.is_empty() && fields.is_empty() {
        return None;
    }

    let mut source = String::new();
    let groups = [("Vars", "set_var", vars), ("Tag", "set_tag", tags), ("Field", "set_field", fields)];
    for (target, setter, exprs) in groups {
        for (key, expr) in exprs {
            source.push_str(&format!("{}.{}({}, ({}));\n", target, setter, quote(key), expr));
        }
    }
    source.push_str("()");
    Some(source)
}

/// Join filter fragments into one conjunction (`true` when empty)
pub fn filter_source(fragments: &[String]) -> String {
    let parts: Vec<String> = fragments
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(|f| format!("({})", f))
        .collect();

    if parts.is_empty() {
        "true".to_string()
    } else {
        parts.join(" && ")
    }
}

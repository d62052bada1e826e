//! Test data builders for protocol descriptions

use framegate::protocol::{BuildError, Decoder, Graph, GraphCompiler};
use framegate::scripting::ExprEngine;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Builder for one Section entry
pub struct SectionBuilder {
    entry: Map<String, Value>,
}

impl SectionBuilder {
    pub fn new(size: i64) -> Self {
        let mut entry = Map::new();
        entry.insert("size".into(), json!(size));
        Self { entry }
    }

    pub fn desc(mut self, desc: &str) -> Self {
        self.entry.insert("desc".into(), json!(desc));
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.entry.insert("label".into(), json!(label));
        self
    }

    pub fn field(self, name: &str, expr: &str) -> Self {
        self.expr("fields", name, expr)
    }

    pub fn tag(self, name: &str, expr: &str) -> Self {
        self.expr("tags", name, expr)
    }

    pub fn var(self, name: &str, expr: &str) -> Self {
        self.expr("vars", name, expr)
    }

    pub fn next(mut self, condition: &str, target: &str) -> Self {
        let rules = self.entry.entry("next").or_insert_with(|| json!([]));
        if let Value::Array(rules) = rules {
            rules.push(json!({ "condition": condition, "target": target }));
        }
        self
    }

    fn expr(mut self, map: &str, name: &str, expr: &str) -> Self {
        let exprs = self.entry.entry(map).or_insert_with(|| json!({}));
        if let Value::Object(exprs) = exprs {
            exprs.insert(name.into(), json!(expr));
        }
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.entry)
    }
}

/// Builder for an ordered protocol description
#[derive(Default)]
pub struct ProtocolBuilder {
    entries: Vec<Value>,
}

impl ProtocolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, section: SectionBuilder) -> Self {
        self.entries.push(section.build());
        self
    }

    pub fn skip(mut self, count: i64) -> Self {
        self.entries.push(json!({ "skip": count }));
        self
    }

    pub fn entries(&self) -> Vec<Value> {
        self.entries.clone()
    }

    pub fn graph(&self, engine: &ExprEngine) -> Result<Graph, BuildError> {
        GraphCompiler::new(engine).build(&self.entries)
    }

    /// Compile into a decoder with its own engine
    pub fn decoder(&self, max_iterations: usize) -> Decoder {
        let engine = Arc::new(ExprEngine::new());
        let graph = self.graph(&engine).expect("protocol should compile");
        Decoder::new(Arc::new(graph), engine).with_max_iterations(max_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_builder() {
        let entry = SectionBuilder::new(2)
            .label("head")
            .field("a", "Bytes[0]")
            .next("true", "END")
            .build();

        assert_eq!(entry["size"], 2);
        assert_eq!(entry["label"], "head");
        assert_eq!(entry["fields"]["a"], "Bytes[0]");
        assert_eq!(entry["next"][0]["target"], "END");
    }
}

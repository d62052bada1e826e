//! Decode nodes
//!
//! A node consumes a fixed number of bytes from the execution context and
//! names the node to visit next. [`Node`] is a closed enum over the two
//! node kinds; each kind is its own struct and the enum dispatches to it.

use super::context::ExecutionContext;
use super::error::FrameError;
use super::graph::Graph;
use crate::scripting::{Environment, ExprEngine, ExprError, Program};
use chrono::{DateTime, Utc};

/// Reserved target: the next node in the array
pub const TARGET_DEFAULT: &str = "DEFAULT";

/// Reserved target: stop the walk
pub const TARGET_END: &str = "END";

/// Where a routing rule sends the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Linear successor, or termination after the last node
    Default,
    /// Terminate the walk
    End,
    /// A labelled node, looked up when the rule fires
    Label(String),
}

impl Target {
    pub fn parse(target: &str) -> Self {
        match target.trim() {
            TARGET_DEFAULT => Target::Default,
            TARGET_END => Target::End,
            label => Target::Label(label.to_string()),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Default => f.write_str(TARGET_DEFAULT),
            Target::End => f.write_str(TARGET_END),
            Target::Label(label) => f.write_str(label),
        }
    }
}

/// A compiled `(condition, target)` pair
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub condition: Program,
    pub target: Target,
}

/// Consumes `size` bytes, runs its expressions over them, then routes
#[derive(Debug, Clone)]
pub struct SectionNode {
    pub(crate) index: usize,
    pub(crate) desc: String,
    pub(crate) size: usize,
    /// Vars, tags and fields of this section as one program
    pub(crate) program: Option<Program>,
    /// Whether the section has field expressions and so emits a point
    pub(crate) emits_point: bool,
    pub(crate) rules: Vec<RouteRule>,
    pub(crate) label: Option<String>,
}

impl SectionNode {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    fn expr_error(&self, err: ExprError) -> FrameError {
        match err {
            ExprError::Unsupported { map, key, found } => FrameError::UnsupportedValue {
                index: self.index,
                desc: self.desc.clone(),
                map: map.to_string(),
                key,
                found,
            },
            other => FrameError::Runtime {
                index: self.index,
                desc: self.desc.clone(),
                message: other.to_string(),
            },
        }
    }

    pub fn process(
        &self,
        graph: &Graph,
        engine: &ExprEngine,
        env: &mut Environment,
        ctx: &mut dyn ExecutionContext,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<usize>, FrameError> {
        let cursor = ctx.position();
        let bytes = ctx
            .take(self.size)
            .map_err(|e| e.at_node(self.index, &self.desc, cursor, self.size))?;
        env.load_bytes(bytes);

        if let Some(program) = &self.program {
            engine
                .execute(program, env)
                .map_err(|e| self.expr_error(e))?;
        }

        if self.emits_point {
            env.emit_point(timestamp).map_err(|e| self.expr_error(e))?;
        }

        self.route(graph, engine, env)
    }

    /// Pick the next node; runs after this section's expressions
    pub fn route(
        &self,
        graph: &Graph,
        engine: &ExprEngine,
        env: &mut Environment,
    ) -> Result<Option<usize>, FrameError> {
        if self.rules.is_empty() {
            return Ok(graph.successor(self.index));
        }

        for rule in &self.rules {
            let matched = engine
                .test(&rule.condition, env)
                .map_err(|e| match e {
                    ExprError::NonBoolean(found) => FrameError::NonBoolean {
                        index: self.index,
                        desc: self.desc.clone(),
                        condition: rule.condition.source().to_string(),
                        found,
                    },
                    other => self.expr_error(other),
                })?;

            if matched {
                return graph.resolve(&rule.target, self.index);
            }
        }

        Err(FrameError::NoRouteMatched {
            index: self.index,
            desc: self.desc.clone(),
            vars: env.vars_snapshot(),
            conditions: self
                .rules
                .iter()
                .map(|r| r.condition.source().to_string())
                .collect(),
        })
    }
}

/// Consumes `count` bytes without decoding them
#[derive(Debug, Clone)]
pub struct SkipNode {
    pub(crate) index: usize,
    pub(crate) count: usize,
    pub(crate) desc: String,
}

impl SkipNode {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn process(
        &self,
        graph: &Graph,
        ctx: &mut dyn ExecutionContext,
    ) -> Result<Option<usize>, FrameError> {
        let cursor = ctx.position();
        ctx.skip(self.count)
            .map_err(|e| e.at_node(self.index, &self.desc, cursor, self.count))?;
        Ok(graph.successor(self.index))
    }
}

/// Enum dispatch over the node kinds
#[derive(Debug, Clone)]
pub enum Node {
    Section(SectionNode),
    Skip(SkipNode),
}

impl Node {
    pub fn index(&self) -> usize {
        match self {
            Node::Section(n) => n.index,
            Node::Skip(n) => n.index,
        }
    }

    pub fn desc(&self) -> &str {
        match self {
            Node::Section(n) => &n.desc,
            Node::Skip(n) => &n.desc,
        }
    }

    /// Bytes consumed per visit
    pub fn width(&self) -> usize {
        match self {
            Node::Section(n) => n.size,
            Node::Skip(n) => n.count,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Node::Section(n) => n.label(),
            Node::Skip(_) => None,
        }
    }

    /// Consume this node's bytes and return the next node index, or `None`
    /// when the walk is finished
    pub fn process(
        &self,
        graph: &Graph,
        engine: &ExprEngine,
        env: &mut Environment,
        ctx: &mut dyn ExecutionContext,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<usize>, FrameError> {
        match self {
            Node::Section(n) => n.process(graph, engine, env, ctx, timestamp),
            Node::Skip(n) => n.process(graph, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::context::DiscreteContext;
    use crate::protocol::graph::GraphCompiler;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn build(entries: serde_json::Value) -> (ExprEngine, Graph) {
        let engine = ExprEngine::new();
        let entries = entries.as_array().cloned().unwrap();
        let graph = GraphCompiler::new(&engine).build(&entries).unwrap();
        (engine, graph)
    }

    fn step(
        graph: &Graph,
        engine: &ExprEngine,
        index: usize,
        data: &[u8],
    ) -> (Result<Option<usize>, FrameError>, usize) {
        let mut env = Environment::new(&BTreeMap::new());
        let mut ctx = DiscreteContext::new(data);
        let node = graph.node(index).unwrap();
        let next = node.process(graph, engine, &mut env, &mut ctx, Utc::now());
        (next, ctx.position())
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("DEFAULT"), Target::Default);
        assert_eq!(Target::parse("END"), Target::End);
        assert_eq!(Target::parse("loop"), Target::Label("loop".into()));
        assert_eq!(Target::Label("x".into()).to_string(), "x");
    }

    #[test]
    fn test_section_without_rules_goes_to_successor() {
        let (engine, graph) = build(json!([{ "size": 1 }, { "size": 1 }]));
        assert_eq!(step(&graph, &engine, 0, &[0, 0]).0, Ok(Some(1)));
        assert_eq!(step(&graph, &engine, 1, &[0, 0]).0, Ok(None));
    }

    #[test]
    fn test_skip_advances_cursor() {
        let (engine, graph) = build(json!([{ "skip": 3 }, { "size": 1 }]));
        let (next, pos) = step(&graph, &engine, 0, &[0; 4]);
        assert_eq!(next, Ok(Some(1)));
        assert_eq!(pos, 3);
    }

    #[test]
    fn test_skip_insufficient_data() {
        let (engine, graph) = build(json!([{ "skip": 3 }]));
        let (next, pos) = step(&graph, &engine, 0, &[0; 2]);
        assert!(matches!(next, Err(FrameError::InsufficientData { needed: 3, available: 2, .. })));
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let (engine, graph) = build(json!([
            {
                "size": 1,
                "next": [
                    { "condition": "Bytes[0] > 0", "target": "b" },
                    { "condition": "true", "target": "END" }
                ]
            },
            { "size": 1, "label": "a" },
            { "size": 1, "label": "b" }
        ]));
        assert_eq!(step(&graph, &engine, 0, &[1]).0, Ok(Some(2)));
        assert_eq!(step(&graph, &engine, 0, &[0]).0, Ok(None));
    }

    #[test]
    fn test_no_route_matched_dumps_state() {
        let (engine, graph) = build(json!([{
            "size": 1,
            "vars": { "flag": "Bytes[0]" },
            "next": [{ "condition": "Vars.flag == 2", "target": "END" }]
        }]));
        let (next, _) = step(&graph, &engine, 0, &[5]);
        match next {
            Err(FrameError::NoRouteMatched { vars, conditions, .. }) => {
                assert_eq!(vars, "flag=5");
                assert_eq!(conditions, vec!["Vars.flag == 2".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_label_at_routing_time() {
        let (engine, graph) = build(json!([{
            "size": 1,
            "next": [{ "condition": "true", "target": "nowhere" }]
        }]));
        let (next, _) = step(&graph, &engine, 0, &[0]);
        assert_eq!(
            next,
            Err(FrameError::LabelNotFound {
                label: "nowhere".into(),
                index: 0
            })
        );
    }

    #[test]
    fn test_non_boolean_condition() {
        let (engine, graph) = build(json!([{
            "size": 1,
            "next": [{ "condition": "Bytes[0]", "target": "END" }]
        }]));
        let (next, _) = step(&graph, &engine, 0, &[1]);
        assert!(matches!(next, Err(FrameError::NonBoolean { .. })));
    }

    #[test]
    fn test_runtime_error_names_node() {
        let (engine, graph) = build(json!([{
            "desc": "reading",
            "size": 1,
            "fields": { "v": "u16_be(Bytes, 0)" }
        }]));
        let (next, _) = step(&graph, &engine, 0, &[1]);
        match next {
            Err(FrameError::Runtime { index, desc, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(desc, "reading");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

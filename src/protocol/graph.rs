//! Protocol graph compilation
//!
//! [`GraphCompiler`] turns the ordered node entries of a configuration into
//! a [`Graph`]: a flat node array addressed by index plus a label table.
//! Every expression is compiled here, so a graph that builds never fails on
//! syntax at decode time. Labels named by routing rules are resolved per
//! frame, which lets a missing label surface as a frame error.

use super::error::{BuildError, FrameError};
use super::node::{Node, RouteRule, SectionNode, SkipNode, Target};
use crate::config::protocol::{coerce_skip, NodeConfig, SectionConfig, SkipConfig};
use crate::scripting::{section_source, ExprEngine, ScopeShape};
use std::collections::HashMap;

/// Immutable node array plus label table, shared by every decode walk
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    labels: HashMap<String, usize>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// The node after `index`, or `None` past the end
    pub fn successor(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.nodes.len()).then_some(next)
    }

    /// Resolve a rule target fired at node `from`
    pub fn resolve(&self, target: &Target, from: usize) -> Result<Option<usize>, FrameError> {
        match target {
            Target::Default => Ok(self.successor(from)),
            Target::End => Ok(None),
            Target::Label(label) => {
                self.label(label)
                    .map(Some)
                    .ok_or_else(|| FrameError::LabelNotFound {
                        label: label.clone(),
                        index: from,
                    })
            }
        }
    }
}

/// Builds a [`Graph`] from raw protocol entries.
///
/// Entries are validated and compiled in order; the first failure aborts the
/// build. Label targets are not checked here, they resolve at routing time.
pub struct GraphCompiler<'e> {
    engine: &'e ExprEngine,
}

impl<'e> GraphCompiler<'e> {
    pub fn new(engine: &'e ExprEngine) -> Self {
        Self { engine }
    }

    pub fn build(&self, entries: &[serde_json::Value]) -> Result<Graph, BuildError> {
        let configs = entries
            .iter()
            .enumerate()
            .map(|(index, raw)| NodeConfig::from_value(index, raw))
            .collect::<Result<Vec<_>, _>>()?;

        self.build_from_configs(&configs)
    }

    pub fn build_from_configs(&self, configs: &[NodeConfig]) -> Result<Graph, BuildError> {
        if configs.is_empty() {
            return Err(BuildError::Empty);
        }

        let mut graph = Graph {
            nodes: Vec::with_capacity(configs.len()),
            labels: HashMap::new(),
        };

        for (index, config) in configs.iter().enumerate() {
            let node = match config {
                NodeConfig::Section(section) => Node::Section(self.section(index, section)?),
                NodeConfig::Skip(skip) => Node::Skip(Self::skip(index, skip)?),
            };

            if let Some(label) = node.label() {
                if let Some(&first) = graph.labels.get(label) {
                    return Err(BuildError::DuplicateLabel {
                        label: label.to_string(),
                        index,
                        first,
                    });
                }
                graph.labels.insert(label.to_string(), index);
            }

            graph.nodes.push(node);
        }

        tracing::debug!(
            nodes = graph.nodes.len(),
            labels = graph.labels.len(),
            "Protocol graph built"
        );
        Ok(graph)
    }

    fn section(&self, index: usize, config: &SectionConfig) -> Result<SectionNode, BuildError> {
        let size = usize::try_from(config.size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| BuildError::NonPositiveSize {
                index,
                desc: config.desc.clone(),
                size: config.size,
            })?;

        let compile_error = |what: String, message: String| BuildError::Compile {
            index,
            desc: config.desc.clone(),
            what,
            message,
        };

        let program = section_source(&config.vars, &config.tags, &config.fields)
            .map(|source| {
                self.engine
                    .compile(&format!("node {} expressions", index), &source, ScopeShape::Decode)
                    .map_err(|e| compile_error("expressions".to_string(), e.to_string()))
            })
            .transpose()?;

        let rules = config
            .next
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let condition = self
                    .engine
                    .compile(&format!("node {} rule {}", index, i), &rule.condition, ScopeShape::Decode)
                    .map_err(|e| compile_error(format!("rule {} condition", i), e.to_string()))?;
                Ok(RouteRule {
                    condition,
                    target: Target::parse(&rule.target),
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        Ok(SectionNode {
            index,
            desc: config.desc.clone(),
            size,
            program,
            emits_point: !config.fields.is_empty(),
            rules,
            label: config.label.clone(),
        })
    }

    fn skip(index: usize, config: &SkipConfig) -> Result<SkipNode, BuildError> {
        let count = coerce_skip(&config.skip).ok_or_else(|| BuildError::InvalidSkip {
            index,
            value: config.skip.to_string(),
        })?;

        Ok(SkipNode {
            index,
            count,
            desc: config.desc.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(entries: serde_json::Value) -> Result<Graph, BuildError> {
        let engine = ExprEngine::new();
        let entries = entries.as_array().cloned().unwrap_or_default();
        GraphCompiler::new(&engine).build(&entries)
    }

    #[test]
    fn test_indices_are_positions() {
        let graph = build(json!([{ "size": 2 }, { "skip": "1" }, { "size": 1 }])).unwrap();
        assert_eq!(graph.len(), 3);
        for (i, node) in graph.nodes().iter().enumerate() {
            assert_eq!(node.index(), i);
        }
        assert_eq!(graph.node(1).unwrap().width(), 1);
    }

    #[test]
    fn test_label_table() {
        let graph = build(json!([{ "size": 1 }, { "size": 1, "Label": "body" }])).unwrap();
        assert_eq!(graph.label("body"), Some(1));
        assert_eq!(graph.label("nope"), None);
    }

    #[test]
    fn test_duplicate_label() {
        let err = build(json!([
            { "size": 1, "label": "dup" },
            { "size": 1, "label": "dup" }
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            BuildError::DuplicateLabel {
                label: "dup".into(),
                index: 1,
                first: 0
            }
        );
    }

    #[test]
    fn test_non_positive_size() {
        let err = build(json!([{ "desc": "hdr", "size": 0 }])).unwrap_err();
        assert!(matches!(err, BuildError::NonPositiveSize { index: 0, size: 0, .. }));
        assert!(build(json!([{ "size": -4 }])).is_err());
    }

    #[test]
    fn test_invalid_skip() {
        let err = build(json!([{ "size": 1 }, { "skip": 0 }])).unwrap_err();
        assert_eq!(
            err,
            BuildError::InvalidSkip {
                index: 1,
                value: "0".into()
            }
        );
    }

    #[test]
    fn test_compile_error_aborts_build() {
        let err = build(json!([
            { "size": 1 },
            { "desc": "body", "size": 1, "fields": { "x": "Bytes[0] +" } }
        ]))
        .unwrap_err();
        match err {
            BuildError::Compile { index, desc, what, .. } => {
                assert_eq!(index, 1);
                assert_eq!(desc, "body");
                assert_eq!(what, "expressions");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rule_compile_error() {
        let err = build(json!([{
            "size": 1,
            "next": [{ "condition": "Var.flag == 1", "target": "END" }]
        }]))
        .unwrap_err();
        assert!(matches!(err, BuildError::Compile { .. }));
        assert!(err.to_string().contains("rule 0 condition"));
    }

    #[test]
    fn test_unresolved_label_accepted_at_build() {
        assert!(build(json!([{
            "size": 1,
            "next": [{ "condition": "true", "target": "missing" }]
        }]))
        .is_ok());
    }

    #[test]
    fn test_empty_protocol() {
        assert_eq!(build(json!([])).unwrap_err(), BuildError::Empty);
    }

    #[test]
    fn test_resolve() {
        let graph = build(json!([{ "size": 1, "label": "top" }, { "size": 1 }])).unwrap();
        assert_eq!(graph.resolve(&Target::Default, 0), Ok(Some(1)));
        assert_eq!(graph.resolve(&Target::Default, 1), Ok(None));
        assert_eq!(graph.resolve(&Target::End, 0), Ok(None));
        assert_eq!(graph.resolve(&Target::Label("top".into()), 1), Ok(Some(0)));
        assert!(graph.resolve(&Target::Label("x".into()), 1).is_err());
    }
}

use super::{DispatchError, Dispatcher};
use crate::config::TreeConfig;
use crate::types::{FieldMap, FrameBatch, Point, SinkBatch, Value};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Last field values of one tag group
#[derive(Debug, Default)]
struct Group {
    last: FieldMap,
    /// Dispatch tick of the group's latest point
    seen: u64,
}

struct TreeSink {
    name: String,
    patterns: Vec<(String, Regex)>,
}

impl TreeSink {
    fn accepts(&self, point: &Point) -> bool {
        self.patterns.iter().all(|(tag, re)| {
            point
                .tag(tag)
                .map(|v| re.is_match(&v.to_string()))
                .unwrap_or(false)
        })
    }
}

/// Change-detecting dispatcher.
///
/// Points are grouped by the values of the configured level tags, outermost
/// level first. A point is forwarded with only the fields whose value
/// changed since the last point in its group; a point with no changed field
/// is dropped. Sinks select points by regex over tag values, and points no
/// sink accepts leave no state behind.
///
/// At most `max_groups` groups are remembered. A new group beyond that
/// evicts the least recently seen one, whose next point then counts as
/// entirely changed.
pub struct AggregationTree {
    levels: Vec<String>,
    groups: HashMap<Vec<String>, Group>,
    max_groups: usize,
    tick: u64,
    sinks: Vec<TreeSink>,
    /// Scratch list of sink indices accepting the current point
    matched: Vec<usize>,
}

impl AggregationTree {
    pub fn new(config: &TreeConfig) -> Result<Self, DispatchError> {
        let mut seen = HashSet::new();
        let mut sinks = Vec::with_capacity(config.sinks.len());

        for sink in &config.sinks {
            if !seen.insert(sink.name.clone()) {
                return Err(DispatchError::DuplicateSink(sink.name.clone()));
            }

            let patterns = sink
                .patterns
                .iter()
                .map(|(tag, pattern)| {
                    Regex::new(pattern)
                        .map(|re| (tag.clone(), re))
                        .map_err(|e| DispatchError::Pattern {
                            sink: sink.name.clone(),
                            message: e.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            sinks.push(TreeSink {
                name: sink.name.clone(),
                patterns,
            });
        }

        Ok(Self {
            levels: config.levels.clone(),
            groups: HashMap::new(),
            max_groups: config.max_groups.max(1),
            tick: 0,
            sinks,
            matched: Vec::new(),
        })
    }

    /// Fields of `point` that differ from the last point in its group
    fn changed_fields(&mut self, point: &Point) -> FieldMap {
        let key: Vec<String> = self
            .levels
            .iter()
            .map(|level| point.tag(level).map(Value::to_string).unwrap_or_default())
            .collect();

        if !self.groups.contains_key(&key) && self.groups.len() >= self.max_groups {
            self.evict_oldest();
        }

        self.tick += 1;
        let group = self.groups.entry(key).or_default();
        group.seen = self.tick;

        let mut changed = FieldMap::new();
        for (name, value) in &point.fields {
            if group.last.get(name) != Some(value) {
                group.last.insert(name.clone(), value.clone());
                changed.insert(name.clone(), value.clone());
            }
        }
        changed
    }

    /// Forget the least recently seen group. Linear, but only runs when full.
    fn evict_oldest(&mut self) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.seen)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.groups.remove(&key);
            tracing::debug!(group = ?key, max_groups = self.max_groups, "Aggregation group evicted");
        }
    }
}

impl Dispatcher for AggregationTree {
    fn dispatch(&mut self, frame: &FrameBatch) -> Result<BTreeMap<String, SinkBatch>, DispatchError> {
        let mut out: BTreeMap<String, SinkBatch> = BTreeMap::new();

        let mut matched = std::mem::take(&mut self.matched);

        for point in &frame.points {
            matched.clear();
            matched.extend(
                self.sinks
                    .iter()
                    .enumerate()
                    .filter(|(_, sink)| sink.accepts(point))
                    .map(|(i, _)| i),
            );
            if matched.is_empty() {
                continue;
            }

            let changed = self.changed_fields(point);
            if changed.is_empty() {
                continue;
            }

            let delta = Arc::new(Point {
                tags: point.tags.clone(),
                fields: changed,
                timestamp: point.timestamp,
            });
            for &i in &matched {
                let name = &self.sinks[i].name;
                out.entry(name.clone())
                    .or_insert_with(|| SinkBatch::new(name.clone(), frame))
                    .points
                    .push(Arc::clone(&delta));
            }
        }

        self.matched = matched;
        Ok(out)
    }

    fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name.clone()).collect()
    }
}

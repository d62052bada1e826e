use super::{DispatchError, Dispatcher};
use crate::config::StrategyConfig;
use crate::scripting::{filter_source, ExprEngine, ExprError, FilterEnvironment, Program, ScopeShape};
use crate::types::{FrameBatch, Point, SinkBatch};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

struct SinkFilter {
    name: String,
    program: Program,
}

/// Routes points to every sink whose filter matches the point's tags
pub struct FilterHandler {
    engine: Arc<ExprEngine>,
    sinks: Vec<SinkFilter>,
    env: FilterEnvironment,
}

impl FilterHandler {
    /// Compile one filter per strategy.
    ///
    /// Callers pass the enabled strategies only. Any compile error fails the
    /// whole handler.
    pub fn new<'a>(
        engine: Arc<ExprEngine>,
        strategies: impl IntoIterator<Item = &'a StrategyConfig>,
    ) -> Result<Self, DispatchError> {
        let mut seen = HashSet::new();
        let mut sinks = Vec::new();

        for strategy in strategies {
            if !seen.insert(strategy.name.clone()) {
                return Err(DispatchError::DuplicateSink(strategy.name.clone()));
            }

            let source = filter_source(&strategy.filters);
            let program = engine
                .compile(&format!("sink {}", strategy.name), &source, ScopeShape::Filter)
                .map_err(|e| DispatchError::Compile {
                    sink: strategy.name.clone(),
                    message: e.to_string(),
                })?;

            tracing::debug!(sink = %strategy.name, filter = %source, "Compiled sink filter");
            sinks.push(SinkFilter {
                name: strategy.name.clone(),
                program,
            });
        }

        Ok(Self {
            engine,
            sinks,
            env: FilterEnvironment::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Dispatcher for FilterHandler {
    fn dispatch(&mut self, frame: &FrameBatch) -> Result<BTreeMap<String, SinkBatch>, DispatchError> {
        let mut batches: Vec<Option<SinkBatch>> = self.sinks.iter().map(|_| None).collect();

        for point in &frame.points {
            self.env.load_tags(&point.tags);
            let mut shared: Option<Arc<Point>> = None;

            for (slot, sink) in batches.iter_mut().zip(&self.sinks) {
                let matched = self
                    .engine
                    .matches(&sink.program, &mut self.env)
                    .map_err(|e| match e {
                        ExprError::NonBoolean(found) => DispatchError::NonBoolean {
                            sink: sink.name.clone(),
                            found,
                        },
                        other => DispatchError::Filter {
                            sink: sink.name.clone(),
                            frame_id: frame.frame_id.clone(),
                            message: other.to_string(),
                        },
                    })?;

                if matched {
                    let clone = shared.get_or_insert_with(|| Arc::new(point.clone()));
                    slot.get_or_insert_with(|| SinkBatch::new(sink.name.clone(), frame))
                        .points
                        .push(Arc::clone(clone));
                }
            }
        }

        Ok(batches
            .into_iter()
            .flatten()
            .map(|batch| (batch.sink.clone(), batch))
            .collect())
    }

    fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name.clone()).collect()
    }
}

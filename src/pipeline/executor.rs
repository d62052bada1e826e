//! Pipeline assembly and lifecycle.
//!
//! [`PipelineBuilder`] compiles the protocol graph and sink filters from a
//! [`GatewayConfig`], then spawns one decode thread per source and a single
//! dispatch thread. The caller gets a [`Pipeline`] to stop or join the
//! threads and [`PipelineHandles`] to feed sources and drain sinks.

use super::bridge::{SinkReceiver, SourceHandle};
use super::stats::{PipelineStats, StatsSnapshot};
use super::worker::{DecodeWorker, DispatchWorker};
use crate::config::{GatewayConfig, SourceMode};
use crate::dispatch::{AggregationTree, Dispatcher, FilterHandler};
use crate::error::{GatewayError, Result, ResultExt};
use crate::pool::{Pool, PoolSnapshot};
use crate::protocol::{ring_buffer, Decoder, GraphCompiler};
use crate::scripting::{Environment, ExprEngine};
use crate::types::Point;
use crossbeam_channel::bounded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Connector and consumer ends of a running pipeline
#[derive(Debug, Default)]
pub struct PipelineHandles {
    /// One handle per configured source, keyed by source name
    pub sources: HashMap<String, SourceHandle>,
    /// One receiver per sink, keyed by sink name
    pub sinks: HashMap<String, SinkReceiver>,
}

impl PipelineHandles {
    /// Split into sources and sinks so the sources can be dropped on their own
    pub fn split(self) -> (HashMap<String, SourceHandle>, HashMap<String, SinkReceiver>) {
        (self.sources, self.sinks)
    }
}

/// Running pipeline threads
pub struct Pipeline {
    threads: Vec<(String, JoinHandle<()>)>,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    engine: Arc<ExprEngine>,
    points: Arc<Pool<Point>>,
    buffers: Arc<Pool<Vec<u8>>>,
}

impl Pipeline {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Point and frame-buffer pool metrics
    pub fn pool_stats(&self) -> (PoolSnapshot, PoolSnapshot) {
        (self.points.snapshot(), self.buffers.snapshot())
    }

    /// Number of distinct compiled expression programs
    pub fn compiled_programs(&self) -> usize {
        self.engine.cache_len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop all workers now.
    ///
    /// In-flight frames are abandoned and queued frames are discarded.
    pub fn shutdown(mut self) -> StatsSnapshot {
        tracing::info!("Shutting down pipeline");
        self.running.store(false, Ordering::Relaxed);
        self.join_threads();
        self.log_resources();
        self.stats.snapshot()
    }

    /// Wait for the workers to finish on their own.
    ///
    /// Workers finish once every source handle is dropped (or every stream
    /// source closed) and the queues have drained.
    pub fn join(mut self) -> StatsSnapshot {
        self.join_threads();
        self.log_resources();
        self.stats.snapshot()
    }

    fn log_resources(&self) {
        let (points, buffers) = self.pool_stats();
        tracing::info!(
            programs = self.compiled_programs(),
            point_hit_rate = format!("{:.2}", points.hit_rate()),
            buffer_hit_rate = format!("{:.2}", buffers.hit_rate()),
            "Pipeline stopped"
        );
    }

    fn join_threads(&mut self) {
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!(thread = %name, "Pipeline thread panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}

/// Builder for creating a configured pipeline
pub struct PipelineBuilder {
    config: GatewayConfig,
}

impl PipelineBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Build the sink dispatcher: the aggregation tree when configured,
    /// otherwise the filter handler over the enabled strategies
    fn dispatcher(&self, engine: &Arc<ExprEngine>) -> Result<Box<dyn Dispatcher>> {
        Ok(match &self.config.tree {
            Some(tree) => Box::new(AggregationTree::new(tree)?),
            None => Box::new(FilterHandler::new(Arc::clone(engine), self.config.enabled_strategies())?),
        })
    }

    /// Compile everything and start the worker threads.
    ///
    /// Any protocol or filter error fails the build before a thread starts.
    pub fn build(self) -> Result<(Pipeline, PipelineHandles)> {
        let config = &self.config;
        config.validate()?;

        let engine = Arc::new(ExprEngine::new());
        let graph = GraphCompiler::new(&engine).build(&config.protocol)?;
        tracing::info!(
            nodes = graph.len(),
            programs = engine.cache_len(),
            "Protocol graph compiled"
        );
        let decoder = Decoder::new(Arc::new(graph), Arc::clone(&engine))
            .with_max_iterations(config.engine.max_iterations);
        let dispatcher = self.dispatcher(&engine)?;

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PipelineStats::new());
        let points = Arc::new(Pool::new(config.engine.pool_capacity));
        let buffers = Arc::new(Pool::new(config.engine.pool_capacity));
        let mut handles = PipelineHandles::default();
        let mut threads = Vec::new();

        let mut sink_senders = HashMap::new();
        for name in dispatcher.sink_names() {
            let (receiver, tx) = SinkReceiver::new(name.clone());
            handles.sinks.insert(name.clone(), receiver);
            sink_senders.insert(name, tx);
        }

        let (frame_tx, frame_rx) = bounded(config.queue.capacity);

        let dispatch = DispatchWorker::new(
            dispatcher,
            sink_senders,
            Arc::clone(&points),
            config.queue.policy,
            Arc::clone(&stats),
            Arc::clone(&running),
        );
        threads.push(spawn("dispatch", move || dispatch.run(frame_rx))?);

        for source in config.effective_sources() {
            let env = Environment::new(&config.globals).with_pool(Arc::clone(&points));
            let worker = DecodeWorker::new(
                source.name.clone(),
                decoder.clone(),
                env,
                Arc::clone(&points),
                frame_tx.clone(),
                config.queue.policy,
                Arc::clone(&stats),
                Arc::clone(&running),
            );
            let thread_name = format!("decode-{}", source.name);

            let handle = match source.mode {
                SourceMode::Frames => {
                    let (handle, rx) = SourceHandle::frames(config.queue.capacity, Arc::clone(&buffers));
                    threads.push(spawn(&thread_name, move || worker.run_frames(rx))?);
                    handle
                }
                SourceMode::Stream => {
                    let (writer, reader) = ring_buffer(
                        config.stream.ring_capacity,
                        config.stream.read_timeout(),
                        config.stream.poll_interval(),
                    );
                    threads.push(spawn(&thread_name, move || worker.run_stream(reader))?);
                    SourceHandle::Stream(writer)
                }
            };

            tracing::info!(source = %source.name, mode = ?source.mode, "Source started");
            handles.sources.insert(source.name, handle);
        }

        let pipeline = Pipeline {
            threads,
            running,
            stats,
            engine,
            points,
            buffers,
        };
        Ok((pipeline, handles))
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<(String, JoinHandle<()>)> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|handle| (name.to_string(), handle))
        .map_err(GatewayError::from)
        .with_context(|| format!("Failed to spawn thread '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueuePolicy, SourceConfig, StrategyConfig};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> GatewayConfig {
        GatewayConfig {
            protocol: json!([{ "size": 2, "tags": { "id": "Bytes[0]" }, "fields": { "v": "Bytes[1]" } }])
                .as_array()
                .cloned()
                .unwrap(),
            strategies: vec![
                StrategyConfig::new("all"),
                StrategyConfig::new("odd").with_filter("Tag.id % 2 == 1"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_rejects_bad_protocol() {
        let mut cfg = config();
        cfg.protocol = vec![json!({ "size": 0 })];
        assert!(matches!(PipelineBuilder::new(cfg).build(), Err(GatewayError::Build(_))));
    }

    #[test]
    fn test_build_rejects_bad_filter() {
        let mut cfg = config();
        cfg.strategies.push(StrategyConfig::new("bad").with_filter("Tag.id =="));
        assert!(matches!(PipelineBuilder::new(cfg).build(), Err(GatewayError::Dispatch(_))));
    }

    #[test]
    fn test_frames_flow_to_sinks_and_join() {
        let (pipeline, handles) = PipelineBuilder::new(config()).build().unwrap();
        let (sources, sinks) = handles.split();

        sources["default"].send_frame(&[1, 10]).unwrap();
        sources["default"].send_frame(&[2, 20]).unwrap();
        drop(sources);

        let stats = pipeline.join();
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(sinks["all"].drain().len(), 2);

        let odd = sinks["odd"].drain();
        assert_eq!(odd.len(), 1);
        assert_eq!(odd[0].points[0].field("v"), Some(&10_i64.into()));
        assert_eq!(sinks["odd"].iter().count(), 0);
    }

    #[test]
    fn test_stream_source() {
        let mut cfg = config();
        cfg.sources = vec![SourceConfig::new("serial", SourceMode::Stream)];
        let (pipeline, handles) = PipelineBuilder::new(cfg).build().unwrap();
        let (sources, sinks) = handles.split();

        sources["serial"].send_frame(&[1, 10, 3]).unwrap();
        sources["serial"].send_frame(&[30]).unwrap();
        drop(sources);

        let stats = pipeline.join();
        assert_eq!(stats.frames_decoded, 2);
        let batches = sinks["odd"].drain();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].points[0].tag("id"), Some(&3_i64.into()));
    }

    #[test]
    fn test_pool_stats_and_programs() {
        let (pipeline, handles) = PipelineBuilder::new(config()).build().unwrap();
        assert!(pipeline.compiled_programs() >= 2);

        handles.sources["default"].send_frame(&[1, 10]).unwrap();
        assert!(handles.sinks["all"].recv_timeout(Duration::from_secs(5)).is_some());

        let (_, buffers) = pipeline.pool_stats();
        assert_eq!(buffers.returns, 1);
        pipeline.shutdown();
    }

    #[test]
    fn test_shutdown_stops_idle_workers() {
        let mut cfg = config();
        cfg.queue.policy = QueuePolicy::Drop;
        let (pipeline, handles) = PipelineBuilder::new(cfg).build().unwrap();
        assert!(pipeline.is_running());

        // Sources stay alive; shutdown must not wait for them
        let stats = pipeline.shutdown();
        assert_eq!(stats.frames_received, 0);
        assert!(handles.sources["default"].send_frame(&[1, 1]).is_err());
        assert!(handles.sinks["all"].recv_timeout(Duration::from_millis(10)).is_none());
    }
}

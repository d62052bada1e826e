//! Configuration module for framegate
//!
//! This module holds the gateway configuration file model:
//! - Decode engine limits and pool sizes
//! - Queue capacity and hand-off policy between decode and dispatch
//! - Streaming read timeouts and ring buffer sizing
//! - Global constants, sources, the protocol description and sink strategies
//! - Logging level and optional log file
//!
//! # File Formats
//!
//! Configuration is read from TOML (`.toml`) or JSON (anything else),
//! selected by file extension. `save` writes back in the same format.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! max_iterations = 64
//!
//! [globals]
//! scale = 0.1
//!
//! [[protocol]]
//! desc = "header"
//! size = 2
//! vars = { kind = "Bytes[0]" }
//! tags = { device = "Bytes[1]" }
//!
//! [[protocol]]
//! skip = 1
//!
//! [[strategies]]
//! name = "influx"
//! filters = ["Tag.device == 3"]
//! ```

pub mod protocol;

pub use protocol::{NextRuleConfig, NodeConfig, SectionConfig, SkipConfig};

use crate::error::{GatewayError, Result, ResultExt};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default maximum node visits per frame
pub const DEFAULT_MAX_ITERATIONS: usize = 64;

/// Default number of idle points/buffers kept per pool
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Default capacity of each bounded queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default ring buffer size for streaming sources (64 KiB)
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// Default streaming full-read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 500;

/// Default wait between empty streaming reads in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default number of tag groups the aggregation tree remembers
pub const DEFAULT_TREE_MAX_GROUPS: usize = 4096;

/// Name of the implicit source when none are configured
pub const DEFAULT_SOURCE_NAME: &str = "default";

// ==================== Engine ====================

/// Decode engine limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node visits per frame before loop protection aborts it
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Idle values kept per object pool
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

// ==================== Queue ====================

/// What a decode worker does when the dispatch queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Wait for room, re-checking the shutdown flag
    #[default]
    Block,
    /// Drop the frame with a warning
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub policy: QueuePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            policy: QueuePolicy::Block,
        }
    }
}

// ==================== Stream ====================

/// Streaming source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Ring buffer capacity in bytes
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Upper bound on a single full read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Wait between retries while the ring buffer is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl StreamConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

// ==================== Sources ====================

/// How a source delivers bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// One complete frame per message
    #[default]
    Frames,
    /// A continuous byte stream read through a ring buffer
    Stream,
}

/// An input connection feeding one decode worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default)]
    pub mode: SourceMode,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, mode: SourceMode) -> Self {
        Self {
            name: name.into(),
            mode,
        }
    }
}

// ==================== Strategies ====================

/// A sink selected by a conjunction of filter expressions over point tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,

    /// Filter fragments, joined with `&&`; empty matches every point
    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StrategyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }
}

// ==================== Aggregation Tree ====================

/// Sink of the aggregation tree, selected by per-tag regex patterns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSinkConfig {
    pub name: String,

    /// Tag name -> regex the tag value must match
    #[serde(default)]
    pub patterns: BTreeMap<String, String>,
}

/// Hierarchical change-detecting dispatch, used instead of strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Tag names forming the tree levels, outermost first
    #[serde(default)]
    pub levels: Vec<String>,

    #[serde(default)]
    pub sinks: Vec<TreeSinkConfig>,

    /// Groups remembered before the least recently seen one is forgotten
    #[serde(default = "default_tree_max_groups")]
    pub max_groups: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            levels: Vec::new(),
            sinks: Vec::new(),
            max_groups: DEFAULT_TREE_MAX_GROUPS,
        }
    }
}

// ==================== Logging ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file (daily rotation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<std::path::PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

// ==================== Gateway Config ====================

/// Complete gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Read-only constants exposed to expressions as `Global`
    #[serde(default)]
    pub globals: BTreeMap<String, Value>,

    /// Input sources; a single frame source named `default` when empty
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Ordered node entries, kept raw until the graph compiler validates them
    #[serde(default)]
    pub protocol: Vec<serde_json::Value>,

    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<TreeConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

impl GatewayConfig {
    /// Load a configuration file, TOML or JSON by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config = if is_toml(path) {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
        .with_context(|| format!("Failed to parse config file {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Save the configuration, TOML or JSON by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| GatewayError::Serialization(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| GatewayError::Serialization(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            GatewayError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Structural checks that do not need the expression engine
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_iterations == 0 {
            return Err(GatewayError::Config(
                "engine.max_iterations must be greater than 0".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(GatewayError::Config(
                "queue.capacity must be greater than 0".to_string(),
            ));
        }
        if self.stream.ring_capacity == 0 {
            return Err(GatewayError::Config(
                "stream.ring_capacity must be greater than 0".to_string(),
            ));
        }

        if self.tree.as_ref().is_some_and(|tree| tree.max_groups == 0) {
            return Err(GatewayError::Config(
                "tree.max_groups must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate source name '{}'",
                    source.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            if !seen.insert(strategy.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate strategy name '{}'",
                    strategy.name
                )));
            }
        }

        Ok(())
    }

    /// Configured sources, or the implicit frame source
    pub fn effective_sources(&self) -> Vec<SourceConfig> {
        if self.sources.is_empty() {
            vec![SourceConfig::new(DEFAULT_SOURCE_NAME, SourceMode::Frames)]
        } else {
            self.sources.clone()
        }
    }

    /// Strategies that take part in dispatch
    pub fn enabled_strategies(&self) -> impl Iterator<Item = &StrategyConfig> {
        self.strategies.iter().filter(|s| s.enabled)
    }

    /// A small working configuration: a header section, a skip and a reading
    pub fn sample() -> Self {
        let protocol = serde_json::json!([
            {
                "desc": "header",
                "size": 2,
                "vars": { "kind": "Bytes[0]" },
                "tags": { "device": "Bytes[1]" },
                "next": [
                    { "condition": "Vars.kind == 1", "target": "DEFAULT" },
                    { "condition": "true", "target": "END" }
                ]
            },
            { "skip": 1 },
            {
                "desc": "temperature",
                "label": "temperature",
                "size": 2,
                "fields": { "celsius": "i16_be(Bytes, 0) * Global.scale" }
            }
        ]);

        let mut globals = BTreeMap::new();
        globals.insert("scale".to_string(), Value::Float(0.1));

        Self {
            globals,
            protocol: protocol.as_array().cloned().unwrap_or_default(),
            strategies: vec![StrategyConfig::new("console")],
            ..Default::default()
        }
    }
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_tree_max_groups() -> usize {
    DEFAULT_TREE_MAX_GROUPS
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
[engine]
max_iterations = 16

[queue]
capacity = 8
policy = "drop"

[globals]
scale = 0.5
site = "north"

[[sources]]
name = "uplink"
mode = "stream"

[[protocol]]
desc = "header"
size = 4
fields = { msg_type = "Bytes[0]" }

[[protocol]]
skip = 2

[[strategies]]
name = "influx"
filters = ["Tag.device == 1"]
"#;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.engine.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.queue.policy, QueuePolicy::Block);
        assert_eq!(config.stream.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "info");
        assert!(config.tree.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config = GatewayConfig::from_toml_str(SAMPLE_TOML).unwrap();
        assert_eq!(config.engine.max_iterations, 16);
        assert_eq!(config.engine.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert_eq!(config.queue.policy, QueuePolicy::Drop);
        assert_eq!(config.globals.get("scale"), Some(&Value::Float(0.5)));
        assert_eq!(config.globals.get("site"), Some(&Value::Str("north".into())));
        assert_eq!(config.sources[0].mode, SourceMode::Stream);
        assert_eq!(config.protocol.len(), 2);
        assert_eq!(config.protocol[1]["skip"], serde_json::json!(2));
        assert_eq!(config.strategies[0].filters.len(), 1);
        assert!(config.strategies[0].enabled);
    }

    #[test]
    fn test_effective_sources_default() {
        let config = GatewayConfig::default();
        let sources = config.effective_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, DEFAULT_SOURCE_NAME);
        assert_eq!(sources[0].mode, SourceMode::Frames);
    }

    #[test]
    fn test_validate_rejects_duplicate_strategy() {
        let mut config = GatewayConfig::default();
        config.strategies.push(StrategyConfig::new("a"));
        config.strategies.push(StrategyConfig::new("a"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate strategy name 'a'"));
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let mut config = GatewayConfig::default();
        config.engine.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tree_max_groups_default_and_zero() {
        let config = GatewayConfig::from_toml_str("[tree]\nlevels = [\"device\"]\n").unwrap();
        let tree = config.tree.as_ref().unwrap();
        assert_eq!(tree.max_groups, DEFAULT_TREE_MAX_GROUPS);
        assert!(config.validate().is_ok());

        let mut config = config;
        if let Some(tree) = config.tree.as_mut() {
            tree.max_groups = 0;
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tree.max_groups"));
    }

    #[test]
    fn test_enabled_strategies() {
        let mut config = GatewayConfig::default();
        config.strategies.push(StrategyConfig::new("on"));
        let mut off = StrategyConfig::new("off");
        off.enabled = false;
        config.strategies.push(off);
        let names: Vec<_> = config.enabled_strategies().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["on"]);
    }

    #[test]
    fn test_save_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let config = GatewayConfig::sample();
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.toml");
        let config = GatewayConfig::from_toml_str(SAMPLE_TOML).unwrap();
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded.protocol, config.protocol);
        assert_eq!(loaded.queue, config.queue);
    }

    #[test]
    fn test_load_missing_file() {
        let err = GatewayConfig::load("/nonexistent/gateway.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

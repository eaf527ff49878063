// src/config.rs - Pipeline configuration loaded from a single YAML file

use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main plantgraph configuration.
///
/// Relative paths are resolved against the directory holding the config file
/// when loaded through [`Config::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tag registry CSV (`tag,data_type,unit,asset[,min,max,description]`)
    pub registry: PathBuf,

    /// Alarm rule YAML list
    #[serde(default)]
    pub alarm_rules: Option<PathBuf>,

    /// Relation rule YAML list
    #[serde(default)]
    pub relation_rules: Option<PathBuf>,

    /// Graph schema YAML; the built-in plant schema is used when absent
    #[serde(default)]
    pub schema: Option<PathBuf>,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub alarms: AlarmSettings,

    /// MQTT live source / sink configuration
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

// ============================================================================
// PIPELINE SETTINGS
// ============================================================================

/// Normalization and chunking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Schema version attached to every reading
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Canonical timestamp resolution
    #[serde(default)]
    pub resolution: TimestampResolution,

    /// Unit of numeric epoch timestamps in the input
    #[serde(default)]
    pub epoch_unit: EpochUnit,

    /// UTC offset (seconds east) applied to naive timestamps
    #[serde(default)]
    pub source_utc_offset_secs: i32,

    /// Maximum readings per chunk
    #[serde(default = "default_max_chunk_readings")]
    pub max_chunk_readings: usize,

    /// Maximum approximate bytes per chunk
    #[serde(default)]
    pub max_chunk_bytes: Option<usize>,

    /// Maximum time span covered by one chunk, in milliseconds
    #[serde(default)]
    pub max_chunk_span_ms: Option<u64>,

    /// Number of alarm shards
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Source name for inputs without one of their own: live batches are named
    /// `{source_id}-{n}`, and files without a usable stem use it directly
    #[serde(default = "default_source_id")]
    pub source_id: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            resolution: TimestampResolution::default(),
            epoch_unit: EpochUnit::default(),
            source_utc_offset_secs: 0,
            max_chunk_readings: default_max_chunk_readings(),
            max_chunk_bytes: None,
            max_chunk_span_ms: None,
            shards: default_shards(),
            source_id: default_source_id(),
        }
    }
}

/// Resolution of canonical timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampResolution {
    Seconds,
    #[default]
    Milliseconds,
    Microseconds,
}

/// Unit of numeric epoch timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EpochUnit {
    #[default]
    Seconds,
    Milliseconds,
    Microseconds,
}

// ============================================================================
// DISPATCH CONFIGURATION
// ============================================================================

/// Sink forwarding and graph commit retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Timeout of a single sink publish, in milliseconds
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_ms: u64,

    /// Live micro-batch size
    #[serde(default = "default_live_batch_size")]
    pub live_batch_size: usize,

    /// Live micro-batch window, in milliseconds
    #[serde(default = "default_live_batch_window")]
    pub live_batch_window_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            forward_timeout_ms: default_forward_timeout(),
            live_batch_size: default_live_batch_size(),
            live_batch_window_ms: default_live_batch_window(),
        }
    }
}

// ============================================================================
// STORAGE CONFIGURATION
// ============================================================================

/// Locations of persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the per-shard alarm state logs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Dead-letter directory
    #[serde(default = "default_dead_letter_dir")]
    pub dead_letter_dir: PathBuf,

    /// Graph journal; the graph lives only in memory when absent
    #[serde(default)]
    pub graph_journal: Option<PathBuf>,

    #[serde(default)]
    pub sink: SinkConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            dead_letter_dir: default_dead_letter_dir(),
            graph_journal: None,
            sink: SinkConfig::default(),
        }
    }
}

/// Downstream reading sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Append normalized readings to a JSON-lines file
    Jsonl { path: PathBuf },
    /// Keep readings in memory (tests, dry runs)
    Memory,
    /// Publish readings over MQTT (feature `mqtt`)
    Mqtt,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Memory
    }
}

// ============================================================================
// ALARM SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSettings {
    /// Evaluate `uncertain` and `out-of-range` readings. `bad` readings are
    /// never evaluated.
    #[serde(default = "default_true")]
    pub evaluate_degraded: bool,

    /// Compact the state log after this many appends
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            evaluate_degraded: default_true(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

// ============================================================================
// MQTT CONFIGURATION
// ============================================================================

/// MQTT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client ID
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Keep alive in seconds
    #[serde(default = "default_mqtt_keepalive")]
    pub keepalive_secs: u64,

    /// Topics carrying live reading messages
    #[serde(default = "default_mqtt_subscribe")]
    pub subscribe: Vec<String>,

    /// Prefix of published normalized readings (`{prefix}/{tag}`)
    #[serde(default = "default_mqtt_publish_prefix")]
    pub publish_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
            keepalive_secs: default_mqtt_keepalive(),
            subscribe: default_mqtt_subscribe(),
            publish_prefix: default_mqtt_publish_prefix(),
        }
    }
}

// ============================================================================
// DEFAULT VALUE FUNCTIONS
// ============================================================================

fn default_schema_version() -> String { "1.1".to_string() }
fn default_max_chunk_readings() -> usize { 1000 }
fn default_shards() -> usize { 4 }
fn default_source_id() -> String { "live".to_string() }
fn default_forward_timeout() -> u64 { 5000 }
fn default_live_batch_size() -> usize { 100 }
fn default_live_batch_window() -> u64 { 1000 }
fn default_state_dir() -> PathBuf { PathBuf::from("./data/state") }
fn default_dead_letter_dir() -> PathBuf { PathBuf::from("./data/dead-letter") }
fn default_true() -> bool { true }
fn default_checkpoint_every() -> usize { 1000 }
fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_mqtt_client_id() -> String { "plantgraph".to_string() }
fn default_mqtt_keepalive() -> u64 { 60 }
fn default_mqtt_subscribe() -> Vec<String> { vec!["plant/readings/#".to_string()] }
fn default_mqtt_publish_prefix() -> String { "plantgraph/readings".to_string() }

// ============================================================================
// LOADING AND VALIDATION
// ============================================================================

impl Config {
    /// Load and validate a config file. Any failure is fatal.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::fatal(path.display().to_string(), e))?;
        let mut config = Self::from_yaml(&text)
            .map_err(|e| PipelineError::fatal(path.display().to_string(), e))?;

        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate YAML text without resolving paths.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.schema_version.trim().is_empty() {
            return Err(PipelineError::Config("pipeline.schema_version must not be empty".into()));
        }
        if p.max_chunk_readings == 0 {
            return Err(PipelineError::Config("pipeline.max_chunk_readings must be > 0".into()));
        }
        if p.max_chunk_bytes == Some(0) {
            return Err(PipelineError::Config("pipeline.max_chunk_bytes must be > 0".into()));
        }
        if p.shards == 0 || p.shards > 1024 {
            return Err(PipelineError::Config(format!(
                "pipeline.shards must be between 1 and 1024, got {}",
                p.shards
            )));
        }
        if p.source_utc_offset_secs.abs() >= 86_400 {
            return Err(PipelineError::Config(
                "pipeline.source_utc_offset_secs must be within one day".into(),
            ));
        }

        self.dispatch.retry.validate()?;
        if self.dispatch.forward_timeout_ms == 0 {
            return Err(PipelineError::Config("dispatch.forward_timeout_ms must be > 0".into()));
        }
        if self.dispatch.live_batch_size == 0 {
            return Err(PipelineError::Config("dispatch.live_batch_size must be > 0".into()));
        }

        if self.storage.sink == SinkConfig::Mqtt && self.mqtt.is_none() {
            return Err(PipelineError::Config(
                "storage.sink type 'mqtt' requires an mqtt section".into(),
            ));
        }

        debug!("Configuration validated");
        Ok(())
    }

    fn resolve_relative(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        join(&mut self.registry);
        for p in [&mut self.alarm_rules, &mut self.relation_rules, &mut self.schema]
            .into_iter()
            .flatten()
        {
            join(p);
        }
        join(&mut self.storage.state_dir);
        join(&mut self.storage.dead_letter_dir);
        if let Some(p) = self.storage.graph_journal.as_mut() {
            join(p);
        }
        if let SinkConfig::Jsonl { path } = &mut self.storage.sink {
            join(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml("registry: tags.csv\n").unwrap();
        assert_eq!(config.pipeline.schema_version, "1.1");
        assert_eq!(config.pipeline.shards, 4);
        assert_eq!(config.pipeline.source_id, "live");
        assert_eq!(config.pipeline.resolution, TimestampResolution::Milliseconds);
        assert_eq!(config.storage.sink, SinkConfig::Memory);
        assert!(config.alarms.evaluate_degraded);
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn test_validation_rejects_zero_chunk() {
        let yaml = "registry: tags.csv\npipeline:\n  max_chunk_readings: 0\n";
        assert!(matches!(Config::from_yaml(yaml), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_mqtt_sink_requires_section() {
        let yaml = "registry: tags.csv\nstorage:\n  sink:\n    type: mqtt\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_relative_paths_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plant.yaml");
        std::fs::write(
            &path,
            "registry: tags.csv\nalarm_rules: rules/alarms.yaml\nstorage:\n  sink:\n    type: jsonl\n    path: out.jsonl\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.registry, dir.path().join("tags.csv"));
        assert_eq!(config.alarm_rules, Some(dir.path().join("rules/alarms.yaml")));
        assert_eq!(
            config.storage.sink,
            SinkConfig::Jsonl { path: dir.path().join("out.jsonl") }
        );
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = Config::from_file("/nonexistent/plant.yaml").unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfig { .. }));
    }
}

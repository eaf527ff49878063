//! PLANTGRAPH - Plant telemetry to knowledge graph pipeline
//!
//! Ingests time-stamped tag readings from files or live feeds, validates them
//! against a master tag registry, detects alarm conditions with stateful
//! threshold rules and persists what was detected as an idempotent,
//! schema-constrained property graph of plant topology and history.
//!
//! # Feature Flags
//!
//! - **mqtt**: live MQTT source and reading sink
//! - **metrics**: pipeline counters through the `metrics` facade
//!
//! # Examples
//!
//! ```rust,no_run
//! use plantgraph::{Config, Pipeline};
//!
//! # async fn run() -> plantgraph::Result<()> {
//! let config = Config::from_file("plant.yaml")?;
//! let pipeline = Pipeline::from_config(&config)?;
//! pipeline.seed_topology().await?;
//! let report = pipeline.ingest_path("readings.csv").await?;
//! println!("{} events", report.events);
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error taxonomy and crate-wide `Result`
pub mod error;

/// Typed reading values and quality flags
pub mod value;

/// YAML configuration
pub mod config;

/// Bounded exponential backoff
pub mod retry;

// ============================================================================
// INGESTION
// ============================================================================

/// Master tag registry
pub mod registry;

pub mod reader;
pub mod normalizer;
pub mod chunker;

// ============================================================================
// DETECTION
// ============================================================================

/// Threshold rules, hysteresis state machine and alarm events
pub mod alarms;

// ============================================================================
// KNOWLEDGE GRAPH
// ============================================================================

pub mod graph;
pub mod schema;
pub mod extractor;
pub mod persistor;

// ============================================================================
// DISPATCH AND STORAGE
// ============================================================================

pub mod dispatcher;
pub mod sink;
pub mod storage;
pub mod pipeline;

#[cfg(feature = "mqtt")]
pub mod mqtt;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use alarms::{AlarmEngine, AlarmPriority, AlarmRule, AlarmRuleSet, AlarmState, Event, TransitionKind};
pub use chunker::{Chunk, Chunker};
pub use config::Config;
pub use dispatcher::{AlarmShards, BatchReport, Dispatcher};
pub use error::{PipelineError, Result};
pub use extractor::{Extractor, RelationRule, Trigger};
pub use graph::{Candidates, EntityKey, EntityType, GraphEntity, GraphRelation};
pub use normalizer::{Normalizer, Reading};
pub use persistor::GraphPersistor;
pub use pipeline::{Components, Pipeline, ReplayReport, StopHandle};
pub use reader::{CsvRow, LiveInput, LiveMessage, RawReading, Reader, RejectReason, Rejection};
pub use registry::{TagDefinition, TagRegistry};
pub use schema::GraphSchema;
pub use sink::{JsonLinesSink, MemorySink, ReadingSink};
pub use storage::{DeadLetterQueue, GraphStore, InMemoryGraphStore};
pub use value::{DataType, Quality, Value};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttSink, MqttSource};

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// plantgraph version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub mod build_info {
    /// Git commit hash (if available)
    pub const GIT_HASH: Option<&str> = option_env!("PLANTGRAPH_GIT_HASH");

    /// Build timestamp (if built through the build script)
    pub const BUILD_TIMESTAMP: Option<&str> = option_env!("PLANTGRAPH_BUILD_TIMESTAMP");

    /// One-line summary for startup logs
    pub fn summary() -> String {
        format!(
            "plantgraph {} (commit {}, built {})",
            super::VERSION,
            GIT_HASH.unwrap_or("unknown"),
            BUILD_TIMESTAMP.unwrap_or("unknown")
        )
    }
}

use thiserror::Error;

/// Application level error type used throughout the crate.
///
/// Record-level problems (unknown tags, coercion failures, schema violations
/// of a single graph item) are reported as [`crate::reader::Rejection`]
/// values and never abort a batch. The variants below that mirror them exist
/// so single-record APIs can return them through `?`.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or unparseable registry, schema or pipeline configuration.
    /// Only raised while starting up.
    #[error("Fatal configuration error in {source_name}: {reason}")]
    FatalConfig { source_name: String, reason: String },

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding or decoding JSON payloads
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error while reading tabular input
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Tag is not present in the registry
    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    /// Value could not be coerced to the declared tag type
    #[error("Type mismatch for tag '{tag}': expected {expected}, got {actual}")]
    TypeMismatch {
        tag: String,
        expected: &'static str,
        actual: String,
    },

    /// Alarm or relation rule referencing an unknown tag, type or label
    #[error("Rule misconfiguration: {0}")]
    RuleMisconfiguration(String),

    /// Graph item outside the declared schema
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Reading delivered at or before the last evaluated timestamp of its tag
    #[error("Out-of-order reading for tag '{tag}': {timestamp} is not after {last}")]
    OutOfOrder {
        tag: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        last: chrono::DateTime<chrono::Utc>,
    },

    /// Downstream sink or graph store temporarily unavailable
    #[error("Transient sink failure: {0}")]
    TransientSink(String),

    /// Corrupt persisted state (WAL frame, journal line)
    #[error("Corrupt state in {location}: {reason}")]
    Corrupt { location: String, reason: String },

    /// Pipeline was stopped or a worker went away
    #[error("Pipeline shut down: {0}")]
    Shutdown(String),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::FatalConfig`] naming its source file.
    pub fn fatal(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::FatalConfig {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientSink(_))
    }
}

/// Convenient alias over [`Result`] using [`PipelineError`]
pub type Result<T> = std::result::Result<T, PipelineError>;

// src/sink.rs - Downstream destinations for normalized readings

use crate::error::{PipelineError, Result};
use crate::normalizer::Reading;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Store-and-forward destination. Delivery is at-least-once: a batch that
/// failed may be published again in full.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn publish(&self, readings: &[Reading]) -> Result<()>;

    fn name(&self) -> &str;
}

// ============================================================================
// MEMORY SINK
// ============================================================================

/// Collects readings in memory. Can be told to fail the next N publishes.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    readings: Arc<Mutex<Vec<Reading>>>,
    failures: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.readings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReadingSink for MemorySink {
    async fn publish(&self, readings: &[Reading]) -> Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::TransientSink("memory sink unavailable".into()));
        }
        self.readings.lock().extend_from_slice(readings);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// JSON LINES SINK
// ============================================================================

/// Appends one JSON object per reading and syncs after every batch
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("JSON lines sink writing to {}", path.display());
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReadingSink for JsonLinesSink {
    async fn publish(&self, readings: &[Reading]) -> Result<()> {
        let mut buf = Vec::with_capacity(readings.len() * 128);
        for reading in readings {
            serde_json::to_writer(&mut buf, reading)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock();
        file.write_all(&buf)
            .and_then(|_| file.sync_data())
            .map_err(|e| PipelineError::TransientSink(format!("{}: {}", self.path.display(), e)))?;
        debug!("Wrote {} readings to {}", readings.len(), self.path.display());
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RecordOrigin;
    use crate::value::{Quality, Value};
    use chrono::{TimeZone, Utc};

    fn reading(secs: i64, value: f64) -> Reading {
        Reading {
            tag: "T1".into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            value: Value::Float(value),
            quality: Quality::Good,
            schema_version: "1.1".into(),
            origin: RecordOrigin::new("test", secs as usize),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_failures() {
        let sink = MemorySink::new();
        sink.fail_next(2);
        assert!(sink.publish(&[reading(0, 1.0)]).await.unwrap_err().is_transient());
        assert!(sink.publish(&[reading(0, 1.0)]).await.is_err());
        sink.publish(&[reading(0, 1.0), reading(1, 2.0)]).await.unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/readings.jsonl");
        let sink = JsonLinesSink::open(&path).unwrap();
        sink.publish(&[reading(0, 1.0)]).await.unwrap();
        sink.publish(&[reading(1, 2.0)]).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Reading> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines, vec![reading(0, 1.0), reading(1, 2.0)]);
    }
}

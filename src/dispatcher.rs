// src/dispatcher.rs - Store-and-forward of readings and sharded alarm evaluation
//
// Tags are hashed onto N shard actors. Each actor owns one AlarmEngine and
// its state log, so per-tag state has a single writer and no global lock.

use crate::alarms::{AlarmEngine, AlarmRuleSet, Evaluation, StateStore};
use crate::chunker::Chunk;
use crate::config::{AlarmSettings, DispatchConfig};
use crate::error::{PipelineError, Result};
use crate::normalizer::Reading;
use crate::reader::{RejectReason, Rejection};
use crate::registry::TagRegistry;
use crate::retry::RetryPolicy;
use crate::sink::ReadingSink;
use crate::storage::{DeadLetter, DeadLetterPayload, DeadLetterQueue, WalStateStore};
use crate::value::Quality;
use futures::future::join_all;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

/// Shard owning `tag`'s alarm state
pub fn shard_for(tag: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    tag.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

// ============================================================================
// BATCH REPORT
// ============================================================================

/// Counters of one ingested batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected_unknown_tag: usize,
    pub rejected_type_mismatch: usize,
    pub rejected_schema_violation: usize,
    pub rejected_malformed: usize,
    pub out_of_range: usize,
    pub out_of_order: usize,
    pub forwarded: usize,
    pub parked: usize,
    pub events: usize,
    pub entities_created: usize,
    pub entities_unchanged: usize,
    pub relations_created: usize,
    pub relations_unchanged: usize,
    pub chunks: usize,
}

impl BatchReport {
    /// Count a rejection under its reason.
    pub fn reject(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::UnknownTag => self.rejected_unknown_tag += 1,
            RejectReason::TypeMismatch => self.rejected_type_mismatch += 1,
            RejectReason::SchemaViolation => self.rejected_schema_violation += 1,
            RejectReason::Malformed => self.rejected_malformed += 1,
        }
    }

    pub fn rejected(&self) -> usize {
        self.rejected_unknown_tag
            + self.rejected_type_mismatch
            + self.rejected_schema_violation
            + self.rejected_malformed
    }

    pub fn merge(&mut self, other: &BatchReport) {
        self.accepted += other.accepted;
        self.rejected_unknown_tag += other.rejected_unknown_tag;
        self.rejected_type_mismatch += other.rejected_type_mismatch;
        self.rejected_schema_violation += other.rejected_schema_violation;
        self.rejected_malformed += other.rejected_malformed;
        self.out_of_range += other.out_of_range;
        self.out_of_order += other.out_of_order;
        self.forwarded += other.forwarded;
        self.parked += other.parked;
        self.events += other.events;
        self.entities_created += other.entities_created;
        self.entities_unchanged += other.entities_unchanged;
        self.relations_created += other.relations_created;
        self.relations_unchanged += other.relations_unchanged;
        self.chunks += other.chunks;
    }

    #[cfg(feature = "metrics")]
    pub fn record_metrics(&self) {
        counter!("plantgraph_readings_accepted_total").increment(self.accepted as u64);
        counter!("plantgraph_readings_rejected_total").increment(self.rejected() as u64);
        counter!("plantgraph_readings_forwarded_total").increment(self.forwarded as u64);
        counter!("plantgraph_dead_letters_total").increment(self.parked as u64);
        counter!("plantgraph_events_total").increment(self.events as u64);
        counter!("plantgraph_entities_created_total").increment(self.entities_created as u64);
        counter!("plantgraph_relations_created_total").increment(self.relations_created as u64);
    }
}

// ============================================================================
// ALARM SHARDS
// ============================================================================

struct ShardJob {
    readings: Vec<Reading>,
    reply: oneshot::Sender<Result<Evaluation>>,
}

/// Pool of alarm shard actors
pub struct AlarmShards {
    senders: Vec<mpsc::Sender<ShardJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl AlarmShards {
    /// Spawn one actor per store. Must be called inside a tokio runtime.
    pub fn spawn(
        rules: Arc<AlarmRuleSet>,
        registry: Arc<TagRegistry>,
        stores: Vec<Box<dyn StateStore>>,
        settings: &AlarmSettings,
    ) -> Result<Self> {
        if stores.is_empty() {
            return Err(PipelineError::Config("at least one alarm shard is required".into()));
        }

        let mut senders = Vec::with_capacity(stores.len());
        let mut handles = Vec::with_capacity(stores.len());
        for (shard, store) in stores.into_iter().enumerate() {
            let mut engine = AlarmEngine::new(rules.clone(), registry.clone(), store, settings)?;
            let (tx, mut rx) = mpsc::channel::<ShardJob>(16);

            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let result = engine.evaluate_all(job.readings.iter());
                    if let Err(e) = &result {
                        error!("Alarm shard {} failed: {}", shard, e);
                    }
                    let _ = job.reply.send(result);
                }
                debug!("Alarm shard {} stopped", shard);
            }));
            senders.push(tx);
        }

        info!("Started {} alarm shards", senders.len());
        Ok(Self { senders, handles })
    }

    /// Spawn shards persisting their state in per-shard WAL files under `dir`.
    pub fn spawn_with_wal(
        rules: Arc<AlarmRuleSet>,
        registry: Arc<TagRegistry>,
        dir: &Path,
        shards: usize,
        settings: &AlarmSettings,
    ) -> Result<Self> {
        let stores = (0..shards)
            .map(|shard| WalStateStore::open(dir, shard, shards).map(|s| Box::new(s) as Box<dyn StateStore>))
            .collect::<Result<Vec<_>>>()?;
        Self::spawn(rules, registry, stores, settings)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Evaluate readings, each tag on its own shard. Per-tag input order is
    /// kept; events come back ordered by timestamp, then tag.
    pub async fn evaluate(&self, readings: &[Reading]) -> Result<Evaluation> {
        let shards = self.senders.len();
        let mut partitions: Vec<Vec<Reading>> = vec![Vec::new(); shards];
        for reading in readings {
            partitions[shard_for(&reading.tag, shards)].push(reading.clone());
        }

        let mut replies = Vec::new();
        for (shard, part) in partitions.into_iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            let (reply, rx) = oneshot::channel();
            self.senders[shard]
                .send(ShardJob { readings: part, reply })
                .await
                .map_err(|_| PipelineError::Shutdown(format!("alarm shard {} is gone", shard)))?;
            replies.push(rx);
        }

        let mut merged = Evaluation::default();
        for reply in join_all(replies).await {
            let evaluation = reply.map_err(|_| PipelineError::Shutdown("alarm shard dropped a job".into()))??;
            merged.evaluated += evaluation.evaluated;
            merged.out_of_order += evaluation.out_of_order;
            merged.skipped += evaluation.skipped;
            merged.events.extend(evaluation.events);
        }
        merged.events.sort_by(|a, b| {
            (a.timestamp, &a.tag, a.kind.as_str()).cmp(&(b.timestamp, &b.tag, b.kind.as_str()))
        });
        Ok(merged)
    }

    /// Stop every actor once its queued jobs are done.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in join_all(self.handles).await {
            if let Err(e) = handle {
                warn!("Alarm shard task ended abnormally: {}", e);
            }
        }
        info!("Alarm shards stopped");
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Outcome of forwarding one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered(usize),
    Parked(usize),
}

/// Forwards chunks to the sink and parks what cannot be delivered
pub struct Dispatcher {
    sink: Arc<dyn ReadingSink>,
    dead_letters: Arc<DeadLetterQueue>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn ReadingSink>, dead_letters: Arc<DeadLetterQueue>, config: &DispatchConfig) -> Self {
        Self {
            sink,
            dead_letters,
            retry: config.retry.clone(),
            timeout: Duration::from_millis(config.forward_timeout_ms),
        }
    }

    pub fn sink(&self) -> &Arc<dyn ReadingSink> {
        &self.sink
    }

    /// Publish a chunk as one batch, retrying the whole batch on transient
    /// failures and timeouts. Exhausted retries park the chunk.
    pub async fn forward(&self, chunk: &Chunk) -> Result<Forwarded> {
        if chunk.is_empty() {
            return Ok(Forwarded::Delivered(0));
        }

        match self.publish(&chunk.readings).await {
            Ok(()) => {
                debug!("Forwarded chunk {} ({} readings)", chunk.chunk_id, chunk.len());
                Ok(Forwarded::Delivered(chunk.len()))
            }
            Err(e) if e.is_transient() => {
                error!("Sink {} gave up on chunk {}: {}", self.sink.name(), chunk.chunk_id, e);
                let letter = DeadLetter::new(
                    e.to_string(),
                    DeadLetterPayload::Readings {
                        chunk_id: chunk.chunk_id.clone(),
                        readings: chunk.readings.clone(),
                    },
                );
                self.dead_letters.park(&[letter])?;
                Ok(Forwarded::Parked(chunk.len()))
            }
            Err(e) => Err(e),
        }
    }

    /// Publish readings with retry and per-attempt timeout.
    pub async fn publish(&self, readings: &[Reading]) -> Result<()> {
        let what = format!("publish to {}", self.sink.name());
        self.retry
            .run(&what, || async {
                match tokio::time::timeout(self.timeout, self.sink.publish(readings)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::TransientSink(format!(
                        "{} timed out after {:?}",
                        self.sink.name(),
                        self.timeout
                    ))),
                }
            })
            .await
    }

    /// Count and park record rejections.
    pub fn reject(&self, rejections: Vec<Rejection>, report: &mut BatchReport) -> Result<()> {
        if rejections.is_empty() {
            return Ok(());
        }
        for rejection in &rejections {
            warn!(
                "{} at {}{}: {}",
                rejection.reason.as_str(),
                rejection.origin,
                rejection.tag.as_deref().map(|t| format!(" ({})", t)).unwrap_or_default(),
                rejection.detail
            );
            report.reject(rejection.reason);
        }
        let letters: Vec<DeadLetter> = rejections.into_iter().map(DeadLetter::rejection).collect();
        report.parked += letters.len();
        self.dead_letters.park(&letters)?;
        Ok(())
    }

    /// Count the accepted readings of a chunk.
    pub fn account(chunk: &Chunk, report: &mut BatchReport) {
        report.chunks += 1;
        report.accepted += chunk.len();
        report.out_of_range += chunk.readings.iter().filter(|r| r.quality == Quality::OutOfRange).count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::{AlarmRule, MemoryStateStore, TransitionKind};
    use crate::reader::RecordOrigin;
    use crate::registry::TagDefinition;
    use crate::sink::MemorySink;
    use crate::value::{DataType, Value};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn registry() -> Arc<TagRegistry> {
        Arc::new(
            TagRegistry::from_definitions(
                ["T1", "T2", "T3", "T4"]
                    .into_iter()
                    .map(|t| TagDefinition::new(t, DataType::Numeric, "A1")),
            )
            .unwrap(),
        )
    }

    fn reading(tag: &str, secs: i64, value: f64) -> Reading {
        Reading {
            tag: tag.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            value: Value::Float(value),
            quality: Quality::Good,
            schema_version: "1.1".into(),
            origin: RecordOrigin::new("test", secs as usize),
        }
    }

    fn chunk(readings: Vec<Reading>) -> Chunk {
        Chunk {
            sequence: 0,
            source_id: "test".into(),
            chunk_id: "test_0_0".into(),
            start: readings[0].timestamp,
            end: readings[readings.len() - 1].timestamp,
            readings,
        }
    }

    #[test]
    fn test_shard_for_is_stable_and_bounded() {
        for tag in ["T1", "T2", "Pump.Flow", ""] {
            let shard = shard_for(tag, 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for(tag, 4));
        }
        assert_eq!(shard_for("T1", 0), 0);
    }

    #[tokio::test]
    async fn test_shards_keep_per_tag_order() {
        let registry = registry();
        let rules = Arc::new(AlarmRuleSet::from_rules(
            ["T1", "T2", "T3", "T4"]
                .into_iter()
                .map(|t| AlarmRule::new(t).with_high(100.0).with_hysteresis(5.0)),
            &registry,
        ));
        let stores: Vec<Box<dyn StateStore>> =
            (0..3).map(|_| Box::new(MemoryStateStore::new()) as Box<dyn StateStore>).collect();
        let shards = AlarmShards::spawn(rules, registry, stores, &AlarmSettings::default()).unwrap();

        let mut readings = Vec::new();
        for tag in ["T1", "T2", "T3", "T4"] {
            readings.push(reading(tag, 0, 90.0));
            readings.push(reading(tag, 1, 101.0));
            readings.push(reading(tag, 2, 94.0));
        }
        let evaluation = shards.evaluate(&readings).await.unwrap();
        assert_eq!(evaluation.evaluated, 12);
        assert_eq!(evaluation.events.len(), 8);
        assert_eq!(evaluation.events[0].kind, TransitionKind::EnterHigh);
        assert!(evaluation.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let replay = shards.evaluate(&readings).await.unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.out_of_order, 12);
        shards.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_parks_after_retries() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(DeadLetterQueue::open(dir.path()).unwrap());
        let sink = MemorySink::new();
        let config = DispatchConfig { retry: RetryPolicy::immediate(3), ..DispatchConfig::default() };
        let dispatcher = Dispatcher::new(Arc::new(sink.clone()), queue.clone(), &config);

        sink.fail_next(2);
        let delivered = dispatcher.forward(&chunk(vec![reading("T1", 0, 1.0)])).await.unwrap();
        assert_eq!(delivered, Forwarded::Delivered(1));

        sink.fail_next(3);
        let parked = dispatcher.forward(&chunk(vec![reading("T1", 1, 2.0)])).await.unwrap();
        assert_eq!(parked, Forwarded::Parked(1));
        assert_eq!(sink.len(), 1);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_report_counts_rejections() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(DeadLetterQueue::open(dir.path()).unwrap());
        let dispatcher = Dispatcher::new(Arc::new(MemorySink::new()), queue.clone(), &DispatchConfig::default());

        let mut report = BatchReport::default();
        let rejections = vec![
            Rejection::new(RecordOrigin::new("in.csv", 0), RejectReason::UnknownTag, "tag not in registry"),
            Rejection::new(RecordOrigin::new("in.csv", 1), RejectReason::TypeMismatch, "expected numeric"),
        ];
        dispatcher.reject(rejections, &mut report).unwrap();
        assert_eq!(report.rejected_unknown_tag, 1);
        assert_eq!(report.rejected_type_mismatch, 1);
        assert_eq!(report.rejected(), 2);
        assert_eq!(report.parked, 2);
        assert_eq!(queue.len().unwrap(), 2);
    }
}

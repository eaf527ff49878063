// src/pipeline.rs - Reader → Normalizer → Chunker → {Dispatcher, Alarm shards} → Extractor → Persistor

use crate::alarms::AlarmRuleSet;
use crate::chunker::Chunker;
use crate::config::{Config, SinkConfig};
use crate::dispatcher::{AlarmShards, BatchReport, Dispatcher, Forwarded};
use crate::error::{PipelineError, Result};
use crate::extractor::{Extractor, RelationRule};
use crate::graph::Candidates;
use crate::normalizer::{Normalizer, NormalizerSettings};
use crate::persistor::{GraphPersistor, PersistOutcome};
use crate::reader::{CsvRow, LiveInput, LiveMessage, ReadOutcome, Reader, Rejection};
use crate::registry::TagRegistry;
use crate::schema::GraphSchema;
use crate::sink::{JsonLinesSink, MemorySink, ReadingSink};
use crate::storage::{DeadLetter, DeadLetterPayload, DeadLetterQueue, GraphStats, GraphStore, InMemoryGraphStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// COMPONENTS
// ============================================================================

/// Loaded configuration artifacts and the pipeline's outer ports
pub struct Components {
    pub registry: Arc<TagRegistry>,
    pub alarm_rules: Arc<AlarmRuleSet>,
    pub relation_rules: Vec<RelationRule>,
    pub schema: Arc<GraphSchema>,
    pub sink: Arc<dyn ReadingSink>,
    pub store: Arc<dyn GraphStore>,
}

impl Components {
    /// Load registry, rules and schema, and open the configured sink and
    /// graph store. Any configuration failure is fatal.
    pub fn load(config: &Config) -> Result<Self> {
        let registry = Arc::new(TagRegistry::from_csv_path(&config.registry)?);

        let schema = Arc::new(match &config.schema {
            Some(path) => GraphSchema::from_yaml_path(path)?,
            None => GraphSchema::default(),
        });

        let alarm_rules = Arc::new(match &config.alarm_rules {
            Some(path) => AlarmRuleSet::from_yaml_path(path, &registry)?,
            None => AlarmRuleSet::from_rules(Vec::new(), &registry),
        });

        let relation_rules = match &config.relation_rules {
            Some(path) => RelationRule::load_yaml_path(path, &schema)?,
            None => RelationRule::defaults(),
        };

        let sink: Arc<dyn ReadingSink> = match &config.storage.sink {
            SinkConfig::Memory => Arc::new(MemorySink::new()),
            SinkConfig::Jsonl { path } => Arc::new(JsonLinesSink::open(path)?),
            #[cfg(feature = "mqtt")]
            SinkConfig::Mqtt => {
                let mqtt = config
                    .mqtt
                    .as_ref()
                    .ok_or_else(|| PipelineError::fatal("storage.sink", "mqtt sink without mqtt section"))?;
                Arc::new(crate::mqtt::MqttSink::connect(mqtt))
            }
            #[cfg(not(feature = "mqtt"))]
            SinkConfig::Mqtt => {
                return Err(PipelineError::fatal("storage.sink", "built without the 'mqtt' feature"));
            }
        };

        let store: Arc<dyn GraphStore> = match &config.storage.graph_journal {
            Some(path) => Arc::new(InMemoryGraphStore::open(path)?),
            None => Arc::new(InMemoryGraphStore::new()),
        };

        Ok(Self { registry, alarm_rules, relation_rules, schema, sink, store })
    }
}

// ============================================================================
// REPORTS
// ============================================================================

/// Outcome of replaying the dead-letter queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub files: usize,
    pub letters: usize,
    pub replayed: usize,
    /// Letters parked again because they still cannot be processed
    pub reparked: usize,
    pub batch: BatchReport,
}

// ============================================================================
// STOP HANDLE
// ============================================================================

/// Cloneable handle that stops a pipeline at its next chunk boundary and
/// wakes an idle live loop
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        Self { tx: Arc::new(watch::Sender::new(false)) }
    }

    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("Pipeline stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the pipeline has been stopped.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    reader: Reader,
    normalizer: Normalizer,
    chunker: Chunker,
    shards: AlarmShards,
    extractor: Extractor,
    dispatcher: Dispatcher,
    persistor: GraphPersistor,
    dead_letters: Arc<DeadLetterQueue>,
    stop: StopHandle,
    source_id: String,
    live_batch_size: usize,
    live_batch_window: Duration,
}

impl Pipeline {
    /// Build a pipeline from a config file's contents. Must be called inside
    /// a tokio runtime, which hosts the alarm shards.
    pub fn from_config(config: &Config) -> Result<Self> {
        let components = Components::load(config)?;
        Self::new(config, components)
    }

    pub fn new(config: &Config, components: Components) -> Result<Self> {
        let Components { registry, alarm_rules, relation_rules, schema, sink, store } = components;

        let dead_letters = Arc::new(DeadLetterQueue::open(&config.storage.dead_letter_dir)?);
        let shards = AlarmShards::spawn_with_wal(
            alarm_rules.clone(),
            registry.clone(),
            &config.storage.state_dir,
            config.pipeline.shards,
            &config.alarms,
        )?;

        let pipeline = Self {
            reader: Reader::new(registry.clone()),
            normalizer: Normalizer::new(registry.clone(), NormalizerSettings::from(&config.pipeline)),
            chunker: Chunker::from_settings(&config.pipeline)?,
            shards,
            extractor: Extractor::new(registry.clone(), alarm_rules.clone(), relation_rules)?,
            dispatcher: Dispatcher::new(sink, dead_letters.clone(), &config.dispatch),
            persistor: GraphPersistor::new(store, schema, dead_letters.clone(), config.dispatch.retry.clone()),
            dead_letters,
            stop: StopHandle::new(),
            source_id: config.pipeline.source_id.clone(),
            live_batch_size: config.dispatch.live_batch_size,
            live_batch_window: Duration::from_millis(config.dispatch.live_batch_window_ms),
        };

        info!(
            "Pipeline ready: {} tags, {} alarm rules, {} relation rules, {} shards",
            registry.len(),
            alarm_rules.len(),
            pipeline.extractor.rules().len(),
            pipeline.shards.len()
        );
        Ok(pipeline)
    }

    /// Persist the static plant topology. Idempotent.
    pub async fn seed_topology(&self) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let outcome = self.persistor.persist(self.extractor.seed_topology()).await?;
        apply_persist(&mut report, &outcome);
        info!(
            "Topology seeded: {} entities and {} relations created",
            report.entities_created, report.relations_created
        );
        Ok(report)
    }

    /// Ingest a CSV, JSON lines or JSON array file. The file stem names the
    /// source; `pipeline.source_id` stands in when it is not valid UTF-8.
    pub async fn ingest_path(&self, path: impl AsRef<Path>) -> Result<BatchReport> {
        let path = path.as_ref();
        let outcome = self.reader.read_path(path)?;
        let source_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.source_id)
            .to_string();
        self.process(&source_id, outcome).await
    }

    /// Ingest CSV content from any reader.
    pub async fn ingest_csv<R: std::io::Read>(&self, source_id: &str, input: R) -> Result<BatchReport> {
        let outcome = self.reader.read_csv(source_id, input)?;
        self.process(source_id, outcome).await
    }

    /// Ingest a batch of live messages.
    pub async fn ingest_messages(&self, source_id: &str, messages: Vec<LiveMessage>) -> Result<BatchReport> {
        let outcome = self.reader.read_messages(source_id, messages);
        self.process(source_id, outcome).await
    }

    /// Ingest a batch of live channel items. Malformed transport payloads are
    /// counted and parked with the batch's rejections.
    pub async fn ingest_live(&self, source_id: &str, items: Vec<LiveInput>) -> Result<BatchReport> {
        let mut messages = Vec::with_capacity(items.len());
        let mut malformed: Vec<Rejection> = Vec::new();
        for item in items {
            match item {
                LiveInput::Message(message) => messages.push(message),
                LiveInput::Malformed(rejection) => malformed.push(rejection),
            }
        }
        let mut outcome = self.reader.read_messages(source_id, messages);
        outcome.rejections.extend(malformed);
        self.process(source_id, outcome).await
    }

    /// Micro-batch live items by size and time window until the channel
    /// closes or the pipeline is stopped. Batches are named
    /// `{pipeline.source_id}-{n}`.
    pub async fn run_live(&self, mut rx: mpsc::Receiver<LiveInput>) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        let mut batch: Vec<LiveInput> = Vec::with_capacity(self.live_batch_size);
        let mut batches = 0u64;
        info!(
            "Live ingestion started: batches of {} or every {:?}",
            self.live_batch_size, self.live_batch_window
        );

        loop {
            let first = tokio::select! {
                item = rx.recv() => item,
                _ = self.stop.stopped() => {
                    info!("Live ingestion stopped while idle");
                    break;
                }
            };
            let Some(first) = first else {
                break;
            };

            batch.push(first);
            let deadline = Instant::now() + self.live_batch_window;
            let mut closed = false;
            while batch.len() < self.live_batch_size {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(item)) => batch.push(item),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            let source_id = format!("{}-{}", self.source_id, batches);
            batches += 1;
            let report = self.ingest_live(&source_id, std::mem::take(&mut batch)).await?;
            total.merge(&report);
            if closed || self.is_stopped() {
                break;
            }
        }

        info!("Live ingestion finished after {} batches", batches);
        Ok(total)
    }

    /// Replay parked letters: readings are forwarded again, graph items are
    /// persisted again and rejected live messages or CSV rows are re-ingested.
    pub async fn replay_dead_letters(&self) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();

        for file in self.dead_letters.drain()? {
            report.files += 1;
            report.letters += file.letters.len();

            match self.replay_file(&file.letters, &mut report).await {
                Ok(remaining) => {
                    report.reparked += remaining.len();
                    self.dead_letters.park(&remaining)?;
                    self.dead_letters.complete(file)?;
                }
                Err(e) => {
                    warn!("Replay of {} failed, returning it to the queue: {}", file.path.display(), e);
                    self.dead_letters.restore(file)?;
                    return Err(e);
                }
            }
        }

        info!(
            "Dead-letter replay: {} files, {} letters, {} replayed, {} parked again",
            report.files, report.letters, report.replayed, report.reparked
        );
        Ok(report)
    }

    async fn replay_file(&self, letters: &[DeadLetter], report: &mut ReplayReport) -> Result<Vec<DeadLetter>> {
        let mut remaining = Vec::new();
        let mut messages = Vec::new();
        let mut rows: Vec<CsvRow> = Vec::new();

        for letter in letters {
            match &letter.payload {
                DeadLetterPayload::Readings { chunk_id, readings } => match self.dispatcher.publish(readings).await {
                    Ok(()) => {
                        debug!("Replayed chunk {}", chunk_id);
                        report.batch.forwarded += readings.len();
                        report.replayed += 1;
                    }
                    Err(e) if e.is_transient() => remaining.push(letter.clone()),
                    Err(e) => return Err(e),
                },
                DeadLetterPayload::Graph { items } => {
                    let outcome = self.persistor.persist_items(items.clone()).await?;
                    apply_persist(&mut report.batch, &outcome);
                    report.replayed += 1;
                }
                DeadLetterPayload::Rejection(rejection) => {
                    let Some(payload) = rejection.payload.clone() else {
                        remaining.push(letter.clone());
                        continue;
                    };
                    if let Ok(message) = serde_json::from_value::<LiveMessage>(payload.clone()) {
                        messages.push(message);
                        report.replayed += 1;
                    } else if let Ok(row) = serde_json::from_value::<CsvRow>(payload) {
                        rows.push(row);
                        report.replayed += 1;
                    } else {
                        remaining.push(letter.clone());
                    }
                }
            }
        }

        if !messages.is_empty() {
            let batch = self.ingest_messages("dead-letter", messages).await?;
            report.batch.merge(&batch);
        }
        for row in rows {
            let batch = self.ingest_csv("dead-letter", &row.to_csv()?[..]).await?;
            report.batch.merge(&batch);
        }
        Ok(remaining)
    }

    async fn process(&self, source_id: &str, outcome: ReadOutcome) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let ReadOutcome { readings: raws, mut rejections } = outcome;

        let (readings, normalize_rejections) = self.normalizer.normalize_batch(raws);
        rejections.extend(normalize_rejections);
        self.dispatcher.reject(rejections, &mut report)?;

        for chunk in self.chunker.chunks(source_id, &readings) {
            if self.is_stopped() {
                info!("Pipeline stopped before chunk {}", chunk.chunk_id);
                break;
            }
            Dispatcher::account(&chunk, &mut report);

            let (forwarded, evaluation) =
                tokio::join!(self.dispatcher.forward(&chunk), self.shards.evaluate(&chunk.readings));

            // Alarm state is already durable, so the events are persisted or
            // parked before a forwarding error can end the batch
            let evaluation = evaluation?;
            report.out_of_order += evaluation.out_of_order;
            report.events += evaluation.events.len();

            let mut candidates = Candidates::default();
            for event in &evaluation.events {
                info!("{} {} at {}: {}", event.priority.as_str(), event.kind, event.timestamp, event.description);
                candidates.extend(self.extractor.extract(event));
            }
            if !candidates.is_empty() {
                self.persist_events(&chunk.chunk_id, candidates, &mut report).await?;
            }

            match forwarded? {
                Forwarded::Delivered(n) => report.forwarded += n,
                Forwarded::Parked(n) => report.parked += n,
            }
        }

        #[cfg(feature = "metrics")]
        report.record_metrics();

        info!(
            "Batch {}: {} accepted, {} rejected, {} forwarded, {} events, {} chunks",
            source_id,
            report.accepted,
            report.rejected(),
            report.forwarded,
            report.events,
            report.chunks
        );
        Ok(report)
    }

    /// Persist the graph candidates of a chunk's events. When persisting
    /// fails outright the candidates are parked before the error is returned.
    async fn persist_events(&self, chunk_id: &str, candidates: Candidates, report: &mut BatchReport) -> Result<()> {
        let fallback = candidates.clone();
        match self.persistor.persist(candidates).await {
            Ok(outcome) => {
                apply_persist(report, &outcome);
                Ok(())
            }
            Err(e) => {
                error!("Persisting events of chunk {} failed, parking them: {}", chunk_id, e);
                let letter = DeadLetter::new(
                    format!("persist failed: {}", e),
                    DeadLetterPayload::Graph { items: fallback.into_items().collect() },
                );
                if let Err(park_error) = self.dead_letters.park(&[letter]) {
                    error!("Events of chunk {} could not be parked: {}", chunk_id, park_error);
                }
                Err(e)
            }
        }
    }

    /// Stop processing at the next chunk boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Handle for signal handlers and other tasks
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub async fn graph_stats(&self) -> Result<GraphStats> {
        self.persistor.store().stats().await
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Stop the alarm shards after their queued work.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.shards.shutdown().await;
        Ok(())
    }
}

fn apply_persist(report: &mut BatchReport, outcome: &PersistOutcome) {
    report.entities_created += outcome.commit.entities_created;
    report.entities_unchanged += outcome.commit.entities_unchanged;
    report.relations_created += outcome.commit.relations_created;
    report.relations_unchanged += outcome.commit.relations_unchanged;
    report.rejected_schema_violation += outcome.schema_violations;
    report.parked += outcome.parked;
}

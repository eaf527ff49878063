// src/storage/graph_store.rs - Transactional, idempotent property graph store
//
// A commit creates every entity and relation whose natural key is absent and
// leaves existing ones untouched. Relations are only created when both
// endpoints exist in the store or in the same transaction.

use crate::error::{PipelineError, Result};
use crate::graph::{Candidates, EntityKey, GraphEntity, GraphRelation, RelationKey};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_STRIPES: usize = 64;

/// One atomic upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphTransaction {
    pub id: Uuid,
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<GraphRelation>,
}

impl GraphTransaction {
    pub fn new(candidates: Candidates) -> Self {
        Self {
            id: Uuid::new_v4(),
            entities: candidates.entities,
            relations: candidates.relations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// What a commit changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub entities_created: usize,
    pub entities_unchanged: usize,
    pub relations_created: usize,
    pub relations_unchanged: usize,
    /// Relations refused because an endpoint is missing
    pub relations_refused: Vec<RelationKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
    pub entities_by_type: BTreeMap<String, usize>,
    pub relations_by_label: BTreeMap<String, usize>,
}

/// Graph store with an atomic upsert-by-natural-key primitive
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn commit(&self, tx: GraphTransaction) -> Result<CommitOutcome>;
    async fn stats(&self) -> Result<GraphStats>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct GraphState {
    entities: HashMap<EntityKey, GraphEntity>,
    relations: HashMap<RelationKey, GraphRelation>,
    outgoing: HashMap<EntityKey, Vec<RelationKey>>,
    incoming: HashMap<EntityKey, Vec<RelationKey>>,
}

impl GraphState {
    fn upsert_entity(&mut self, entity: GraphEntity) -> bool {
        let key = entity.entity_key();
        if self.entities.contains_key(&key) {
            return false;
        }
        self.entities.insert(key, entity);
        true
    }

    fn add_relation(&mut self, relation: GraphRelation) -> bool {
        let key = relation.relation_key();
        if self.relations.contains_key(&key) {
            return false;
        }
        self.outgoing.entry(key.source.clone()).or_default().push(key.clone());
        self.incoming.entry(key.target.clone()).or_default().push(key.clone());
        self.relations.insert(key, relation);
        true
    }
}

/// Journal record of the items a commit created
#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    tx: Uuid,
    entities: Vec<GraphEntity>,
    relations: Vec<GraphRelation>,
}

/// What replaying a journal found
#[derive(Debug, Default)]
struct JournalReplay {
    applied: usize,
    /// Length of the journal up to the end of the last complete record
    valid: u64,
    /// The last record parsed but lost its trailing newline
    unterminated: bool,
}

/// In-memory graph, optionally made durable by a write-ahead journal
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
    stripes: Vec<Mutex<()>>,
    journal: Option<(PathBuf, Mutex<File>)>,
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            journal: None,
        }
    }

    /// Open a journal-backed store, replaying committed transactions. A torn
    /// trailing record is cut off before the journal is reopened for appends.
    pub fn open<P: AsRef<Path>>(journal: P) -> Result<Self> {
        let path = journal.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut store = Self::new();
        let replay = store.replay(&path)?;

        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        if replay.valid < size {
            warn!("Truncating {} from {} to {} bytes", path.display(), size, replay.valid);
            file.set_len(replay.valid)?;
            file.sync_all()?;
        }
        drop(file);

        let mut file = OpenOptions::new().append(true).open(&path)?;
        if replay.unterminated {
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        store.journal = Some((path.clone(), Mutex::new(file)));

        let state = store.state.read();
        info!(
            "Graph journal {} replayed: {} transactions, {} entities, {} relations",
            path.display(),
            replay.applied,
            state.entities.len(),
            state.relations.len()
        );
        drop(state);
        Ok(store)
    }

    fn replay(&mut self, path: &Path) -> Result<JournalReplay> {
        let mut replay = JournalReplay::default();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(replay),
            Err(e) => return Err(e.into()),
        };

        let state = self.state.get_mut();
        let mut offset = 0usize;
        let mut line_no = 0usize;

        while offset < data.len() {
            line_no += 1;
            let rest = &data[offset..];
            let (line, next, terminated) = match rest.iter().position(|b| *b == b'\n') {
                Some(i) => (&rest[..i], offset + i + 1, true),
                None => (rest, data.len(), false),
            };
            let last = next >= data.len();

            if line.iter().all(u8::is_ascii_whitespace) {
                offset = next;
                if terminated {
                    replay.valid = next as u64;
                }
                continue;
            }

            let record: JournalRecord = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(e) if last => {
                    warn!("Ignoring torn last record of {}: {}", path.display(), e);
                    break;
                }
                Err(e) => {
                    return Err(PipelineError::Corrupt {
                        location: format!("{}:{}", path.display(), line_no),
                        reason: e.to_string(),
                    })
                }
            };
            for entity in record.entities {
                state.upsert_entity(entity);
            }
            for relation in record.relations {
                state.add_relation(relation);
            }
            replay.applied += 1;
            replay.valid = next as u64;
            replay.unterminated = !terminated;
            offset = next;
        }
        Ok(replay)
    }

    fn stripe_of<K: Hash>(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % LOCK_STRIPES
    }

    /// Commit under the stripe locks of every touched key. Stripes are taken
    /// in ascending order so overlapping transactions cannot deadlock.
    fn commit_blocking(&self, tx: GraphTransaction) -> Result<CommitOutcome> {
        let mut stripes: Vec<usize> = tx
            .entities
            .iter()
            .map(|e| Self::stripe_of(&e.entity_key()))
            .chain(tx.relations.iter().map(|r| Self::stripe_of(&r.relation_key())))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        let _guards: Vec<_> = stripes.iter().map(|&i| self.stripes[i].lock()).collect();

        let mut outcome = CommitOutcome::default();
        let mut new_entities: Vec<GraphEntity> = Vec::new();
        let mut new_relations: Vec<GraphRelation> = Vec::new();
        {
            let state = self.state.read();
            let mut seen_entities: HashSet<EntityKey> = HashSet::new();
            for entity in tx.entities {
                let key = entity.entity_key();
                if state.entities.contains_key(&key) || !seen_entities.insert(key) {
                    outcome.entities_unchanged += 1;
                } else {
                    new_entities.push(entity);
                }
            }

            let mut seen_relations: HashSet<RelationKey> = HashSet::new();
            for relation in tx.relations {
                let key = relation.relation_key();
                if state.relations.contains_key(&key) || seen_relations.contains(&key) {
                    outcome.relations_unchanged += 1;
                    continue;
                }
                let present = |k: &EntityKey| state.entities.contains_key(k) || seen_entities.contains(k);
                if !present(&key.source) || !present(&key.target) {
                    debug!("Refusing relation {} with a missing endpoint", key);
                    outcome.relations_refused.push(key);
                    continue;
                }
                seen_relations.insert(key);
                new_relations.push(relation);
            }
        }

        if new_entities.is_empty() && new_relations.is_empty() {
            return Ok(outcome);
        }

        let record = JournalRecord { tx: tx.id, entities: new_entities, relations: new_relations };
        if let Some((_, file)) = &self.journal {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = file.lock();
            file.write_all(&line)?;
            file.sync_data()?;
        }

        let mut state = self.state.write();
        for entity in record.entities {
            if state.upsert_entity(entity) {
                outcome.entities_created += 1;
            }
        }
        for relation in record.relations {
            if state.add_relation(relation) {
                outcome.relations_created += 1;
            }
        }

        debug!(
            "Transaction {} committed: {} entities, {} relations created",
            tx.id, outcome.entities_created, outcome.relations_created
        );
        Ok(outcome)
    }

    pub fn entity(&self, key: &EntityKey) -> Option<GraphEntity> {
        self.state.read().entities.get(key).cloned()
    }

    pub fn relation(&self, key: &RelationKey) -> Option<GraphRelation> {
        self.state.read().relations.get(key).cloned()
    }

    /// Relations leaving `key`
    pub fn outgoing(&self, key: &EntityKey) -> Vec<GraphRelation> {
        let state = self.state.read();
        state
            .outgoing
            .get(key)
            .map(|keys| keys.iter().filter_map(|k| state.relations.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    /// Relations arriving at `key`
    pub fn incoming(&self, key: &EntityKey) -> Vec<GraphRelation> {
        let state = self.state.read();
        state
            .incoming
            .get(key)
            .map(|keys| keys.iter().filter_map(|k| state.relations.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.state.read().relations.len()
    }

    /// Every relation, sorted by key
    pub fn relations(&self) -> Vec<GraphRelation> {
        let state = self.state.read();
        let mut relations: Vec<_> = state.relations.values().cloned().collect();
        relations.sort_by_key(|r| r.relation_key());
        relations
    }

    /// Every entity, sorted by key
    pub fn entities(&self) -> Vec<GraphEntity> {
        let state = self.state.read();
        let mut entities: Vec<_> = state.entities.values().cloned().collect();
        entities.sort_by_key(|e| e.entity_key());
        entities
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|(p, _)| p.as_path())
    }

    fn compute_stats(&self) -> GraphStats {
        let state = self.state.read();
        let mut stats = GraphStats {
            entity_count: state.entities.len(),
            relation_count: state.relations.len(),
            ..GraphStats::default()
        };
        for key in state.entities.keys() {
            *stats.entities_by_type.entry(key.entity_type.to_string()).or_default() += 1;
        }
        for key in state.relations.keys() {
            *stats.relations_by_label.entry(key.label.clone()).or_default() += 1;
        }
        stats
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn commit(&self, tx: GraphTransaction) -> Result<CommitOutcome> {
        self.commit_blocking(tx)
    }

    async fn stats(&self) -> Result<GraphStats> {
        Ok(self.compute_stats())
    }
}

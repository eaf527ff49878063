// src/persistor.rs - Schema-checked, retried graph commits

use crate::error::Result;
use crate::graph::{Candidates, GraphItem};
use crate::retry::RetryPolicy;
use crate::schema::GraphSchema;
use crate::storage::{CommitOutcome, DeadLetter, DeadLetterPayload, DeadLetterQueue, GraphStore, GraphTransaction};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of persisting one batch of candidates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOutcome {
    pub commit: CommitOutcome,
    /// Items dropped for violating the schema
    pub schema_violations: usize,
    /// Items written to the dead-letter queue
    pub parked: usize,
}

pub struct GraphPersistor {
    store: Arc<dyn GraphStore>,
    schema: Arc<GraphSchema>,
    dead_letters: Arc<DeadLetterQueue>,
    retry: RetryPolicy,
}

impl GraphPersistor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        schema: Arc<GraphSchema>,
        dead_letters: Arc<DeadLetterQueue>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, schema, dead_letters, retry }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    /// Validate and commit `candidates` as one transaction.
    ///
    /// Schema violations are parked and the rest proceeds. A store that stays
    /// unavailable after the retry budget gets the whole transaction parked.
    pub async fn persist(&self, candidates: Candidates) -> Result<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        let mut letters = Vec::new();
        let mut valid = Candidates::default();

        for mut entity in candidates.entities {
            match self.schema.validate_entity(&mut entity) {
                Ok(()) => valid.entities.push(entity),
                Err(e) => {
                    warn!("Dropping {}: {}", entity.entity_key(), e);
                    outcome.schema_violations += 1;
                    letters.push(violation(e.to_string(), GraphItem::Entity(entity)));
                }
            }
        }
        for mut relation in candidates.relations {
            match self.schema.validate_relation(&mut relation) {
                Ok(()) => valid.relations.push(relation),
                Err(e) => {
                    warn!("Dropping {}: {}", relation.relation_key(), e);
                    outcome.schema_violations += 1;
                    letters.push(violation(e.to_string(), GraphItem::Relation(relation)));
                }
            }
        }

        if !valid.is_empty() {
            let relations = valid.relations.clone();
            let tx = GraphTransaction::new(valid);
            let tx_id = tx.id;
            let store = &self.store;

            let committed = self.retry.run("graph commit", || store.commit(tx.clone())).await;
            match committed {
                Ok(commit) => {
                    if !commit.relations_refused.is_empty() {
                        let refused: Vec<GraphItem> = relations
                            .into_iter()
                            .filter(|r| commit.relations_refused.contains(&r.relation_key()))
                            .map(GraphItem::Relation)
                            .collect();
                        warn!("Transaction {} refused {} relations without endpoints", tx_id, refused.len());
                        letters.push(DeadLetter::new("missing-endpoint", DeadLetterPayload::Graph { items: refused }));
                    }
                    outcome.commit = commit;
                }
                Err(e) if e.is_transient() => {
                    error!("Parking graph transaction {}: {}", tx_id, e);
                    let items: Vec<GraphItem> = Candidates { entities: tx.entities, relations: tx.relations }
                        .into_items()
                        .collect();
                    letters.push(DeadLetter::new(e.to_string(), DeadLetterPayload::Graph { items }));
                }
                Err(e) => return Err(e),
            }
        }

        outcome.parked = letters
            .iter()
            .map(|l| match &l.payload {
                DeadLetterPayload::Graph { items } => items.len(),
                _ => 1,
            })
            .sum();
        self.dead_letters.park(&letters)?;

        debug!(
            "Persisted: {} entities and {} relations created, {} parked",
            outcome.commit.entities_created, outcome.commit.relations_created, outcome.parked
        );
        Ok(outcome)
    }

    /// Persist graph items taken from the dead-letter queue.
    pub async fn persist_items(&self, items: Vec<GraphItem>) -> Result<PersistOutcome> {
        self.persist(Candidates::from_items(items)).await
    }
}

fn violation(reason: String, item: GraphItem) -> DeadLetter {
    DeadLetter::new(
        format!("rejected-schema-violation: {}", reason),
        DeadLetterPayload::Graph { items: vec![item] },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::graph::{EntityKey, EntityType, GraphEntity, GraphRelation};
    use crate::storage::{GraphStats, InMemoryGraphStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Store failing the first N commits
    struct FlakyStore {
        inner: InMemoryGraphStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl GraphStore for FlakyStore {
        async fn commit(&self, tx: GraphTransaction) -> Result<CommitOutcome> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Err(PipelineError::TransientSink("graph store unavailable".into()));
            }
            self.inner.commit(tx).await
        }

        async fn stats(&self) -> Result<GraphStats> {
            self.inner.stats().await
        }
    }

    fn candidates() -> Candidates {
        Candidates {
            entities: vec![
                GraphEntity::new(EntityType::Asset, "A1").with_property("id", "A1"),
                GraphEntity::new(EntityType::Sensor, "T1").with_property("id", "T1"),
            ],
            relations: vec![GraphRelation::new(
                EntityKey::new(EntityType::Sensor, "T1"),
                "PART_OF",
                EntityKey::new(EntityType::Asset, "A1"),
            )],
        }
    }

    fn persistor(store: Arc<dyn GraphStore>, dir: &TempDir, attempts: u32) -> (GraphPersistor, Arc<DeadLetterQueue>) {
        let queue = Arc::new(DeadLetterQueue::open(dir.path()).unwrap());
        let persistor = GraphPersistor::new(
            store,
            Arc::new(GraphSchema::default()),
            queue.clone(),
            RetryPolicy::immediate(attempts),
        );
        (persistor, queue)
    }

    #[tokio::test]
    async fn test_replay_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryGraphStore::new());
        let (persistor, _) = persistor(store.clone(), &dir, 3);

        let first = persistor.persist(candidates()).await.unwrap();
        assert_eq!(first.commit.entities_created, 2);
        assert_eq!(first.commit.relations_created, 1);

        for _ in 0..3 {
            let again = persistor.persist(candidates()).await.unwrap();
            assert_eq!(again.commit.entities_created, 0);
            assert_eq!(again.commit.relations_created, 0);
        }
        assert_eq!(store.entity_count(), 2);
    }

    #[tokio::test]
    async fn test_schema_violations_parked_rest_commits() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryGraphStore::new());
        let (persistor, queue) = persistor(store.clone(), &dir, 3);

        let mut batch = candidates();
        batch.entities.push(GraphEntity::new(EntityType::Event, "T1:enter-high:1000"));
        batch.relations.push(GraphRelation::new(
            EntityKey::new(EntityType::Asset, "A1"),
            "OWNS",
            EntityKey::new(EntityType::Sensor, "T1"),
        ));

        let outcome = persistor.persist(batch).await.unwrap();
        assert_eq!(outcome.schema_violations, 2);
        assert_eq!(outcome.parked, 2);
        assert_eq!(outcome.commit.entities_created, 2);
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_relation_without_endpoint_is_parked() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryGraphStore::new());
        let (persistor, queue) = persistor(store.clone(), &dir, 3);

        let mut batch = candidates();
        batch.entities.remove(0);
        let outcome = persistor.persist(batch).await.unwrap();
        assert_eq!(outcome.commit.relations_refused.len(), 1);
        assert_eq!(store.relation_count(), 0);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_then_parked() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyStore { inner: InMemoryGraphStore::new(), failures: AtomicUsize::new(2) });
        let (persistor, queue) = persistor(flaky.clone(), &dir, 3);

        let outcome = persistor.persist(candidates()).await.unwrap();
        assert_eq!(outcome.commit.entities_created, 2);
        assert_eq!(outcome.parked, 0);

        flaky.failures.store(5, Ordering::SeqCst);
        let mut batch = candidates();
        batch.entities.push(GraphEntity::new(EntityType::Asset, "A2").with_property("id", "A2"));
        let parked = persistor.persist(batch).await.unwrap();
        assert_eq!(parked.parked, 4);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(flaky.inner.entity_count(), 2);
    }
}

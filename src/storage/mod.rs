// src/storage/mod.rs - Durable state: alarm WAL, dead letters, graph store

pub mod dead_letter;
pub mod graph_store;
pub mod wal;

pub use dead_letter::{DeadLetter, DeadLetterPayload, DeadLetterQueue, DrainedFile};
pub use graph_store::{CommitOutcome, GraphStats, GraphStore, GraphTransaction, InMemoryGraphStore};
pub use wal::{WalEntry, WalStateStore, WriteAheadLog};

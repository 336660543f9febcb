//! crates/story_engine_core/src/memory.rs
//!
//! An in-process implementation of the `RecordStore` port.
//!
//! Transactions are serialized: `begin` takes the store lock for the lifetime of
//! the transaction and works on a private copy of the tables, which replaces the
//! shared tables only on commit. That is stricter than the read-committed
//! isolation the engine requires, so anything that passes here relies only on
//! guarantees a real store also gives.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{new_record_id, Collection, Fields, Record};
use crate::filter::{parse_filter, Sort};
use crate::ports::{Clock, PortError, PortResult, RecordStore, RecordTx};

#[derive(Debug, Clone, Default)]
struct Tables {
    // A collection is provisioned iff it has an entry.
    rows: BTreeMap<Collection, Vec<Record>>,
}

impl Tables {
    fn rows(&self, collection: Collection) -> PortResult<&Vec<Record>> {
        self.rows
            .get(&collection)
            .ok_or_else(|| PortError::MissingCollection(collection.to_string()))
    }

    fn rows_mut(&mut self, collection: Collection) -> PortResult<&mut Vec<Record>> {
        self.rows
            .get_mut(&collection)
            .ok_or_else(|| PortError::MissingCollection(collection.to_string()))
    }

    fn check_unique(&self, candidate: &Record) -> PortResult<()> {
        let keys = candidate.collection.unique_keys();
        if keys.is_empty() {
            return Ok(());
        }
        let clash = self.rows(candidate.collection)?.iter().any(|existing| {
            existing.id != candidate.id
                && keys
                    .iter()
                    .all(|k| existing.data.get(*k) == candidate.data.get(*k))
        });
        if clash {
            return Err(PortError::Conflict(format!(
                "{} ({})",
                candidate.collection,
                keys.join(", ")
            )));
        }
        Ok(())
    }
}

/// A `RecordStore` backed by process memory.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// A store with every known collection provisioned.
    pub fn provisioned(clock: Arc<dyn Clock>) -> Self {
        Self::with_collections(clock, Collection::ALL)
    }

    /// A store where only `collections` exist; the rest report `MissingCollection`.
    pub fn with_collections(
        clock: Arc<dyn Clock>,
        collections: impl IntoIterator<Item = Collection>,
    ) -> Self {
        let rows = collections.into_iter().map(|c| (c, Vec::new())).collect();
        Self {
            tables: Arc::new(Mutex::new(Tables { rows })),
            clock,
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self) -> PortResult<Box<dyn RecordTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            clock: self.clock.clone(),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl RecordTx for MemoryTx {
    async fn find_by_id(&mut self, collection: Collection, id: &str) -> PortResult<Record> {
        self.working
            .rows(collection)?
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("{collection} {id}")))
    }

    async fn find_by_filter(
        &mut self,
        collection: Collection,
        filter: &str,
        sort: &str,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<Record>> {
        let expr = parse_filter(filter)?;
        let sort = Sort::parse(sort)?;
        let mut matched: Vec<Record> = self
            .working
            .rows(collection)?
            .iter()
            .filter(|r| expr.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| sort.compare(a, b));
        // A zero limit means "no limit".
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&mut self, collection: Collection, filter: &str) -> PortResult<u64> {
        let expr = parse_filter(filter)?;
        let n = self
            .working
            .rows(collection)?
            .iter()
            .filter(|r| expr.matches(r))
            .count();
        Ok(n as u64)
    }

    async fn create(&mut self, collection: Collection, data: Fields) -> PortResult<Record> {
        let now = self.clock.now();
        let record = Record {
            id: new_record_id(),
            collection,
            data,
            created: now,
            updated: now,
        };
        self.working.check_unique(&record)?;
        self.working.rows_mut(collection)?.push(record.clone());
        Ok(record)
    }

    async fn update(&mut self, record: &Record, data: Fields) -> PortResult<Record> {
        let now = self.clock.now();
        let mut updated = self.find_by_id(record.collection, &record.id).await?;
        updated.data.extend(data);
        updated.updated = now;
        self.working.check_unique(&updated)?;
        let rows = self.working.rows_mut(record.collection)?;
        if let Some(slot) = rows.iter_mut().find(|r| r.id == record.id) {
            *slot = updated.clone();
        }
        Ok(updated)
    }

    async fn delete(&mut self, record: &Record) -> PortResult<()> {
        let rows = self.working.rows_mut(record.collection)?;
        let before = rows.len();
        rows.retain(|r| r.id != record.id);
        if rows.len() == before {
            return Err(PortError::NotFound(format!(
                "{} {}",
                record.collection, record.id
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> PortResult<()> {
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}

//! crates/story_engine_core/src/ports.rs
//!
//! Defines the service contracts (traits) the engine depends on.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete record store and of wall-clock time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use crate::domain::{Collection, Fields, Record};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors of the backing store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Collection not provisioned: {0}")]
    MissingCollection(String),
    #[error("Unique constraint violated: {0}")]
    Conflict(String),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    /// True for the "prerequisite data is missing" branch of the error taxonomy,
    /// which callers treat as a silent no-op.
    pub fn is_missing(&self) -> bool {
        matches!(self, PortError::NotFound(_) | PortError::MissingCollection(_))
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Maps `NotFound`/`MissingCollection` to `Ok(None)`, passing other errors through.
pub fn optional<T>(result: PortResult<T>) -> PortResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_missing() => Ok(None),
        Err(e) => Err(e),
    }
}

//=========================================================================================
// Record Store Ports (Traits)
//=========================================================================================

/// A transaction-scoped handle on the record store.
///
/// Dropping the handle without calling [`RecordTx::commit`] rolls back every write.
/// A row read through [`RecordTx::find_by_id`] is held against concurrent writers
/// until the transaction ends, which makes read-modify-write of that row safe.
#[async_trait]
pub trait RecordTx: Send {
    async fn find_by_id(&mut self, collection: Collection, id: &str) -> PortResult<Record>;

    /// Lists rows matching `filter`, ordered by `sort` (e.g. `"-created"`).
    async fn find_by_filter(
        &mut self,
        collection: Collection,
        filter: &str,
        sort: &str,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<Record>>;

    async fn count(&mut self, collection: Collection, filter: &str) -> PortResult<u64>;

    async fn create(&mut self, collection: Collection, data: Fields) -> PortResult<Record>;

    /// Merges `data` into the stored fields of `record`.
    async fn update(&mut self, record: &Record, data: Fields) -> PortResult<Record>;

    async fn delete(&mut self, record: &Record) -> PortResult<()>;

    async fn commit(self: Box<Self>) -> PortResult<()>;

    /// First row matching `filter`, if any.
    async fn find_first(
        &mut self,
        collection: Collection,
        filter: &str,
    ) -> PortResult<Option<Record>> {
        Ok(self
            .find_by_filter(collection, filter, "", 1, 0)
            .await?
            .into_iter()
            .next())
    }
}

/// The external transactional record store.
///
/// The non-transactional helpers each run inside their own short transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> PortResult<Box<dyn RecordTx>>;

    async fn find_by_id(&self, collection: Collection, id: &str) -> PortResult<Record> {
        let mut tx = self.begin().await?;
        let record = tx.find_by_id(collection, id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn find_by_filter(
        &self,
        collection: Collection,
        filter: &str,
        sort: &str,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<Record>> {
        let mut tx = self.begin().await?;
        let records = tx
            .find_by_filter(collection, filter, sort, limit, offset)
            .await?;
        tx.commit().await?;
        Ok(records)
    }

    async fn count(&self, collection: Collection, filter: &str) -> PortResult<u64> {
        let mut tx = self.begin().await?;
        let n = tx.count(collection, filter).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn create(&self, collection: Collection, data: Fields) -> PortResult<Record> {
        let mut tx = self.begin().await?;
        let record = tx.create(collection, data).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn update(&self, record: &Record, data: Fields) -> PortResult<Record> {
        let mut tx = self.begin().await?;
        let updated = tx.update(record, data).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete(&self, record: &Record) -> PortResult<()> {
        let mut tx = self.begin().await?;
        tx.delete(record).await?;
        tx.commit().await
    }
}

//=========================================================================================
// Clock Port
//=========================================================================================

/// Source of wall-clock time for dedup windows and streak dates.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

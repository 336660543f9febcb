//! Shared fixtures for the engine integration tests.

#![allow(dead_code)] // Not every test binary uses every helper.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use story_engine_core::{
    fields, Clock, Collection, EngineSettings, EventRouter, Fields, ManualClock, MemoryStore,
    PortError, PortResult, Record, RecordStore, RecordTx, RequestContext,
};

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn RecordStore>,
    pub router: EventRouter,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("story_engine_core=debug")
        .try_init();
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::provisioned)
    }

    pub fn with_store(build: impl FnOnce(Arc<dyn Clock>) -> MemoryStore) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap(),
        ));
        let store: Arc<dyn RecordStore> = Arc::new(build(clock.clone()));
        let router = EventRouter::standard(
            store.clone(),
            clock.clone(),
            Arc::new(EngineSettings::default()),
        );
        Self {
            clock,
            store,
            router,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Inserts a row directly, bypassing reactions.
    pub async fn seed(&self, collection: Collection, data: Fields) -> Record {
        self.store.create(collection, data).await.unwrap()
    }

    pub async fn story(&self) -> Record {
        self.seed(
            Collection::Stories,
            fields([
                ("title", json!("The Rabbit and the Tiger")),
                ("view_count", json!(0)),
                ("has_sticker", json!(false)),
            ]),
        )
        .await
    }

    pub async fn sticker_story(&self) -> Record {
        self.seed(
            Collection::Stories,
            fields([("title", json!("Heungbu")), ("has_sticker", json!(true))]),
        )
        .await
    }

    pub async fn chapter(&self, story: &Record, number: i64, is_free: bool) -> Record {
        self.seed(
            Collection::Chapters,
            fields([
                ("story", json!(story.id)),
                ("chapter_number", json!(number)),
                ("is_free", json!(is_free)),
            ]),
        )
        .await
    }

    pub async fn level_stickers(&self) {
        for level in 1..=18 {
            self.seed(
                Collection::Stickers,
                fields([
                    ("type", json!("level")),
                    ("key", json!(format!("level_{level}"))),
                    ("level", json!(level)),
                ]),
            )
            .await;
        }
    }

    pub async fn story_sticker(&self, story: &Record) -> Record {
        self.seed(
            Collection::Stickers,
            fields([
                ("type", json!("story")),
                ("key", json!(format!("story_{}", story.id))),
                ("story", json!(story.id)),
            ]),
        )
        .await
    }

    /// Creates a row through the router so its reactions run.
    pub async fn create(&self, collection: Collection, data: Fields) -> Record {
        self.router
            .create(&RequestContext::default(), collection, data)
            .await
            .unwrap()
    }

    pub async fn update(&self, record: &Record, data: Fields) -> Record {
        self.router
            .update(record.collection, &record.id, data)
            .await
            .unwrap()
    }

    pub async fn delete(&self, record: &Record) {
        self.router
            .delete(record.collection, &record.id)
            .await
            .unwrap();
    }

    pub async fn reload(&self, record: &Record) -> Record {
        self.store
            .find_by_id(record.collection, &record.id)
            .await
            .unwrap()
    }

    pub async fn field(&self, record: &Record, name: &str) -> Value {
        self.reload(record)
            .await
            .data
            .get(name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub async fn count(&self, collection: Collection, filter: &str) -> u64 {
        self.store.count(collection, filter).await.unwrap()
    }
}

/// Wraps a store so that `create` on one collection fails with `error`, for
/// the next `remaining` calls.
pub struct FailingCreates {
    pub inner: Arc<dyn RecordStore>,
    pub collection: Collection,
    pub error: PortError,
    pub remaining: Arc<AtomicUsize>,
}

impl FailingCreates {
    pub fn new(
        inner: Arc<dyn RecordStore>,
        collection: Collection,
        error: PortError,
        times: usize,
    ) -> Self {
        Self {
            inner,
            collection,
            error,
            remaining: Arc::new(AtomicUsize::new(times)),
        }
    }

    /// How many injected failures have not fired yet.
    pub fn pending(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FailingCreates {
    async fn begin(&self) -> PortResult<Box<dyn RecordTx>> {
        Ok(Box::new(FailingCreatesTx {
            inner: self.inner.begin().await?,
            collection: self.collection,
            error: self.error.clone(),
            remaining: self.remaining.clone(),
        }))
    }
}

struct FailingCreatesTx {
    inner: Box<dyn RecordTx>,
    collection: Collection,
    error: PortError,
    remaining: Arc<AtomicUsize>,
}

#[async_trait]
impl RecordTx for FailingCreatesTx {
    async fn find_by_id(&mut self, collection: Collection, id: &str) -> PortResult<Record> {
        self.inner.find_by_id(collection, id).await
    }

    async fn find_by_filter(
        &mut self,
        collection: Collection,
        filter: &str,
        sort: &str,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<Record>> {
        self.inner
            .find_by_filter(collection, filter, sort, limit, offset)
            .await
    }

    async fn count(&mut self, collection: Collection, filter: &str) -> PortResult<u64> {
        self.inner.count(collection, filter).await
    }

    async fn create(&mut self, collection: Collection, data: Fields) -> PortResult<Record> {
        let fire = collection == self.collection
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fire {
            return Err(self.error.clone());
        }
        self.inner.create(collection, data).await
    }

    async fn update(&mut self, record: &Record, data: Fields) -> PortResult<Record> {
        self.inner.update(record, data).await
    }

    async fn delete(&mut self, record: &Record) -> PortResult<()> {
        self.inner.delete(record).await
    }

    async fn commit(self: Box<Self>) -> PortResult<()> {
        self.inner.commit().await
    }
}

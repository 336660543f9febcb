//! crates/story_engine_core/src/router.rs
//!
//! The mutation event router.
//!
//! Each (collection, phase) pair owns an ordered list of post-commit
//! [`Reaction`]s. The router persists the user's mutation first, commits it, and
//! only then runs the reactions. A failing reaction is logged and the next one
//! still runs; none of them can fail or roll back the mutation itself.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::{Collection, Fields, Record};
use crate::ports::{PortResult, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Create,
    Update,
    Delete,
}

/// A committed mutation of one record.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub collection: Collection,
    pub phase: Phase,
    /// The row after the mutation; for deletes, the row as it was deleted.
    pub record: Record,
    /// The row before an update.
    pub original: Option<Record>,
}

impl MutationEvent {
    /// Distinct non-empty values of `field` before and after the mutation.
    pub fn references(&self, field: &str) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(2);
        let before = self.original.as_ref().map(|r| r.get_str(field));
        for id in before.into_iter().chain([self.record.get_str(field)]) {
            if !id.is_empty() && !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

/// Request-scoped facts a pre-commit hook may need.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub auth_user: Option<String>,
}

/// Work done after a mutation has committed.
#[async_trait]
pub trait Reaction: Send + Sync {
    fn name(&self) -> &'static str;

    async fn react(&self, event: &MutationEvent) -> PortResult<()>;
}

/// Adjusts the fields of a record before it is first persisted.
pub trait PreCommitHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_create(&self, ctx: &RequestContext, data: &mut Fields) -> PortResult<()>;
}

pub struct EventRouter {
    store: Arc<dyn RecordStore>,
    reactions: HashMap<(Collection, Phase), Vec<Arc<dyn Reaction>>>,
    pre_create: HashMap<Collection, Vec<Arc<dyn PreCommitHook>>>,
}

impl EventRouter {
    /// A router with no reactions registered.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            reactions: HashMap::new(),
            pre_create: HashMap::new(),
        }
    }

    /// Appends `reaction` to the list for `collection` and each of `phases`.
    pub fn on(
        mut self,
        collection: Collection,
        phases: &[Phase],
        reaction: Arc<dyn Reaction>,
    ) -> Self {
        for phase in phases {
            self.reactions
                .entry((collection, *phase))
                .or_default()
                .push(reaction.clone());
        }
        self
    }

    pub fn before_create(mut self, collection: Collection, hook: Arc<dyn PreCommitHook>) -> Self {
        self.pre_create.entry(collection).or_default().push(hook);
        self
    }

    /// Names of the reactions for a (collection, phase), in execution order.
    pub fn reaction_names(&self, collection: Collection, phase: Phase) -> Vec<&'static str> {
        self.reactions
            .get(&(collection, phase))
            .map(|list| list.iter().map(|r| r.name()).collect())
            .unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Persists a new record, then runs its create reactions.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        collection: Collection,
        mut data: Fields,
    ) -> PortResult<Record> {
        for hook in self.pre_create.get(&collection).into_iter().flatten() {
            hook.before_create(ctx, &mut data)?;
        }
        let record = self.store.create(collection, data).await?;
        self.dispatch(&MutationEvent {
            collection,
            phase: Phase::Create,
            record: record.clone(),
            original: None,
        })
        .await;
        Ok(record)
    }

    /// Merges `data` into the record, then runs update reactions with both snapshots.
    pub async fn update(
        &self,
        collection: Collection,
        id: &str,
        data: Fields,
    ) -> PortResult<Record> {
        let mut tx = self.store.begin().await?;
        let original = tx.find_by_id(collection, id).await?;
        let record = tx.update(&original, data).await?;
        tx.commit().await?;
        self.dispatch(&MutationEvent {
            collection,
            phase: Phase::Update,
            record: record.clone(),
            original: Some(original),
        })
        .await;
        Ok(record)
    }

    /// Deletes the record, then runs delete reactions with the removed row.
    pub async fn delete(&self, collection: Collection, id: &str) -> PortResult<Record> {
        let mut tx = self.store.begin().await?;
        let record = tx.find_by_id(collection, id).await?;
        tx.delete(&record).await?;
        tx.commit().await?;
        self.dispatch(&MutationEvent {
            collection,
            phase: Phase::Delete,
            record: record.clone(),
            original: None,
        })
        .await;
        Ok(record)
    }

    /// Runs the reactions registered for an already-committed mutation.
    pub async fn dispatch(&self, event: &MutationEvent) {
        let Some(reactions) = self.reactions.get(&(event.collection, event.phase)) else {
            return;
        };
        for reaction in reactions {
            match reaction.react(event).await {
                Ok(()) => debug!(
                    reaction = reaction.name(),
                    record = %event.record.id,
                    "reaction complete"
                ),
                Err(e) => error!(
                    reaction = reaction.name(),
                    collection = %event.collection,
                    phase = ?event.phase,
                    record = %event.record.id,
                    "post-commit reaction failed: {e}"
                ),
            }
        }
    }
}

//! crates/story_engine_core/src/reactions.rs
//!
//! The standard reactions and the router wiring that binds them to leaf records.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Collection, Fields};
use crate::engine::progression::is_completion_transition;
use crate::engine::{Aggregates, DedupFilter, ProgressionEngine};
use crate::ports::{Clock, PortResult, RecordStore};
use crate::router::{EventRouter, MutationEvent, Phase, PreCommitHook, Reaction, RequestContext};
use crate::settings::EngineSettings;

const ALL_PHASES: &[Phase] = &[Phase::Create, Phase::Update, Phase::Delete];

/// Runs `f` for every id, keeping going after a failure and returning the first error.
async fn for_each_id<F, Fut, T>(ids: Vec<String>, f: F) -> PortResult<()>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = PortResult<T>>,
{
    let mut first_error = None;
    for id in ids {
        if let Err(e) = f(id).await {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// views/create: deduplicate, then bump `view_count`.
pub struct ViewCountReaction {
    pub dedup: DedupFilter,
    pub aggregates: Aggregates,
}

#[async_trait]
impl Reaction for ViewCountReaction {
    fn name(&self) -> &'static str {
        "view_count"
    }

    async fn react(&self, event: &MutationEvent) -> PortResult<()> {
        let story_id = event.record.get_str("story");
        if story_id.is_empty() {
            return Ok(());
        }
        if self.dedup.is_duplicate(&event.record, story_id).await {
            debug!(view = %event.record.id, story = story_id, "duplicate view, not counted");
            return Ok(());
        }
        self.aggregates.increment_view_count(story_id).await
    }
}

/// reviews/*: recompute the rating of every story the review touched.
pub struct RatingReaction {
    pub aggregates: Aggregates,
}

#[async_trait]
impl Reaction for RatingReaction {
    fn name(&self) -> &'static str {
        "story_rating"
    }

    async fn react(&self, event: &MutationEvent) -> PortResult<()> {
        for_each_id(event.references("story"), |id| async move {
            self.aggregates.recompute_rating(&id).await
        })
        .await
    }
}

/// bookmarks/*: recompute favorite and bookmark counts for old and new story.
pub struct BookmarkCountsReaction {
    pub aggregates: Aggregates,
}

#[async_trait]
impl Reaction for BookmarkCountsReaction {
    fn name(&self) -> &'static str {
        "story_bookmark_counts"
    }

    async fn react(&self, event: &MutationEvent) -> PortResult<()> {
        for_each_id(event.references("story"), |id| async move {
            self.aggregates.recompute_bookmark_counts(&id).await
        })
        .await
    }
}

/// chapter_audios/*: recompute `has_audio` for the owning story.
pub struct AudioAvailabilityReaction {
    pub aggregates: Aggregates,
}

#[async_trait]
impl Reaction for AudioAvailabilityReaction {
    fn name(&self) -> &'static str {
        "story_has_audio"
    }

    async fn react(&self, event: &MutationEvent) -> PortResult<()> {
        for_each_id(event.references("chapter"), |id| async move {
            self.aggregates.recompute_has_audio(&id).await
        })
        .await
    }
}

/// reading_progress/create,update: progression on the false→true completion edge.
pub struct ChapterCompletionReaction {
    pub engine: ProgressionEngine,
}

#[async_trait]
impl Reaction for ChapterCompletionReaction {
    fn name(&self) -> &'static str {
        "chapter_completion"
    }

    async fn react(&self, event: &MutationEvent) -> PortResult<()> {
        if !is_completion_transition(event.original.as_ref(), &event.record) {
            return Ok(());
        }
        self.engine.process_chapter_completed(&event.record).await?;
        Ok(())
    }
}

/// Sets `user` to the authenticated identity, when there is one.
pub struct AuthorFromRequest;

impl PreCommitHook for AuthorFromRequest {
    fn name(&self) -> &'static str {
        "author_from_request"
    }

    fn before_create(&self, ctx: &RequestContext, data: &mut Fields) -> PortResult<()> {
        if let Some(user) = ctx.auth_user.as_deref().filter(|u| !u.is_empty()) {
            data.insert("user".to_string(), json!(user));
        }
        Ok(())
    }
}

impl EventRouter {
    /// The router with every standard reaction bound in its fixed order.
    pub fn standard(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        let aggregates = Aggregates::new(store.clone(), settings.clone());
        let dedup = DedupFilter::new(store.clone(), clock.clone(), settings.view_dedup_window);
        let engine = ProgressionEngine::new(store.clone(), clock, settings);

        EventRouter::new(store)
            .on(
                Collection::Views,
                &[Phase::Create],
                Arc::new(ViewCountReaction {
                    dedup,
                    aggregates: aggregates.clone(),
                }),
            )
            .on(
                Collection::Reviews,
                ALL_PHASES,
                Arc::new(RatingReaction {
                    aggregates: aggregates.clone(),
                }),
            )
            .on(
                Collection::Bookmarks,
                ALL_PHASES,
                Arc::new(BookmarkCountsReaction {
                    aggregates: aggregates.clone(),
                }),
            )
            .on(
                Collection::ChapterAudios,
                ALL_PHASES,
                Arc::new(AudioAvailabilityReaction { aggregates }),
            )
            .on(
                Collection::ReadingProgress,
                &[Phase::Create, Phase::Update],
                Arc::new(ChapterCompletionReaction { engine }),
            )
            .before_create(Collection::Reports, Arc::new(AuthorFromRequest))
    }
}

//! Derived fields on stories.
//!
//! `view_count` is adjusted by an atomic delta. Ratings, favorite/bookmark
//! counts and `has_audio` are recomputed from the current leaf rows every time,
//! so updates and deletes cannot drift them. Each call is one transaction
//! against one story, and a story that does not exist is silently skipped.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{fields, BookmarkKind, Collection, Record};
use crate::filter::{any_of, eq};
use crate::ports::{optional, PortResult, RecordStore, RecordTx};
use crate::settings::EngineSettings;

/// Rating summary written back to a story.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingSummary {
    pub average_rating: Option<f64>,
    pub review_count: usize,
}

impl RatingSummary {
    pub fn from_ratings(ratings: &[f64]) -> Self {
        if ratings.is_empty() {
            return Self {
                average_rating: None,
                review_count: 0,
            };
        }
        let total: f64 = ratings.iter().sum();
        Self {
            average_rating: Some(total / ratings.len() as f64),
            review_count: ratings.len(),
        }
    }
}

/// Favorite and bookmark tallies, counted in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BookmarkCounts {
    pub favorite_count: u64,
    pub bookmark_count: u64,
}

impl BookmarkCounts {
    pub fn tally<'a>(rows: impl IntoIterator<Item = &'a Record>) -> Self {
        rows.into_iter()
            .fold(Self::default(), |mut counts, row| {
                match BookmarkKind::parse(row.get_str("type")) {
                    Some(BookmarkKind::Favorite) => counts.favorite_count += 1,
                    Some(BookmarkKind::Bookmark) => counts.bookmark_count += 1,
                    Some(BookmarkKind::ReadLater) | None => {}
                }
                counts
            })
    }
}

#[derive(Clone)]
pub struct Aggregates {
    store: Arc<dyn RecordStore>,
    settings: Arc<EngineSettings>,
}

async fn load_story(tx: &mut dyn RecordTx, story_id: &str) -> PortResult<Option<Record>> {
    let story = optional(tx.find_by_id(Collection::Stories, story_id).await)?;
    if story.is_none() {
        debug!(story = story_id, "story missing, skipping aggregate update");
    }
    Ok(story)
}

impl Aggregates {
    pub fn new(store: Arc<dyn RecordStore>, settings: Arc<EngineSettings>) -> Self {
        Self { store, settings }
    }

    /// Adds one to `view_count`.
    pub async fn increment_view_count(&self, story_id: &str) -> PortResult<()> {
        if story_id.is_empty() {
            return Ok(());
        }
        let mut tx = self.store.begin().await?;
        let Some(story) = load_story(tx.as_mut(), story_id).await? else {
            return Ok(());
        };
        let next = story.get_i64("view_count") + 1;
        tx.update(&story, fields([("view_count", json!(next))]))
            .await?;
        tx.commit().await
    }

    /// Recomputes `average_rating` and `review_count` from every review of the story.
    pub async fn recompute_rating(&self, story_id: &str) -> PortResult<Option<RatingSummary>> {
        if story_id.is_empty() {
            return Ok(None);
        }
        let mut tx = self.store.begin().await?;
        let Some(story) = load_story(tx.as_mut(), story_id).await? else {
            return Ok(None);
        };
        let Some(reviews) = optional(
            tx.find_by_filter(
                Collection::Reviews,
                &eq("story", story_id),
                "-created",
                self.settings.review_page_limit,
                0,
            )
            .await,
        )?
        else {
            return Ok(None);
        };

        let ratings: Vec<f64> = reviews.iter().map(|r| r.get_f64("rating")).collect();
        let summary = RatingSummary::from_ratings(&ratings);
        let average = summary.average_rating.map(|a| json!(a)).unwrap_or(Value::Null);
        tx.update(
            &story,
            fields([
                ("average_rating", average),
                ("review_count", json!(summary.review_count)),
            ]),
        )
        .await?;
        tx.commit().await?;
        Ok(Some(summary))
    }

    /// Recomputes `favorite_count` and `bookmark_count` from the story's bookmark rows.
    pub async fn recompute_bookmark_counts(
        &self,
        story_id: &str,
    ) -> PortResult<Option<BookmarkCounts>> {
        if story_id.is_empty() {
            return Ok(None);
        }
        let mut tx = self.store.begin().await?;
        let Some(story) = load_story(tx.as_mut(), story_id).await? else {
            return Ok(None);
        };
        let Some(rows) = optional(
            tx.find_by_filter(
                Collection::Bookmarks,
                &eq("story", story_id),
                "",
                self.settings.bookmark_page_limit,
                0,
            )
            .await,
        )?
        else {
            return Ok(None);
        };

        let counts = BookmarkCounts::tally(&rows);
        tx.update(
            &story,
            fields([
                ("favorite_count", json!(counts.favorite_count)),
                ("bookmark_count", json!(counts.bookmark_count)),
            ]),
        )
        .await?;
        tx.commit().await?;
        Ok(Some(counts))
    }

    /// Recomputes `has_audio` for the story owning `chapter_id`.
    pub async fn recompute_has_audio(&self, chapter_id: &str) -> PortResult<Option<bool>> {
        if chapter_id.is_empty() {
            return Ok(None);
        }
        let mut tx = self.store.begin().await?;
        let Some(chapter) = optional(tx.find_by_id(Collection::Chapters, chapter_id).await)? else {
            debug!(chapter = chapter_id, "chapter missing, skipping has_audio");
            return Ok(None);
        };
        let story_id = chapter.get_str("story").to_string();
        if story_id.is_empty() {
            return Ok(None);
        }

        let chapters = tx
            .find_by_filter(
                Collection::Chapters,
                &eq("story", &story_id),
                "chapter_number",
                self.settings.chapter_page_limit,
                0,
            )
            .await?;
        let has_audio = if chapters.is_empty() {
            false
        } else {
            let filter = any_of(chapters.iter().map(|ch| eq("chapter", &ch.id)));
            // Existence check only: one row is enough.
            optional(
                tx.find_by_filter(Collection::ChapterAudios, &filter, "-created", 1, 0)
                    .await,
            )?
            .is_some_and(|audios| !audios.is_empty())
        };

        let Some(story) = load_story(tx.as_mut(), &story_id).await? else {
            return Ok(None);
        };
        tx.update(&story, fields([("has_audio", json!(has_audio))]))
            .await?;
        tx.commit().await?;
        Ok(Some(has_audio))
    }
}

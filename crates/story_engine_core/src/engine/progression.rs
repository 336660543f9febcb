//! User progression: XP, levels, daily streaks and story completion.
//!
//! Runs once per completed chapter (a `reading_progress` row entering
//! `is_completed = true`). The stats row, the completion ledger and any unlocks
//! are written in a single transaction.

use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{fields, Collection, Record, StickerSelector, UnlockSource, UserStats};
use crate::engine::unlock::{self, UnlockOutcome};
use crate::filter::{all_of, eq};
use crate::ports::{optional, Clock, PortError, PortResult, RecordStore, RecordTx};
use crate::settings::EngineSettings;

pub const XP_CHAPTER_READ: f64 = 10.0;
/// Reading plus a completed listening session of the same chapter.
pub const XP_CHAPTER_LISTEN: f64 = 15.0;
pub const XP_STORY_BONUS: f64 = 50.0;

pub const MAX_LEVEL: u32 = 18;

/// A concurrent first insert of the same user's stats row loses with `Conflict`;
/// the retry then sees the winner's row.
const COMPLETION_ATTEMPTS: u32 = 2;

/// Minimum total XP for level `index + 1`.
pub const LEVEL_THRESHOLDS: [f64; MAX_LEVEL as usize] = [
    0.0, 100.0, 250.0, 500.0, 1000.0, 1750.0, 2500.0, 3500.0, 5000.0, 6500.0, 8500.0, 11000.0,
    14000.0, 17500.0, 21500.0, 26000.0, 31000.0, 37000.0,
];

/// The highest level whose threshold is at or below `total_xp`.
pub fn level_for_xp(total_xp: f64) -> u32 {
    let reached = LEVEL_THRESHOLDS
        .iter()
        .rposition(|threshold| total_xp >= *threshold)
        .map_or(1, |idx| idx as u32 + 1);
    reached.min(MAX_LEVEL)
}

/// Streak length after activity on `today`.
pub fn next_streak(last_activity: Option<NaiveDate>, streak_days: u32, today: NaiveDate) -> u32 {
    match last_activity {
        None => 1,
        Some(last) if last == today => streak_days,
        Some(last) if Some(last) == today.pred_opt() => streak_days + 1,
        Some(_) => 1,
    }
}

/// True when a `reading_progress` mutation is the one that completes the chapter.
pub fn is_completion_transition(original: Option<&Record>, current: &Record) -> bool {
    let was_completed = original.is_some_and(|r| r.get_bool("is_completed"));
    !was_completed && current.get_bool("is_completed")
}

/// What one chapter completion did to a user's progression.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressOutcome {
    pub stats: UserStats,
    pub xp_awarded: f64,
    pub listened: bool,
    pub story_completed: bool,
    pub unlocked: Vec<StickerSelector>,
}

#[derive(Clone)]
pub struct ProgressionEngine {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<EngineSettings>,
}

impl ProgressionEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Applies a completed chapter to the user's stats.
    ///
    /// Returns `None` when a prerequisite (user, chapter, story, stats
    /// collection) is missing and nothing was written.
    pub async fn process_chapter_completed(
        &self,
        progress: &Record,
    ) -> PortResult<Option<ProgressOutcome>> {
        let mut attempt = 1;
        loop {
            match self.apply_completion(progress).await {
                Err(PortError::Conflict(reason)) if attempt < COMPLETION_ATTEMPTS => {
                    warn!(progress = %progress.id, "retrying chapter completion: {reason}");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn apply_completion(&self, progress: &Record) -> PortResult<Option<ProgressOutcome>> {
        let user_id = progress.get_str("user");
        let chapter_id = progress.get_str("chapter");
        if user_id.is_empty() || chapter_id.is_empty() {
            return Ok(None);
        }

        let mut tx = self.store.begin().await?;

        let Some(chapter) = optional(tx.find_by_id(Collection::Chapters, chapter_id).await)? else {
            debug!(chapter = chapter_id, "chapter missing, skipping progression");
            return Ok(None);
        };
        let story_id = chapter.get_str("story");
        if story_id.is_empty() {
            return Ok(None);
        }
        let Some(story) = optional(tx.find_by_id(Collection::Stories, story_id).await)? else {
            debug!(story = story_id, "story missing, skipping progression");
            return Ok(None);
        };

        let listened = has_completed_listening(tx.as_mut(), user_id, chapter_id).await;

        let Some(existing) =
            optional(tx.find_first(Collection::UserStats, &eq("user", user_id)).await)?
        else {
            warn!("user_stats collection missing, skipping progression");
            return Ok(None);
        };
        let first_stats = existing.is_none();
        let mut stats = match &existing {
            Some(record) => record.decode::<UserStats>()?,
            None => UserStats::new(user_id),
        };
        let old_level = stats.level;

        let mut xp_awarded = if listened {
            XP_CHAPTER_LISTEN
        } else {
            XP_CHAPTER_READ
        };
        stats.chapters_read += 1;
        if listened {
            stats.chapters_listened += 1;
        }

        let today = self.settings.activity_date(self.clock.now());
        stats.streak_days = next_streak(stats.last_activity_date, stats.streak_days, today);
        stats.last_activity_date = Some(today);

        let mut unlocked = Vec::new();
        let story_completed = self
            .all_free_chapters_completed(tx.as_mut(), user_id, story_id)
            .await?
            && claim_story_completion(tx.as_mut(), user_id, story_id).await?;
        if story_completed {
            xp_awarded += XP_STORY_BONUS;
            stats.stories_completed += 1;
            info!(user = user_id, story = story_id, "story completed");
            if story.get_bool("has_sticker") {
                let selector = StickerSelector::Story(story_id.to_string());
                try_unlock(
                    tx.as_mut(),
                    user_id,
                    selector,
                    UnlockSource::StoryComplete,
                    &mut unlocked,
                )
                .await;
            }
        }

        stats.total_xp += xp_awarded;
        stats.level = level_for_xp(stats.total_xp);
        if stats.level > old_level {
            info!(user = user_id, level = stats.level, "level up");
            let selector = StickerSelector::Level(stats.level);
            try_unlock(tx.as_mut(), user_id, selector, UnlockSource::LevelUp, &mut unlocked).await;
        } else if first_stats {
            // Day-one users start at level 1 and never "level up" into it.
            let selector = StickerSelector::Level(1);
            try_unlock(tx.as_mut(), user_id, selector, UnlockSource::LevelUp, &mut unlocked).await;
        }

        let data = stats.to_fields()?;
        match &existing {
            Some(record) => tx.update(record, data).await?,
            None => tx.create(Collection::UserStats, data).await?,
        };
        tx.commit().await?;

        Ok(Some(ProgressOutcome {
            stats,
            xp_awarded,
            listened,
            story_completed,
            unlocked,
        }))
    }

    /// Whether the user completed every free chapter of the story.
    /// A story without free chapters never completes this way.
    async fn all_free_chapters_completed(
        &self,
        tx: &mut dyn RecordTx,
        user_id: &str,
        story_id: &str,
    ) -> PortResult<bool> {
        let free_chapters = tx
            .find_by_filter(
                Collection::Chapters,
                &all_of([eq("story", story_id), "is_free=true".to_string()]),
                "chapter_number",
                self.settings.chapter_page_limit,
                0,
            )
            .await?;
        if free_chapters.is_empty() {
            return Ok(false);
        }
        for chapter in &free_chapters {
            let done = all_of([
                eq("user", user_id),
                eq("chapter", &chapter.id),
                "is_completed=true".to_string(),
            ]);
            if tx.count(Collection::ReadingProgress, &done).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A completed listening session of the chapter by the user.
/// Any lookup failure means "no listening credit".
async fn has_completed_listening(tx: &mut dyn RecordTx, user_id: &str, chapter_id: &str) -> bool {
    let filter = all_of([
        eq("user", user_id),
        eq("chapter", chapter_id),
        "completed=true".to_string(),
    ]);
    match tx.find_first(Collection::ListeningSessions, &filter).await {
        Ok(found) => found.is_some(),
        Err(e) => {
            debug!(user = user_id, chapter = chapter_id, "no listening credit: {e}");
            false
        }
    }
}

/// Records that the completion bonus for (user, story) is paid.
/// Returns false when it already was.
async fn claim_story_completion(
    tx: &mut dyn RecordTx,
    user_id: &str,
    story_id: &str,
) -> PortResult<bool> {
    let key = all_of([eq("user", user_id), eq("story", story_id)]);
    match optional(tx.find_first(Collection::StoryCompletions, &key).await)? {
        None => {
            warn!("story_completions collection missing, completion bonus not paid");
            return Ok(false);
        }
        Some(Some(_)) => return Ok(false),
        Some(None) => {}
    }
    let row = fields([("user", json!(user_id)), ("story", json!(story_id))]);
    match tx.create(Collection::StoryCompletions, row).await {
        Ok(_) => Ok(true),
        Err(PortError::Conflict(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn try_unlock(
    tx: &mut dyn RecordTx,
    user_id: &str,
    selector: StickerSelector,
    source: UnlockSource,
    unlocked: &mut Vec<StickerSelector>,
) {
    match unlock::grant(tx, user_id, &selector, source).await {
        Ok(UnlockOutcome::Unlocked(_)) => unlocked.push(selector),
        Ok(_) => {}
        Err(e) => warn!(user = user_id, ?selector, "sticker unlock failed: {e}"),
    }
}

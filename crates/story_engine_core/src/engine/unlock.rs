//! Achievement unlock guard.
//!
//! Grants at most one `user_stickers` row per (user, sticker). The existence
//! check is only a fast path: the store's unique index on (user, sticker) is what
//! makes a concurrent duplicate grant impossible, and a `Conflict` on insert is
//! reported as [`UnlockOutcome::AlreadyHeld`].

use serde_json::json;
use tracing::debug;

use crate::domain::{fields, Collection, Record, StickerSelector, UnlockSource};
use crate::engine::progression::MAX_LEVEL;
use crate::filter::{all_of, eq};
use crate::ports::{optional, PortError, PortResult, RecordTx};

#[derive(Debug, Clone, PartialEq)]
pub enum UnlockOutcome {
    /// A new unlock row was written.
    Unlocked(Record),
    /// The user already holds this sticker.
    AlreadyHeld,
    /// The sticker (or the sticker collections) has not been provisioned yet.
    NotProvisioned,
    /// Empty user id or out-of-range level.
    Skipped,
}

fn sticker_filter(selector: &StickerSelector) -> Option<String> {
    match selector {
        StickerSelector::Level(level) if (1..=MAX_LEVEL).contains(level) => Some(all_of([
            eq("type", "level"),
            eq("key", &format!("level_{level}")),
        ])),
        StickerSelector::Level(_) => None,
        StickerSelector::Story(story_id) if !story_id.is_empty() => {
            Some(all_of([eq("type", "story"), eq("story", story_id)]))
        }
        StickerSelector::Story(_) => None,
    }
}

/// Unlocks the sticker selected by `selector` for `user_id` inside `tx`.
pub async fn grant(
    tx: &mut dyn RecordTx,
    user_id: &str,
    selector: &StickerSelector,
    source: UnlockSource,
) -> PortResult<UnlockOutcome> {
    let Some(filter) = sticker_filter(selector).filter(|_| !user_id.is_empty()) else {
        return Ok(UnlockOutcome::Skipped);
    };

    let sticker = match optional(tx.find_first(Collection::Stickers, &filter).await)? {
        Some(Some(sticker)) => sticker,
        _ => {
            debug!(?selector, "sticker not provisioned, nothing to unlock");
            return Ok(UnlockOutcome::NotProvisioned);
        }
    };

    let held = all_of([eq("user", user_id), eq("sticker", &sticker.id)]);
    match optional(tx.find_first(Collection::UserStickers, &held).await)? {
        None => return Ok(UnlockOutcome::NotProvisioned),
        Some(Some(_)) => return Ok(UnlockOutcome::AlreadyHeld),
        Some(None) => {}
    }

    let row = fields([
        ("user", json!(user_id)),
        ("sticker", json!(sticker.id)),
        ("unlock_source", json!(source.as_str())),
    ]);
    match tx.create(Collection::UserStickers, row).await {
        Ok(record) => Ok(UnlockOutcome::Unlocked(record)),
        Err(PortError::Conflict(_)) => Ok(UnlockOutcome::AlreadyHeld),
        Err(e) => Err(e),
    }
}

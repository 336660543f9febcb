//! crates/story_engine_core/src/domain.rs
//!
//! Defines the core data structures for the story platform.
//! Rows are kept generic (a JSON field map per record) because the record store
//! is schemaless from the engine's point of view; the typed views below decode
//! the few rows the engine owns outright.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::ports::{PortError, PortResult};

/// The field map of a record.
pub type Fields = Map<String, Value>;

//=========================================================================================
// Collections
//=========================================================================================

/// Every record type the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Stories,
    Chapters,
    ChapterAudios,
    Views,
    Reviews,
    Bookmarks,
    ReadingProgress,
    ListeningSessions,
    UserStats,
    Stickers,
    UserStickers,
    StoryCompletions,
    IapVerifications,
    Reports,
    SearchHistory,
    PopularSearchesCache,
}

impl Collection {
    pub const ALL: [Collection; 16] = [
        Collection::Stories,
        Collection::Chapters,
        Collection::ChapterAudios,
        Collection::Views,
        Collection::Reviews,
        Collection::Bookmarks,
        Collection::ReadingProgress,
        Collection::ListeningSessions,
        Collection::UserStats,
        Collection::Stickers,
        Collection::UserStickers,
        Collection::StoryCompletions,
        Collection::IapVerifications,
        Collection::Reports,
        Collection::SearchHistory,
        Collection::PopularSearchesCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Stories => "stories",
            Collection::Chapters => "chapters",
            Collection::ChapterAudios => "chapter_audios",
            Collection::Views => "views",
            Collection::Reviews => "reviews",
            Collection::Bookmarks => "bookmarks",
            Collection::ReadingProgress => "reading_progress",
            Collection::ListeningSessions => "listening_sessions",
            Collection::UserStats => "user_stats",
            Collection::Stickers => "stickers",
            Collection::UserStickers => "user_stickers",
            Collection::StoryCompletions => "story_completions",
            Collection::IapVerifications => "iap_verifications",
            Collection::Reports => "reports",
            Collection::SearchHistory => "search_history",
            Collection::PopularSearchesCache => "popular_searches_cache",
        }
    }

    /// Field sets that must be unique within the collection.
    pub fn unique_keys(&self) -> &'static [&'static str] {
        match self {
            Collection::UserStickers => &["user", "sticker"],
            Collection::UserStats => &["user"],
            Collection::StoryCompletions => &["user", "story"],
            Collection::PopularSearchesCache => &["query"],
            _ => &[],
        }
    }

    /// Rows written only by the engine or by trusted backend flows, never by a
    /// client write path.
    pub fn is_engine_owned(&self) -> bool {
        matches!(
            self,
            Collection::UserStats
                | Collection::Stickers
                | Collection::UserStickers
                | Collection::StoryCompletions
                | Collection::IapVerifications
                | Collection::PopularSearchesCache
        )
    }

    /// Fields the engine keeps derived on rows of this collection.
    pub fn derived_fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Stories => &[
                "view_count",
                "average_rating",
                "review_count",
                "favorite_count",
                "bookmark_count",
                "has_audio",
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PortError::MissingCollection(s.to_string()))
    }
}

//=========================================================================================
// Generic Record
//=========================================================================================

/// A persisted row of any collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub collection: Collection,
    pub data: Fields,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Record {
    /// Returns the string value of `key`, or `""` when absent or not a string.
    pub fn get_str(&self, key: &str) -> &str {
        self.data.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.data.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        self.data
            .get(key)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(0)
    }

    /// Decodes the row into a typed view.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> PortResult<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| {
                PortError::Serialization(format!("{} {}: {}", self.collection, self.id, e))
            })
    }
}

/// Builds a field map from `(name, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A fresh 15 character record id.
pub fn new_record_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(15);
    id
}

//=========================================================================================
// Typed Views
//=========================================================================================

/// Discriminator of a `bookmarks` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkKind {
    Favorite,
    Bookmark,
    ReadLater,
}

impl BookmarkKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "favorite" => Some(BookmarkKind::Favorite),
            "bookmark" => Some(BookmarkKind::Bookmark),
            "read_later" => Some(BookmarkKind::ReadLater),
            _ => None,
        }
    }
}

/// Why a sticker was unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockSource {
    LevelUp,
    StoryComplete,
}

impl UnlockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockSource::LevelUp => "level_up",
            UnlockSource::StoryComplete => "story_complete",
        }
    }
}

/// Identifies which sticker an unlock refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StickerSelector {
    /// `type="level"`, `key="level_<n>"`.
    Level(u32),
    /// `type="story"` attached to a story id.
    Story(String),
}

/// Progression state of one user, stored in `user_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStats {
    pub user: String,
    pub total_xp: f64,
    #[serde(deserialize_with = "lenient_count")]
    pub level: u32,
    #[serde(deserialize_with = "lenient_count")]
    pub streak_days: u32,
    #[serde(deserialize_with = "lenient_date")]
    pub last_activity_date: Option<NaiveDate>,
    #[serde(deserialize_with = "lenient_count")]
    pub chapters_read: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub chapters_listened: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub stories_completed: u64,
}

impl Default for UserStats {
    fn default() -> Self {
        Self {
            user: String::new(),
            total_xp: 0.0,
            level: 1,
            streak_days: 0,
            last_activity_date: None,
            chapters_read: 0,
            chapters_listened: 0,
            stories_completed: 0,
        }
    }
}

impl UserStats {
    /// A fresh stats row: all counters zero, level 1.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn to_fields(&self) -> PortResult<Fields> {
        match serde_json::to_value(self).map_err(|e| PortError::Serialization(e.to_string()))? {
            Value::Object(map) => Ok(map),
            other => Err(PortError::Serialization(format!(
                "user stats encoded to non-object {other}"
            ))),
        }
    }
}

// Rows written by other tooling store an empty string instead of null.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// Other writers store counters as JSON floats (`2.0`).
fn lenient_count<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: TryFrom<u64>,
{
    let raw = f64::deserialize(deserializer)?;
    if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 {
        return Err(serde::de::Error::custom(format!(
            "{raw} is not a whole non-negative count"
        )));
    }
    T::try_from(raw as u64)
        .map_err(|_| serde::de::Error::custom(format!("{raw} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_names_round_trip() {
        for c in Collection::ALL {
            assert_eq!(c.as_str().parse::<Collection>().unwrap(), c);
        }
        assert!("users".parse::<Collection>().is_err());
    }

    #[test]
    fn engine_owned_rows_are_not_client_writable() {
        assert!(Collection::UserStats.is_engine_owned());
        assert!(Collection::StoryCompletions.is_engine_owned());
        assert!(Collection::IapVerifications.is_engine_owned());
        assert!(!Collection::Views.is_engine_owned());
        assert!(!Collection::SearchHistory.is_engine_owned());
        assert!(Collection::Stories.derived_fields().contains(&"view_count"));
        assert!(Collection::Chapters.derived_fields().is_empty());
    }

    #[test]
    fn stats_decode_tolerates_legacy_rows() {
        let record = Record {
            id: "s1".into(),
            collection: Collection::UserStats,
            data: fields([
                ("user", json!("u1")),
                ("total_xp", json!(120.0)),
                ("level", json!(2)),
                ("last_activity_date", json!("")),
            ]),
            created: Utc::now(),
            updated: Utc::now(),
        };
        let stats: UserStats = record.decode().unwrap();
        assert_eq!(stats.level, 2);
        assert_eq!(stats.last_activity_date, None);
        assert_eq!(stats.chapters_read, 0);

        let floats = Record {
            data: fields([
                ("user", json!("u1")),
                ("total_xp", json!(310)),
                ("level", json!(3.0)),
                ("streak_days", json!(4.0)),
                ("last_activity_date", json!("2025-05-09")),
                ("chapters_read", json!(12.0)),
                ("stories_completed", json!(1)),
            ]),
            ..record.clone()
        };
        let stats: UserStats = floats.decode().unwrap();
        assert_eq!(stats.total_xp, 310.0);
        assert_eq!(stats.level, 3);
        assert_eq!(stats.streak_days, 4);
        assert_eq!(stats.chapters_read, 12);
        assert_eq!(stats.stories_completed, 1);

        let fractional = Record {
            data: fields([("user", json!("u1")), ("level", json!(2.5))]),
            ..record
        };
        assert!(fractional.decode::<UserStats>().is_err());
    }

    #[test]
    fn accessors_default_like_the_store() {
        let record = Record {
            id: "r".into(),
            collection: Collection::Reviews,
            data: fields([("rating", json!(4)), ("story", json!("s"))]),
            created: Utc::now(),
            updated: Utc::now(),
        };
        assert_eq!(record.get_f64("rating"), 4.0);
        assert_eq!(record.get_str("user"), "");
        assert!(!record.get_bool("is_completed"));
    }
}

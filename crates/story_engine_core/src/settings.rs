//! crates/story_engine_core/src/settings.rs
//!
//! Tunables of the reactive engine. The service builds these from its
//! environment configuration; tests use the defaults.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};

/// Product identifiers that grant premium access when verified for a device.
pub const DEFAULT_PREMIUM_PRODUCT_IDS: [&str; 3] = [
    "com.hbstore.koreankids.monthly",
    "com.hbstore.koreankids.threemonth",
    "com.hbstore.koreankids.yearly",
];

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Trailing window in which a second view by the same identity is a duplicate.
    pub view_dedup_window: Duration,
    /// Offset used to turn "now" into the calendar date streaks are counted in.
    pub activity_offset: FixedOffset,
    pub review_page_limit: usize,
    pub bookmark_page_limit: usize,
    pub chapter_page_limit: usize,
    pub premium_product_ids: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            view_dedup_window: Duration::hours(1),
            activity_offset: Utc.fix(),
            review_page_limit: 1000,
            bookmark_page_limit: 10_000,
            chapter_page_limit: 500,
            premium_product_ids: DEFAULT_PREMIUM_PRODUCT_IDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EngineSettings {
    /// The calendar date of `now` in the configured activity offset.
    pub fn activity_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.activity_offset).date_naive()
    }
}

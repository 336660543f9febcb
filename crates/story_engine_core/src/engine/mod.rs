//! The reactive engines that keep derived state consistent with leaf records.

pub mod aggregates;
pub mod dedup;
pub mod popular;
pub mod progression;
pub mod unlock;

pub use aggregates::{Aggregates, BookmarkCounts, RatingSummary};
pub use dedup::{DedupFilter, ViewIdentity};
pub use popular::{PopularSearches, SearchTerm};
pub use progression::{level_for_xp, next_streak, ProgressOutcome, ProgressionEngine};
pub use unlock::UnlockOutcome;

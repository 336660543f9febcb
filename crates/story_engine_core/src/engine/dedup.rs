//! View deduplication.
//!
//! A view is a duplicate when the same identity (user id, else IP address)
//! already viewed the same story inside the trailing window. Every view row is
//! kept; only the `view_count` increment is gated by this check.

use chrono::Duration;
use std::sync::Arc;
use tracing::warn;

use crate::domain::{Collection, Record};
use crate::filter::{all_of, eq, precedes, since};
use crate::ports::{Clock, RecordStore};

/// Who performed a view, as far as deduplication can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewIdentity<'a> {
    User(&'a str),
    Ip(&'a str),
}

impl<'a> ViewIdentity<'a> {
    /// User id wins over IP; `None` when the view carries neither.
    pub fn of(view: &'a Record) -> Option<Self> {
        let user = view.get_str("user");
        if !user.is_empty() {
            return Some(ViewIdentity::User(user));
        }
        let ip = view.get_str("ip_address");
        if !ip.is_empty() {
            return Some(ViewIdentity::Ip(ip));
        }
        None
    }

    fn clause(&self) -> String {
        match self {
            ViewIdentity::User(user) => eq("user", user),
            ViewIdentity::Ip(ip) => eq("ip_address", ip),
        }
    }
}

#[derive(Clone)]
pub struct DedupFilter {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl DedupFilter {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            store,
            clock,
            window,
        }
    }

    /// True when an earlier view by the same identity falls inside the window.
    ///
    /// Anonymous views are never duplicates, and a failed lookup allows the
    /// increment. The triggering row is already persisted, so only rows ahead of
    /// it in `(created, id)` order count against it. Of any set of views by one
    /// identity exactly one has no predecessor.
    pub async fn is_duplicate(&self, view: &Record, story_id: &str) -> bool {
        let Some(identity) = ViewIdentity::of(view) else {
            return false;
        };
        let cutoff = self.clock.now() - self.window;
        let filter = all_of([
            eq("story", story_id),
            identity.clause(),
            since("created", cutoff),
            precedes(view),
        ]);
        match self
            .store
            .find_by_filter(Collection::Views, &filter, "-created", 1, 0)
            .await
        {
            Ok(prior) => !prior.is_empty(),
            Err(e) => {
                warn!(view = %view.id, "view dedup lookup failed, counting the view: {e}");
                false
            }
        }
    }
}

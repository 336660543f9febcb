//! Popular search terms.
//!
//! `popular_searches_cache` is a derived snapshot of `search_history`: the most
//! frequent trimmed queries with their hit counts. A refresh replaces the whole
//! snapshot inside one transaction, so readers see either the old list or the
//! new one.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::domain::{fields, Collection};
use crate::ports::{PortResult, RecordStore};

/// How many terms a refresh keeps.
pub const POPULAR_LIMIT: usize = 20;

/// Seeded when there is no search history yet, most popular first.
pub const DEFAULT_POPULAR_QUERIES: [&str; 5] =
    ["흥부와 놀부", "선녀와 나무꾼", "이순신", "거북선", "토끼"];

const HISTORY_PAGE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub query: String,
    pub hit_count: u64,
}

/// Counts trimmed, non-empty queries and keeps the `limit` most frequent.
/// Ties are broken alphabetically.
pub fn rank_queries<'a>(
    queries: impl IntoIterator<Item = &'a str>,
    limit: usize,
) -> Vec<SearchTerm> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for query in queries.into_iter().map(str::trim).filter(|q| !q.is_empty()) {
        *counts.entry(query).or_default() += 1;
    }
    let mut ranked: Vec<SearchTerm> = counts
        .into_iter()
        .map(|(query, hit_count)| SearchTerm {
            query: query.to_string(),
            hit_count,
        })
        .collect();
    ranked.sort_by(|a, b| b.hit_count.cmp(&a.hit_count).then_with(|| a.query.cmp(&b.query)));
    ranked.truncate(limit);
    ranked
}

fn default_terms() -> Vec<SearchTerm> {
    let total = DEFAULT_POPULAR_QUERIES.len() as u64;
    DEFAULT_POPULAR_QUERIES
        .iter()
        .zip(0..)
        .map(|(query, rank)| SearchTerm {
            query: query.to_string(),
            hit_count: total - rank,
        })
        .collect()
}

#[derive(Clone)]
pub struct PopularSearches {
    store: Arc<dyn RecordStore>,
}

impl PopularSearches {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Rebuilds the cache from the full search history.
    pub async fn refresh(&self) -> PortResult<Vec<SearchTerm>> {
        let mut tx = self.store.begin().await?;

        let mut history = Vec::new();
        loop {
            let page = tx
                .find_by_filter(
                    Collection::SearchHistory,
                    r#"query!="""#,
                    "created",
                    HISTORY_PAGE,
                    history.len(),
                )
                .await?;
            let full = page.len() == HISTORY_PAGE;
            history.extend(page);
            if !full {
                break;
            }
        }

        let mut terms = rank_queries(history.iter().map(|r| r.get_str("query")), POPULAR_LIMIT);
        let seeded = terms.is_empty();
        if seeded {
            terms = default_terms();
        }

        for stale in tx
            .find_by_filter(Collection::PopularSearchesCache, "", "", 0, 0)
            .await?
        {
            tx.delete(&stale).await?;
        }
        for term in &terms {
            tx.create(
                Collection::PopularSearchesCache,
                fields([
                    ("query", json!(term.query)),
                    ("hit_count", json!(term.hit_count)),
                ]),
            )
            .await?;
        }
        tx.commit().await?;

        if seeded {
            info!(terms = terms.len(), "popular searches seeded with defaults");
        } else {
            info!(terms = terms.len(), "popular searches refreshed from search history");
        }
        Ok(terms)
    }

    /// The cached terms, most popular first. An empty cache is refreshed once.
    pub async fn top(&self, limit: usize) -> PortResult<Vec<String>> {
        let cached = self
            .store
            .find_by_filter(Collection::PopularSearchesCache, "", "-hit_count", limit, 0)
            .await?;
        if !cached.is_empty() {
            return Ok(cached
                .iter()
                .map(|r| r.get_str("query"))
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect());
        }
        match self.refresh().await {
            Ok(terms) => Ok(terms.into_iter().take(limit).map(|t| t.query).collect()),
            Err(e) => {
                warn!("popular searches refresh on read failed: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Refreshes after `first_delay` and then every `every`, forever.
    /// Failed refreshes are logged and retried on the next tick.
    pub async fn run_schedule(self, first_delay: Duration, every: Duration) {
        tokio::time::sleep(first_delay).await;
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if let Err(e) = self.refresh().await {
                warn!("scheduled popular searches refresh failed: {e}");
            }
        }
    }
}

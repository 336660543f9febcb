//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use std::sync::Arc;
use story_engine_core::engine::PopularSearches;
use story_engine_core::{Entitlements, EventRouter};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Every write goes through the router so its reactions run.
    pub router: Arc<EventRouter>,
    pub entitlements: Entitlements,
    pub popular: PopularSearches,
    /// Read by handlers for request-time settings such as the cron secret.
    pub config: Arc<Config>,
}

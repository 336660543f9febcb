//! Premium content gating.
//!
//! Purchases are verified elsewhere and land in `iap_verifications`; this module
//! only reads that side table to decide whether a device may hear the audio of a
//! locked chapter.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Collection, Record};
use crate::filter::{all_of, eq};
use crate::ports::{optional, Clock, PortResult, RecordStore};

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // The record store's own datetime format: "2006-01-02 15:04:05.000Z".
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether one verification row still grants access at `now`.
pub fn verification_active(verification: &Record, now: DateTime<Utc>) -> bool {
    let expires_at = verification.get_str("expires_at").trim();
    if expires_at.is_empty() {
        // Non-consumable purchase or legacy row.
        return true;
    }
    parse_expiry(expires_at).is_some_and(|at| at > now)
}

#[derive(Clone)]
pub struct Entitlements {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    product_ids: Vec<String>,
}

impl Entitlements {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        product_ids: Vec<String>,
    ) -> Self {
        Self {
            store,
            clock,
            product_ids,
        }
    }

    /// True when the device holds an active verification for any premium product.
    /// A product whose lookup fails is skipped.
    pub async fn is_device_premium(&self, device_id: &str) -> bool {
        if device_id.is_empty() {
            return false;
        }
        let now = self.clock.now();
        for product_id in &self.product_ids {
            let filter = all_of([eq("device_id", device_id), eq("product_id", product_id)]);
            let found = self
                .store
                .find_by_filter(Collection::IapVerifications, &filter, "-created", 1, 0)
                .await;
            match found {
                Ok(rows) if rows.iter().any(|r| verification_active(r, now)) => return true,
                Ok(_) => {}
                // One failed product lookup does not decide the others.
                Err(e) => debug!(
                    device = device_id,
                    product = %product_id,
                    "entitlement lookup failed: {e}"
                ),
            }
        }
        false
    }

    /// Adds the device's `is_premium` flag to each chapter row.
    pub async fn annotate_chapters(&self, device_id: &str, chapters: &mut [Record]) {
        let premium = self.is_device_premium(device_id).await;
        for chapter in chapters {
            chapter.data.insert("is_premium".to_string(), json!(premium));
        }
    }

    /// Audio variants of a chapter the device may see: all of them for a free
    /// chapter or a premium device, none otherwise.
    pub async fn gate_chapter_audios(
        &self,
        chapter_id: &str,
        device_id: &str,
    ) -> PortResult<Vec<Record>> {
        let audios = self
            .store
            .find_by_filter(
                Collection::ChapterAudios,
                &eq("chapter", chapter_id),
                "-created",
                0,
                0,
            )
            .await?;
        let Some(chapter) = optional(self.store.find_by_id(Collection::Chapters, chapter_id).await)?
        else {
            return Ok(audios);
        };
        if chapter.get_bool("is_free") || self.is_device_premium(device_id).await {
            Ok(audios)
        } else {
            Ok(Vec::new())
        }
    }
}

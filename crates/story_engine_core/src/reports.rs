//! Reports sent from the public support form.

use serde_json::json;

use crate::domain::{fields, Fields};

pub const REPORT_TYPES: [&str; 5] = ["story", "chapter", "app", "question", "other"];

/// A support form submission before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSubmission {
    pub kind: String,
    pub reason: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportRejected {
    #[error("invalid report type '{0}'")]
    InvalidType(String),
    #[error("a reason is required")]
    MissingReason,
}

impl ReportSubmission {
    /// The `reports` row for this submission: trimmed, typed `app` by default,
    /// `pending`, and marked as coming from the web.
    pub fn into_fields(self) -> Result<Fields, ReportRejected> {
        let kind = match self.kind.trim() {
            "" => "app",
            kind => kind,
        };
        if !REPORT_TYPES.contains(&kind) {
            return Err(ReportRejected::InvalidType(kind.to_string()));
        }
        let reason = self.reason.trim();
        if reason.is_empty() {
            return Err(ReportRejected::MissingReason);
        }

        let mut row = fields([
            ("type", json!(kind)),
            ("reason", json!(reason)),
            ("status", json!("pending")),
            ("source", json!("web")),
        ]);
        let email = self.contact_email.trim();
        if !email.is_empty() {
            row.insert("contact_email".to_string(), json!(email));
        }
        Ok(row)
    }
}

//! Append-only activity log.
//!
//! A best-effort audit sink consumed as a side effect by login, account
//! management, email sends, checkout creation and webhook handling.
//! Recording never fails the business operation.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use billflow_core::UserId;

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Acting staff user; `None` for unauthenticated sources (webhooks,
    /// public invoice views).
    pub actor: Option<UserId>,
    pub action_type: String,
    pub action_category: String,
    pub description: String,
    pub details: JsonValue,
    /// Reference to the affected entity (invoice id, user id, ...).
    pub target: Option<String>,
    pub source_addr: Option<String>,
    pub user_agent: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

pub trait ActivityLog: Send + Sync {
    fn record(&self, entry: ActivityEntry);
}

/// In-memory activity log (dev/test; inspectable).
#[derive(Debug, Default)]
pub struct InMemoryActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ActivityLog for InMemoryActivityLog {
    fn record(&self, entry: ActivityEntry) {
        tracing::debug!(
            action_type = %entry.action_type,
            target = entry.target.as_deref().unwrap_or("-"),
            "activity recorded"
        );
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

use axum::http::HeaderMap;
use chrono::Utc;

use billflow_core::UserId;
use billflow_infra::{ActivityEntry, ActivityLog};

use crate::app::services::AppServices;
use crate::middleware::{client_addr, user_agent};

/// Record one audit entry (best-effort side effect).
#[allow(clippy::too_many_arguments)]
pub fn record_activity(
    services: &AppServices,
    actor: Option<UserId>,
    headers: Option<&HeaderMap>,
    action_type: &str,
    action_category: &str,
    description: impl Into<String>,
    target: Option<String>,
    details: serde_json::Value,
) {
    services.activity_log.record(ActivityEntry {
        actor,
        action_type: action_type.to_string(),
        action_category: action_category.to_string(),
        description: description.into(),
        details,
        target,
        source_addr: headers.map(client_addr),
        user_agent: headers.and_then(user_agent),
        recorded_at: Utc::now(),
    });
}

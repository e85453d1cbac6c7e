use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use billflow_auth::{AccountEvent, StaffRole};
use billflow_core::{AggregateId, UserId};
use billflow_events::EventEnvelope;

use super::invoices::ProjectionError;
use crate::read_model::KeyedStore;

pub const AGGREGATE_TYPE: &str = "auth.account";

/// Queryable staff account read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffReadModel {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: StaffRole,
    pub password_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Builds [`StaffReadModel`]s from account events; backs login lookups and
/// duplicate-email detection.
#[derive(Debug)]
pub struct StaffDirectoryProjection<S>
where
    S: KeyedStore<UserId, StaffReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> StaffDirectoryProjection<S>
where
    S: KeyedStore<UserId, StaffReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<StaffReadModel> {
        self.store.get(user_id)
    }

    pub fn list(&self) -> Vec<StaffReadModel> {
        self.store.list()
    }

    /// Find an active account by (normalized) email.
    pub fn find_active_by_email(&self, email: &str) -> Option<StaffReadModel> {
        let needle = email.trim().to_lowercase();
        self.store
            .list()
            .into_iter()
            .find(|rm| rm.active && rm.email == needle)
    }

    fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => cursors.get(&aggregate_id).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn set_cursor(&self, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, seq);
        }
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let last = self.cursor(aggregate_id);
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let ev: AccountEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        match ev {
            AccountEvent::Created(e) => {
                self.store.upsert(
                    e.user_id,
                    StaffReadModel {
                        user_id: e.user_id,
                        email: e.email,
                        display_name: e.display_name,
                        role: e.role,
                        password_hash: e.password_hash,
                        active: true,
                        created_at: e.occurred_at,
                    },
                );
            }
            AccountEvent::Deactivated(e) => {
                let mut rm = self
                    .store
                    .get(&e.user_id)
                    .ok_or(ProjectionError::MissingReadModel(aggregate_id))?;
                rm.active = false;
                self.store.upsert(e.user_id, rm);
            }
        }

        self.set_cursor(aggregate_id, seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    use billflow_auth::{AccountCreated, AccountDeactivated};
    use billflow_events::Event;

    use crate::read_model::InMemoryKeyedStore;

    fn projection() -> StaffDirectoryProjection<Arc<InMemoryKeyedStore<UserId, StaffReadModel>>> {
        StaffDirectoryProjection::new(Arc::new(InMemoryKeyedStore::new()))
    }

    fn envelope(user_id: UserId, seq: u64, ev: &AccountEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            user_id.into(),
            AGGREGATE_TYPE,
            seq,
            ev.occurred_at(),
            serde_json::to_value(ev).unwrap(),
        )
    }

    #[test]
    fn deactivated_accounts_disappear_from_email_lookup() {
        let projection = projection();
        let user_id = UserId::new();

        projection
            .apply_envelope(&envelope(
                user_id,
                1,
                &AccountEvent::Created(AccountCreated {
                    user_id,
                    email: "kim@example.com".to_string(),
                    display_name: "Kim".to_string(),
                    role: StaffRole::Employee,
                    password_hash: "$2b$12$fakehash".to_string(),
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();
        assert!(projection.find_active_by_email("Kim@Example.com").is_some());

        projection
            .apply_envelope(&envelope(
                user_id,
                2,
                &AccountEvent::Deactivated(AccountDeactivated {
                    user_id,
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();
        assert!(projection.find_active_by_email("kim@example.com").is_none());
        assert!(!projection.get(&user_id).unwrap().active);
    }
}

//! Stored session entity.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::{ConnectionId, InstanceId, SessionId, TenantId, UserId};

/// Whether a session currently has live connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// At least one connection is attached.
    #[default]
    Active,
    /// Every connection dropped; waiting for a resume until `grace_deadline`.
    PendingReconnect,
}

/// A logical session spanning one or more connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Live connections (on the owning instance).
    pub connection_ids: BTreeSet<ConnectionId>,
    /// First registration.
    pub created_at: DateTime<Utc>,
    /// Last observed activity.
    pub last_active_at: DateTime<Utc>,
    /// Instance currently allowed to write.
    pub owner_instance_id: InstanceId,
    /// Monotonic ownership counter.
    pub fencing_epoch: u64,
    /// Opaque application state (subscriptions, presence, ...).
    pub persisted_state: Value,
    /// Lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,
    /// Resume deadline while pending reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_deadline: Option<DateTime<Utc>>,
}

impl Session {
    /// New session owned by `owner` at epoch 1.
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        tenant_id: TenantId,
        owner: InstanceId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            tenant_id,
            connection_ids: BTreeSet::new(),
            created_at: now,
            last_active_at: now,
            owner_instance_id: owner,
            fencing_epoch: 1,
            persisted_state: Value::Object(serde_json::Map::new()),
            status: SessionStatus::Active,
            grace_deadline: None,
        }
    }

    /// Mark the session as waiting for a resume until `deadline`.
    pub fn enter_grace(&mut self, deadline: DateTime<Utc>) {
        self.connection_ids.clear();
        self.status = SessionStatus::PendingReconnect;
        self.grace_deadline = Some(deadline);
    }

    /// Back to active with `connection_id` attached.
    pub fn reactivate(&mut self, connection_id: ConnectionId, now: DateTime<Utc>) {
        let _ = self.connection_ids.insert(connection_id);
        self.status = SessionStatus::Active;
        self.grace_deadline = None;
        self.last_active_at = now;
    }

    /// Whether a pending grace window has passed at `now`.
    pub fn grace_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::PendingReconnect
            && self.grace_deadline.is_some_and(|d| now >= d)
    }
}

/// Result of a [`claim`](crate::SessionStore::claim).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Requested epoch was higher; caller now owns the session.
    Accepted,
    /// Stored epoch was equal or higher.
    Rejected {
        /// Epoch held by the current owner.
        current_epoch: u64,
        /// Current owner.
        owner_instance_id: InstanceId,
    },
}

impl ClaimOutcome {
    /// Whether the claim won.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> Session {
        Session::new(
            "sess_a".into(),
            "u1".into(),
            "t1".into(),
            "inst_a".into(),
            Utc::now(),
        )
    }

    #[test]
    fn new_session_starts_at_epoch_one() {
        let s = session();
        assert_eq!(s.fencing_epoch, 1);
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.persisted_state.is_object());
    }

    #[test]
    fn grace_cycle() {
        let mut s = session();
        let _ = s.connection_ids.insert("conn_1".into());
        let now = Utc::now();
        s.enter_grace(now + Duration::seconds(60));
        assert!(s.connection_ids.is_empty());
        assert!(!s.grace_expired_at(now + Duration::seconds(10)));
        assert!(s.grace_expired_at(now + Duration::seconds(65)));

        s.reactivate("conn_2".into(), now);
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.grace_deadline.is_none());
        assert!(!s.grace_expired_at(now + Duration::seconds(65)));
    }

    #[test]
    fn json_is_camel_case() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["fencingEpoch"], 1);
        assert_eq!(json["status"], "active");
        assert!(json.get("graceDeadline").is_none());
    }
}

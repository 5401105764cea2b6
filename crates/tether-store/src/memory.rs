//! In-process [`SessionStore`] backed by a sharded map.
//!
//! `claim`, `save`, and `touch` each hold one shard's write lock for the
//! whole read-compare-write, which makes them atomic per session.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tether_core::{InstanceId, SessionId};
use tracing::debug;

use crate::errors::{Result, StoreError};
use crate::session::{ClaimOutcome, Session};
use crate::store::SessionStore;

#[derive(Debug)]
struct Entry {
    session: Session,
    expires_at: DateTime<Utc>,
}

/// `DashMap`-backed session store.
#[derive(Debug)]
pub struct MemorySessionStore {
    entries: DashMap<SessionId, Entry>,
    ttl: chrono::Duration,
}

impl MemorySessionStore {
    /// Create a store whose records live `ttl` past their last write/touch.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
        }
    }

    /// Number of records, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// [`SessionStore::save`] at an explicit time.
    pub fn save_at(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let expires_at = self.deadline(now);
        let mut entry = self
            .entries
            .entry(session.session_id.clone())
            .or_insert_with(|| Entry {
                session: session.clone(),
                expires_at,
            });
        let stored = entry.session.fencing_epoch;
        // a lapsed record no longer fences anyone
        if entry.expires_at > now && stored > session.fencing_epoch {
            return Err(StoreError::Fenced {
                session_id: session.session_id.clone(),
                stored_epoch: stored,
                attempted_epoch: session.fencing_epoch,
            });
        }
        entry.session = session.clone();
        entry.expires_at = expires_at;
        Ok(())
    }

    /// [`SessionStore::load`] at an explicit time.
    pub fn load_at(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<Session> {
        self.entries
            .get(session_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.session.clone())
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }

    /// [`SessionStore::claim`] at an explicit time.
    pub fn claim_at(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut entry = self
            .entries
            .get_mut(session_id)
            .filter(|e| e.expires_at > now)
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;

        if requested_epoch <= entry.session.fencing_epoch {
            debug!(
                %session_id,
                requested_epoch,
                current_epoch = entry.session.fencing_epoch,
                "claim rejected"
            );
            return Ok(ClaimOutcome::Rejected {
                current_epoch: entry.session.fencing_epoch,
                owner_instance_id: entry.session.owner_instance_id.clone(),
            });
        }

        entry.session.fencing_epoch = requested_epoch;
        entry.session.owner_instance_id = instance_id.clone();
        entry.expires_at = self.deadline(now);
        Ok(ClaimOutcome::Accepted)
    }

    /// [`SessionStore::touch`] at an explicit time.
    pub fn touch_at(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(session_id)
            .filter(|e| e.expires_at > now)
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
        entry.session.last_active_at = now;
        entry.expires_at = self.deadline(now);
        Ok(())
    }

    /// [`SessionStore::expire_sweep`] at an explicit time.
    pub fn expire_sweep_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        // re-check under the shard lock; a touch may have landed in between
        expired
            .into_iter()
            .filter(|id| self.entries.remove_if(id, |_, e| e.expires_at <= now).is_some())
            .collect()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.save_at(session, Utc::now())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Session> {
        self.load_at(session_id, Utc::now())
    }

    async fn claim(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
    ) -> Result<ClaimOutcome> {
        self.claim_at(session_id, instance_id, requested_epoch, Utc::now())
    }

    async fn touch(&self, session_id: &SessionId) -> Result<()> {
        self.touch_at(session_id, Utc::now())
    }

    async fn expire_sweep(&self) -> Result<Vec<SessionId>> {
        Ok(self.expire_sweep_at(Utc::now()))
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.entries.remove(session_id).is_some())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

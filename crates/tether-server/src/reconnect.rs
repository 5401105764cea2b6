//! Session resume within a grace window.
//!
//! When a session's last connection drops involuntarily, the session is
//! saved as `pending_reconnect` with a grace deadline, so any instance can
//! judge a later resume. A resume presents a signed token bound to the epoch
//! it was issued under; the coordinator then claims the session at the next
//! epoch through the store. Exactly one concurrent claim wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tether_core::{AuthError, ConnectionId, InstanceId, Result, SessionId, TetherError, UserId};
use tether_store::{ClaimOutcome, Session, SessionStore, StoreError};
use tracing::{debug, info, instrument, warn};

use crate::auth::{ResumeGrant, ResumeTokenSigner};
use crate::metrics::{
    MetricsCollector, RECONNECTION_CONFLICT_TOTAL, RECONNECTION_EXPIRED_TOTAL,
    RECONNECTION_SUCCESS_TOTAL, SESSION_STORE_DEGRADED_TOTAL,
};

#[derive(Clone, Debug)]
struct Pending {
    session: Session,
    deadline: DateTime<Utc>,
    local_only: bool,
}

/// A session reattached to a new connection.
#[derive(Clone, Debug)]
pub struct Resumed {
    /// The session at its new epoch, with the new connection attached.
    pub session: Session,
    /// Resumed from this instance's memory because the store was unreachable.
    pub local_only: bool,
}

/// Tracks sessions waiting for a resume and arbitrates resume attempts.
pub struct ReconnectionCoordinator {
    store: Arc<dyn SessionStore>,
    signer: ResumeTokenSigner,
    instance_id: InstanceId,
    grace_window: chrono::Duration,
    metrics: Arc<MetricsCollector>,
    pending: DashMap<SessionId, Pending>,
}

impl ReconnectionCoordinator {
    /// Coordinator for this instance.
    pub fn new(
        store: Arc<dyn SessionStore>,
        signer: ResumeTokenSigner,
        instance_id: InstanceId,
        grace_window: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            signer,
            instance_id,
            grace_window: chrono::Duration::from_std(grace_window)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            metrics,
            pending: DashMap::new(),
        }
    }

    /// Configured grace window.
    pub fn grace_window(&self) -> Duration {
        self.grace_window.to_std().unwrap_or_default()
    }

    /// Mint a resume token for `session_id` at `epoch`.
    pub fn issue_token(&self, session_id: &SessionId, epoch: u64) -> String {
        self.signer.issue(session_id, epoch)
    }

    /// Check a resume token's signature and expiry.
    pub fn verify_token(&self, token: &str) -> std::result::Result<ResumeGrant, AuthError> {
        self.signer.verify(token)
    }

    /// Sessions waiting here for a resume.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Grace deadline of a pending session.
    pub fn deadline(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.pending.get(session_id).map(|p| p.deadline)
    }

    /// Forget a pending session (a fresh login attached to it).
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        self.pending.remove(session_id).is_some()
    }

    /// Put `session` into its grace window now.
    pub async fn begin_grace(&self, session: Session, local_only: bool) -> Result<DateTime<Utc>> {
        self.begin_grace_at(session, local_only, Utc::now()).await
    }

    /// [`begin_grace`](Self::begin_grace) at an explicit time.
    ///
    /// The session is saved as `pending_reconnect` under its current epoch.
    /// A fenced save means another owner already took over; nothing is
    /// tracked and the conflict is returned.
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    pub async fn begin_grace_at(
        &self,
        mut session: Session,
        local_only: bool,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let deadline = now + self.grace_window;
        session.enter_grace(deadline);
        session.last_active_at = now;

        let mut local_only = local_only;
        if !local_only {
            match self.store.save(&session).await {
                Ok(()) => {}
                Err(e @ StoreError::Fenced { .. }) => {
                    debug!(error = %e, "session already taken over, not holding grace");
                    return Err(e.into());
                }
                Err(e) if e.is_outage() => {
                    warn!(error = %e, "store unavailable, holding grace locally");
                    self.metrics
                        .increment(SESSION_STORE_DEGRADED_TOTAL, &[("op", "begin_grace")]);
                    local_only = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(%deadline, local_only, "session pending reconnect");
        let _ = self.pending.insert(
            session.session_id.clone(),
            Pending {
                session,
                deadline,
                local_only,
            },
        );
        Ok(deadline)
    }

    /// Resume `session_id` onto `new_connection`.
    pub async fn attempt_resume(
        &self,
        session_id: &SessionId,
        resume_token: &str,
        user_id: &UserId,
        new_connection: &ConnectionId,
    ) -> Result<Resumed> {
        self.attempt_resume_at(session_id, resume_token, user_id, new_connection, Utc::now())
            .await
    }

    /// [`attempt_resume`](Self::attempt_resume) at an explicit time.
    ///
    /// Errors: `Auth` for a bad token or wrong user,
    /// `ReconnectionWindowExpired` once the deadline passed or the session is
    /// gone, `SessionOwnershipConflict` when the token's epoch is stale or the
    /// claim lost a race.
    #[instrument(skip_all, fields(session_id = %session_id, connection_id = %new_connection))]
    pub async fn attempt_resume_at(
        &self,
        session_id: &SessionId,
        resume_token: &str,
        user_id: &UserId,
        new_connection: &ConnectionId,
        now: DateTime<Utc>,
    ) -> Result<Resumed> {
        let grant = self.signer.verify_at(resume_token, now)?;
        if &grant.session_id != session_id {
            return Err(AuthError::InvalidResumeToken("token is for another session".into()).into());
        }

        let local = self
            .pending
            .get(session_id)
            .filter(|p| p.local_only)
            .map(|p| p.value().clone());
        if let Some(pending) = local {
            return self.resume_local(pending, &grant, user_id, new_connection, now);
        }

        let mut session = match self.store.load(session_id).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => return Err(self.expired(session_id)),
            Err(e) => return Err(e.into()),
        };
        if &session.user_id != user_id {
            return Err(AuthError::Rejected("session belongs to another user".into()).into());
        }
        if grant.epoch < session.fencing_epoch {
            return Err(self.conflict(session_id, session.fencing_epoch));
        }
        if session.grace_expired_at(now) {
            let _ = self.pending.remove(session_id);
            if let Err(e) = self.store.remove(session_id).await {
                debug!(error = %e, "could not evict expired session");
            }
            return Err(self.expired(session_id));
        }

        let requested = session.fencing_epoch + 1;
        match self
            .store
            .claim(session_id, &self.instance_id, requested)
            .await
        {
            Ok(ClaimOutcome::Accepted) => {}
            Ok(ClaimOutcome::Rejected { current_epoch, .. }) => {
                return Err(self.conflict(session_id, current_epoch));
            }
            Err(StoreError::NotFound(_)) => return Err(self.expired(session_id)),
            Err(e) => return Err(e.into()),
        }

        session.fencing_epoch = requested;
        session.owner_instance_id = self.instance_id.clone();
        session.connection_ids.clear();
        session.reactivate(new_connection.clone(), now);

        let mut local_only = false;
        match self.store.save(&session).await {
            Ok(()) => {}
            Err(StoreError::Fenced { stored_epoch, .. }) => {
                return Err(self.conflict(session_id, stored_epoch));
            }
            Err(e) if e.is_outage() => {
                // the claim landed; only the state write is missing
                warn!(error = %e, "resumed without persisting session state");
                self.metrics
                    .increment(SESSION_STORE_DEGRADED_TOTAL, &[("op", "resume")]);
                local_only = true;
            }
            Err(e) => return Err(e.into()),
        }

        let _ = self.pending.remove(session_id);
        self.metrics.increment(RECONNECTION_SUCCESS_TOTAL, &[]);
        info!(epoch = requested, "session resumed");
        Ok(Resumed {
            session,
            local_only,
        })
    }

    fn resume_local(
        &self,
        pending: Pending,
        grant: &ResumeGrant,
        user_id: &UserId,
        new_connection: &ConnectionId,
        now: DateTime<Utc>,
    ) -> Result<Resumed> {
        let session_id = &pending.session.session_id;
        if &pending.session.user_id != user_id {
            return Err(AuthError::Rejected("session belongs to another user".into()).into());
        }
        if grant.epoch < pending.session.fencing_epoch {
            return Err(self.conflict(session_id, pending.session.fencing_epoch));
        }
        if now >= pending.deadline {
            let _ = self.pending.remove(session_id);
            return Err(self.expired(session_id));
        }
        // remove first so two local attempts cannot both win
        let Some((_, pending)) = self.pending.remove(session_id) else {
            return Err(self.conflict(session_id, grant.epoch + 1));
        };
        let mut session = pending.session;
        session.fencing_epoch += 1;
        session.owner_instance_id = self.instance_id.clone();
        session.reactivate(new_connection.clone(), now);
        self.metrics.increment(RECONNECTION_SUCCESS_TOTAL, &[]);
        info!(epoch = session.fencing_epoch, "session resumed from local state");
        Ok(Resumed {
            session,
            local_only: true,
        })
    }

    /// Evict sessions whose grace window passed without a resume.
    pub async fn finalize_expired(&self) -> Vec<SessionId> {
        self.finalize_expired_at(Utc::now()).await
    }

    /// [`finalize_expired`](Self::finalize_expired) at an explicit time.
    pub async fn finalize_expired_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let due: Vec<SessionId> = self
            .pending
            .iter()
            .filter(|p| p.deadline <= now)
            .map(|p| p.key().clone())
            .collect();

        let mut finalized = Vec::new();
        for session_id in due {
            let Some((_, pending)) = self.pending.remove_if(&session_id, |_, p| p.deadline <= now)
            else {
                continue;
            };
            if !pending.local_only {
                match self.store.load(&session_id).await {
                    Ok(stored)
                        if stored.fencing_epoch == pending.session.fencing_epoch
                            && stored.grace_expired_at(now) =>
                    {
                        if let Err(e) = self.store.remove(&session_id).await {
                            warn!(%session_id, error = %e, "failed to evict session");
                        }
                    }
                    Ok(_) => {
                        debug!(%session_id, "session moved on elsewhere");
                        continue;
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => {
                        // left to the store's TTL sweep
                        warn!(%session_id, error = %e, "could not finalize session");
                    }
                }
            }
            self.metrics.increment(RECONNECTION_EXPIRED_TOTAL, &[]);
            info!(%session_id, "session finalized after grace window");
            finalized.push(session_id);
        }
        finalized
    }

    fn conflict(&self, session_id: &SessionId, current_epoch: u64) -> TetherError {
        self.metrics.increment(RECONNECTION_CONFLICT_TOTAL, &[]);
        debug!(%session_id, current_epoch, "resume lost ownership race");
        TetherError::SessionOwnershipConflict {
            session_id: session_id.clone(),
            current_epoch,
        }
    }

    fn expired(&self, session_id: &SessionId) -> TetherError {
        self.metrics.increment(RECONNECTION_EXPIRED_TOTAL, &[]);
        debug!(%session_id, "resume after grace window");
        TetherError::ReconnectionWindowExpired(session_id.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

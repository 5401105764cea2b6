//! The [`SessionStore`] contract.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{InstanceId, SessionId};

use crate::errors::Result;
use crate::session::{ClaimOutcome, Session};

/// Shared, durable session record with fenced ownership.
///
/// Every record carries a TTL that `save`, `claim`, and `touch` extend.
/// Expired records behave as absent and are physically removed by
/// [`expire_sweep`](Self::expire_sweep).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session.
    ///
    /// Fails with [`StoreError::Fenced`](crate::StoreError::Fenced) when the
    /// stored epoch is higher than `session.fencing_epoch`.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Fetch a session, with owner and epoch from the ownership record.
    async fn load(&self, session_id: &SessionId) -> Result<Session>;

    /// Atomically take ownership if `requested_epoch` exceeds the stored one.
    async fn claim(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
    ) -> Result<ClaimOutcome>;

    /// Extend the TTL and bump `last_active_at`. Never creates a record.
    async fn touch(&self, session_id: &SessionId) -> Result<()>;

    /// Delete TTL-expired sessions, returning their IDs.
    async fn expire_sweep(&self) -> Result<Vec<SessionId>>;

    /// Delete a session. Returns whether it existed.
    async fn remove(&self, session_id: &SessionId) -> Result<bool>;
}

#[async_trait]
impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    async fn save(&self, session: &Session) -> Result<()> {
        (**self).save(session).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Session> {
        (**self).load(session_id).await
    }

    async fn claim(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
    ) -> Result<ClaimOutcome> {
        (**self).claim(session_id, instance_id, requested_epoch).await
    }

    async fn touch(&self, session_id: &SessionId) -> Result<()> {
        (**self).touch(session_id).await
    }

    async fn expire_sweep(&self) -> Result<Vec<SessionId>> {
        (**self).expire_sweep().await
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool> {
        (**self).remove(session_id).await
    }
}

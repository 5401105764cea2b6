//! `SQLite`-backed [`SessionStore`].
//!
//! Two tables (see `v001_sessions.sql`):
//! - `session_records`: the full [`Session`] as JSON, plus TTL
//! - `session_ownership`: `owner_instance_id` and `fencing_epoch`, plus TTL
//!
//! The ownership row is authoritative; `load` overlays it on the record.
//! `claim` is a single conditional `UPDATE`, so concurrent claimers from
//! any number of processes sharing the file get exactly one winner.
//! Every blocking call runs on `spawn_blocking`.

pub mod connection;
pub mod migrations;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use tether_core::{InstanceId, SessionId};
use tracing::debug;

use crate::errors::{Result, StoreError};
use crate::session::{ClaimOutcome, Session};
use crate::store::SessionStore;

use self::connection::{ConnectionConfig, ConnectionPool};

/// Session store over an `r2d2` pool of `SQLite` connections.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: ConnectionPool,
    ttl_ms: i64,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore")
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    /// Open (creating if needed) a database file and run migrations.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        let pool = connection::new_file(path, &ConnectionConfig::default())?;
        Self::from_pool(pool, ttl)
    }

    /// Single-connection in-memory database (tests).
    pub fn in_memory(ttl: Duration) -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        Self::from_pool(pool, ttl)
    }

    /// Wrap an existing pool and run migrations.
    pub fn from_pool(pool: ConnectionPool, ttl: Duration) -> Result<Self> {
        let conn = pool.get()?;
        let _ = migrations::run_migrations(&conn)?;
        drop(conn);
        Ok(Self {
            pool,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2),
        })
    }

    fn expires(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().saturating_add(self.ttl_ms)
    }

    /// [`SessionStore::save`] at an explicit time.
    pub fn save_at(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_ms = now.timestamp_millis();

        let stored: Option<i64> = tx
            .query_row(
                "SELECT fencing_epoch FROM session_ownership
                 WHERE session_id = ?1 AND expires_at > ?2",
                params![session.session_id.as_str(), now_ms],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(stored) = stored.map(epoch_from_sql) {
            if stored > session.fencing_epoch {
                return Err(StoreError::Fenced {
                    session_id: session.session_id.clone(),
                    stored_epoch: stored,
                    attempted_epoch: session.fencing_epoch,
                });
            }
        }

        let expires_at = self.expires(now);
        let record = serde_json::to_string(session)?;
        let _ = tx.execute(
            "INSERT INTO session_records
                 (session_id, user_id, tenant_id, record, last_active_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (session_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 tenant_id = excluded.tenant_id,
                 record = excluded.record,
                 last_active_at = excluded.last_active_at,
                 expires_at = excluded.expires_at",
            params![
                session.session_id.as_str(),
                session.user_id.as_str(),
                session.tenant_id.as_str(),
                record,
                format_ts(session.last_active_at),
                expires_at,
            ],
        )?;
        let _ = tx.execute(
            "INSERT INTO session_ownership
                 (session_id, owner_instance_id, fencing_epoch, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (session_id) DO UPDATE SET
                 owner_instance_id = excluded.owner_instance_id,
                 fencing_epoch = excluded.fencing_epoch,
                 expires_at = excluded.expires_at",
            params![
                session.session_id.as_str(),
                session.owner_instance_id.as_str(),
                epoch_to_sql(session.fencing_epoch),
                expires_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// [`SessionStore::load`] at an explicit time.
    pub fn load_at(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<Session> {
        let conn = self.pool.get()?;
        let row: Option<(String, String, String, i64)> = conn
            .query_row(
                "SELECT r.record, r.last_active_at, o.owner_instance_id, o.fencing_epoch
                 FROM session_records r
                 JOIN session_ownership o ON o.session_id = r.session_id
                 WHERE r.session_id = ?1 AND r.expires_at > ?2",
                params![session_id.as_str(), now.timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (record, last_active_at, owner, epoch) =
            row.ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
        let mut session: Session = serde_json::from_str(&record)?;
        session.owner_instance_id = InstanceId::from(owner);
        session.fencing_epoch = epoch_from_sql(epoch);
        session.last_active_at = parse_ts(&last_active_at)?;
        Ok(session)
    }

    /// [`SessionStore::claim`] at an explicit time.
    pub fn claim_at(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let conn = self.pool.get()?;
        let now_ms = now.timestamp_millis();
        let expires_at = self.expires(now);

        let changed = conn.execute(
            "UPDATE session_ownership
             SET owner_instance_id = ?2, fencing_epoch = ?3, expires_at = ?4
             WHERE session_id = ?1 AND fencing_epoch < ?3 AND expires_at > ?5",
            params![
                session_id.as_str(),
                instance_id.as_str(),
                epoch_to_sql(requested_epoch),
                expires_at,
                now_ms,
            ],
        )?;
        if changed == 1 {
            let _ = conn.execute(
                "UPDATE session_records SET expires_at = ?2 WHERE session_id = ?1",
                params![session_id.as_str(), expires_at],
            )?;
            return Ok(ClaimOutcome::Accepted);
        }

        let current: Option<(i64, String)> = conn
            .query_row(
                "SELECT fencing_epoch, owner_instance_id FROM session_ownership
                 WHERE session_id = ?1 AND expires_at > ?2",
                params![session_id.as_str(), now_ms],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match current {
            Some((epoch, owner)) => {
                debug!(%session_id, requested_epoch, current_epoch = epoch, "claim rejected");
                Ok(ClaimOutcome::Rejected {
                    current_epoch: epoch_from_sql(epoch),
                    owner_instance_id: InstanceId::from(owner),
                })
            }
            None => Err(StoreError::NotFound(session_id.clone())),
        }
    }

    /// [`SessionStore::touch`] at an explicit time.
    pub fn touch_at(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expires_at = self.expires(now);
        let changed = tx.execute(
            "UPDATE session_records SET last_active_at = ?2, expires_at = ?3
             WHERE session_id = ?1 AND expires_at > ?4",
            params![
                session_id.as_str(),
                format_ts(now),
                expires_at,
                now.timestamp_millis()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(session_id.clone()));
        }
        let _ = tx.execute(
            "UPDATE session_ownership SET expires_at = ?2 WHERE session_id = ?1",
            params![session_id.as_str(), expires_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// [`SessionStore::expire_sweep`] at an explicit time.
    pub fn expire_sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "DELETE FROM session_records WHERE expires_at <= ?1 RETURNING session_id",
        )?;
        let ids = stmt
            .query_map(params![now.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .map(|r| r.map(SessionId::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// [`SessionStore::remove`].
    pub fn remove_sync(&self, session_id: &SessionId) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM session_records WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| StoreError::Internal(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.blocking(move |s| s.save_at(&session, Utc::now())).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Session> {
        let id = session_id.clone();
        self.blocking(move |s| s.load_at(&id, Utc::now())).await
    }

    async fn claim(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
    ) -> Result<ClaimOutcome> {
        let id = session_id.clone();
        let inst = instance_id.clone();
        self.blocking(move |s| s.claim_at(&id, &inst, requested_epoch, Utc::now()))
            .await
    }

    async fn touch(&self, session_id: &SessionId) -> Result<()> {
        let id = session_id.clone();
        self.blocking(move |s| s.touch_at(&id, Utc::now())).await
    }

    async fn expire_sweep(&self) -> Result<Vec<SessionId>> {
        self.blocking(|s| s.expire_sweep_at(Utc::now())).await
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool> {
        let id = session_id.clone();
        self.blocking(move |s| s.remove_sync(&id)).await
    }
}

// Epochs start at 1 and grow by one per ownership transfer; i64 is ample.
#[allow(clippy::cast_possible_wrap)]
fn epoch_to_sql(epoch: u64) -> i64 {
    epoch as i64
}

#[allow(clippy::cast_sign_loss)]
fn epoch_from_sql(epoch: i64) -> u64 {
    epoch.max(0) as u64
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("bad timestamp {s:?}: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Connection registry.
//!
//! [`ConnectionManager`] owns every live [`Connection`] on this instance in a
//! sharded map, with secondary indexes by session and by user for fan-out.
//! It composes the auth gate, the heartbeat wheel, the reconnection
//! coordinator, and the session store.
//!
//! Sessions attached here are mirrored in a local map and written through to
//! the store under the connection's fencing epoch. A fenced write means
//! another instance owns the session now; the local connections are closed
//! with `SESSION_REPLACED`. When the store cannot be reached, connections
//! carry on in local-only mode.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tether_core::{
    AuthError, ConnectionId, InstanceId, Result, SessionId, TenantId, TetherError, UserId,
};
use tether_protocol::{CloseReason, Message, MessageType, ProtocolCodec};
use tether_settings::TetherSettings;
use tether_store::{ClaimOutcome, Session, SessionStore, StoreError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::{self, AuthClaims, AuthGate, ResumeTokenSigner};
use crate::connection::{Connection, ConnectionState};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{
    ACTIVE_CONNECTIONS, BROADCAST_DROPS_TOTAL, CONNECTIONS_PER_TENANT, CONNECTIONS_TOTAL,
    DISCONNECTIONS_TOTAL, HEARTBEAT_MISSES_TOTAL, MESSAGES_IN_TOTAL, MESSAGES_OUT_TOTAL,
    MetricsCollector, PROTOCOL_ERRORS_TOTAL, SESSION_STORE_DEGRADED_TOTAL,
};
use crate::reconnect::{ReconnectionCoordinator, Resumed};

/// Tuning for [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// This instance, as recorded in session ownership.
    pub instance_id: InstanceId,
    /// Admission limit.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_queue_capacity: usize,
    /// Bound on one auth gate call.
    pub auth_timeout: Duration,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
    /// Consecutive malformed frames before `PROTOCOL_VIOLATION`.
    pub max_consecutive_malformed: u32,
    /// Heartbeat probe interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat wheel tick.
    pub heartbeat_tick: Duration,
    /// Unanswered probes before `HEARTBEAT_TIMEOUT`.
    pub heartbeat_missed_threshold: u32,
    /// Resume grace window.
    pub grace_window: Duration,
    /// Minimum spacing of store touches per connection.
    pub touch_interval: Duration,
    /// Cadence of the grace-window finalizer.
    pub finalize_interval: Duration,
    /// Cadence of the store TTL sweep.
    pub store_sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default(), InstanceId::new())
    }
}

impl ManagerConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &TetherSettings, instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            max_connections: settings.server.max_connections,
            outbound_queue_capacity: settings.server.outbound_queue_capacity,
            auth_timeout: settings.auth.timeout(),
            max_frame_bytes: settings.protocol.max_frame_bytes,
            max_consecutive_malformed: settings.protocol.max_consecutive_malformed,
            heartbeat_interval: settings.heartbeat.interval(),
            heartbeat_tick: settings.heartbeat.tick(),
            heartbeat_missed_threshold: settings.heartbeat.missed_threshold,
            grace_window: settings.reconnect.grace_window(),
            touch_interval: settings.store.touch_interval(),
            finalize_interval: settings.reconnect.finalize_interval(),
            store_sweep_interval: settings.store.sweep_interval(),
        }
    }
}

/// Transport side of a registered connection.
///
/// The transport drains `outbound` onto the socket and watches the
/// connection's cancel token.
#[derive(Debug)]
pub struct Registration {
    /// The registered connection.
    pub connection: Arc<Connection>,
    /// Encoded frames to write, in order.
    pub outbound: mpsc::Receiver<Arc<str>>,
    /// Token the client presents to resume this session.
    pub resume_token: String,
    /// Whether this registration resumed an existing session.
    pub resumed: bool,
    /// Session state as attached.
    pub state: Value,
}

impl Registration {
    /// Connection ID.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    /// Session ID.
    pub fn session_id(&self) -> &SessionId {
        self.connection.session_id()
    }
}

/// Fan-out target for [`ConnectionManager::broadcast`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// Every connection attached to a session.
    Session(SessionId),
    /// Every connection of a user.
    User(UserId),
}

#[derive(Clone, Debug)]
struct LocalSession {
    session: Session,
    local_only: bool,
}

/// Releases an admission slot unless committed.
struct Admission<'a> {
    admitted: &'a AtomicUsize,
    committed: bool,
}

impl Admission<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.admitted.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Registry of live connections on this instance.
pub struct ConnectionManager {
    config: ManagerConfig,
    auth: Arc<dyn AuthGate>,
    store: Arc<dyn SessionStore>,
    codec: ProtocolCodec,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectionCoordinator,
    metrics: Arc<MetricsCollector>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_session: DashMap<SessionId, HashSet<ConnectionId>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    per_tenant: DashMap<TenantId, usize>,
    sessions: DashMap<SessionId, LocalSession>,
    admitted: AtomicUsize,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Manager for this instance. Connection cancel tokens are children of
    /// `shutdown`.
    pub fn new(
        config: ManagerConfig,
        auth: Arc<dyn AuthGate>,
        store: Arc<dyn SessionStore>,
        signer: ResumeTokenSigner,
        shutdown: CancellationToken,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let heartbeat = HeartbeatMonitor::new(
            config.heartbeat_interval,
            config.heartbeat_tick,
            config.heartbeat_missed_threshold,
        );
        let reconnect = ReconnectionCoordinator::new(
            Arc::clone(&store),
            signer,
            config.instance_id.clone(),
            config.grace_window,
            Arc::clone(&metrics),
        );
        Self {
            codec: ProtocolCodec::new(config.max_frame_bytes),
            config,
            auth,
            store,
            heartbeat,
            reconnect,
            metrics,
            connections: DashMap::new(),
            by_session: DashMap::new(),
            by_user: DashMap::new(),
            per_tenant: DashMap::new(),
            sessions: DashMap::new(),
            admitted: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Metrics recorded by this manager and its components.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Heartbeat wheel.
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Reconnection coordinator.
    pub fn reconnect(&self) -> &ReconnectionCoordinator {
        &self.reconnect
    }

    /// Session store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sessions with at least one connection here.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Local copy of an attached session.
    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.get(session_id).map(|l| l.session.clone())
    }

    /// Connections matching `predicate`.
    pub fn list(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| predicate(c.value()))
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    // ── Registration ────────────────────────────────────────────────

    /// Authenticate `token` and register a new connection.
    ///
    /// The session is named by the token's session hint (or minted). An
    /// existing session is claimed at the next epoch unless it is already
    /// attached here.
    #[instrument(skip_all)]
    pub async fn register(&self, token: &str) -> Result<Registration> {
        let claims = self.authenticate(token).await?;
        let admission = self.admit()?;
        let connection_id = ConnectionId::new();
        let session_id = claims
            .session_hint
            .clone()
            .map(SessionId::from)
            .unwrap_or_default();

        let local = self.attach_session(&claims, &session_id, &connection_id).await?;
        let registration = self.finish_registration(claims, connection_id, local, false);
        admission.commit();
        Ok(registration)
    }

    /// Authenticate `token` and resume `session_id` (or the session named by
    /// the resume token) on a new connection.
    #[instrument(skip_all)]
    pub async fn resume(
        &self,
        token: &str,
        session_id: Option<&SessionId>,
        resume_token: &str,
    ) -> Result<Registration> {
        let claims = self.authenticate(token).await?;
        let session_id = match session_id {
            Some(id) => id.clone(),
            None => self.reconnect.verify_token(resume_token)?.session_id,
        };
        let admission = self.admit()?;
        let connection_id = ConnectionId::new();

        let Resumed {
            session,
            local_only,
        } = self
            .reconnect
            .attempt_resume(&session_id, resume_token, &claims.user_id, &connection_id)
            .await?;

        // a stale connection still attached here loses the session
        self.replace_session(&session_id);

        let registration = self.finish_registration(
            claims,
            connection_id,
            LocalSession {
                session,
                local_only,
            },
            true,
        );
        admission.commit();
        Ok(registration)
    }

    /// Validate a bearer token without registering anything.
    pub async fn authenticate(&self, token: &str) -> Result<AuthClaims> {
        auth::validate_with_timeout(self.auth.as_ref(), token, self.config.auth_timeout)
            .await
            .map_err(|e| {
                debug!(error = %e, "authentication failed");
                TetherError::Auth(e)
            })
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let max = self.config.max_connections;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| {
                warn!(max, "connection limit reached");
                TetherError::CapacityExceeded(max)
            })?;
        Ok(Admission {
            admitted: &self.admitted,
            committed: false,
        })
    }

    async fn attach_session(
        &self,
        claims: &AuthClaims,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<LocalSession> {
        let now = Utc::now();

        // already owned here: join without a new epoch
        let joined = self.sessions.get_mut(session_id).map(|mut local| {
            if local.session.user_id != claims.user_id {
                return Err(session_of_other_user());
            }
            local.session.reactivate(connection_id.clone(), now);
            Ok(local.clone())
        });
        if let Some(joined) = joined {
            let joined = joined?;
            self.persist(joined.clone()).await?;
            return Ok(joined);
        }

        // a fresh login supersedes any grace window held here
        let _ = self.reconnect.cancel(session_id);

        let stored = match self.store.load(session_id).await {
            Ok(stored) => Some(stored),
            Err(StoreError::NotFound(_)) => None,
            Err(e) if e.is_outage() => {
                return Ok(self.degraded_session(claims, session_id, connection_id, &e));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(mut session) = stored else {
            let mut session = Session::new(
                session_id.clone(),
                claims.user_id.clone(),
                claims.tenant_id.clone(),
                self.config.instance_id.clone(),
                now,
            );
            session.reactivate(connection_id.clone(), now);
            return match self.store.save(&session).await {
                Ok(()) => Ok(LocalSession {
                    session,
                    local_only: false,
                }),
                Err(e) if e.is_outage() => {
                    Ok(self.degraded_session(claims, session_id, connection_id, &e))
                }
                Err(e) => Err(e.into()),
            };
        };

        if session.user_id != claims.user_id {
            return Err(session_of_other_user());
        }

        let requested = session.fencing_epoch + 1;
        match self
            .store
            .claim(session_id, &self.config.instance_id, requested)
            .await
        {
            Ok(ClaimOutcome::Accepted) => {}
            Ok(ClaimOutcome::Rejected { current_epoch, .. }) => {
                return Err(TetherError::SessionOwnershipConflict {
                    session_id: session_id.clone(),
                    current_epoch,
                });
            }
            Err(e) if e.is_outage() => {
                return Ok(self.degraded_session(claims, session_id, connection_id, &e));
            }
            Err(e) => return Err(e.into()),
        }

        session.fencing_epoch = requested;
        session.owner_instance_id = self.config.instance_id.clone();
        session.connection_ids.clear();
        session.reactivate(connection_id.clone(), now);
        let local = LocalSession {
            session,
            local_only: false,
        };
        self.persist(local.clone()).await?;
        info!(%session_id, epoch = requested, "session taken over");
        Ok(local)
    }

    fn degraded_session(
        &self,
        claims: &AuthClaims,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        error: &StoreError,
    ) -> LocalSession {
        warn!(%session_id, error = %error, "session store unavailable, continuing local-only");
        self.metrics
            .increment(SESSION_STORE_DEGRADED_TOTAL, &[("op", "attach")]);
        let now = Utc::now();
        let mut session = Session::new(
            session_id.clone(),
            claims.user_id.clone(),
            claims.tenant_id.clone(),
            self.config.instance_id.clone(),
            now,
        );
        session.reactivate(connection_id.clone(), now);
        LocalSession {
            session,
            local_only: true,
        }
    }

    fn finish_registration(
        &self,
        claims: AuthClaims,
        connection_id: ConnectionId,
        local: LocalSession,
        resumed: bool,
    ) -> Registration {
        let session_id = local.session.session_id.clone();
        let epoch = local.session.fencing_epoch;
        let state = local.session.persisted_state.clone();

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let connection = Arc::new(Connection::new(
            connection_id.clone(),
            claims.user_id,
            claims.tenant_id,
            claims.roles,
            session_id.clone(),
            tx,
            self.shutdown.child_token(),
        ));
        connection.set_epoch(epoch);
        connection.set_local_only(local.local_only);

        let _ = self
            .sessions
            .entry(session_id.clone())
            .and_modify(|existing| {
                let _ = existing
                    .session
                    .connection_ids
                    .insert(connection_id.clone());
            })
            .or_insert(local);

        let _ = self
            .connections
            .insert(connection_id.clone(), Arc::clone(&connection));
        self.index(&connection);
        self.heartbeat.start(connection_id.clone());
        connection.set_state(ConnectionState::Active);

        self.metrics.increment(CONNECTIONS_TOTAL, &[]);
        self.observe_counts(&connection.tenant_id);
        info!(
            connection_id = %connection_id,
            session_id = %session_id,
            user_id = %connection.user_id,
            epoch,
            resumed,
            local_only = connection.is_local_only(),
            "connection registered"
        );

        Registration {
            resume_token: self.reconnect.issue_token(&session_id, epoch),
            connection,
            outbound: rx,
            resumed,
            state,
        }
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Queue `message` for one connection, waiting for queue space.
    pub async fn send(&self, id: &ConnectionId, message: &Message) -> Result<()> {
        let conn = self.live(id)?;
        let text = self.encode(message)?;
        if conn.send(text).await {
            self.metrics.increment(MESSAGES_OUT_TOTAL, &[]);
            Ok(())
        } else {
            Err(TetherError::ConnectionNotFound(id.clone()))
        }
    }

    /// Queue `message` on every connection of `target` without waiting.
    ///
    /// Returns how many connections accepted it. Full queues drop the
    /// message for that connection and count it.
    pub fn broadcast(&self, target: &BroadcastTarget, message: &Message) -> Result<usize> {
        let ids: Vec<ConnectionId> = match target {
            BroadcastTarget::Session(s) => self
                .by_session
                .get(s)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            BroadcastTarget::User(u) => self
                .by_user
                .get(u)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let text = self.encode(message)?;
        let mut delivered = 0usize;
        let mut dropped = 0u64;
        for id in ids {
            let Some(conn) = self.get(&id) else { continue };
            if conn.state() != ConnectionState::Active {
                continue;
            }
            if conn.try_send(Arc::clone(&text)) {
                delivered += 1;
            } else {
                dropped += 1;
                warn!(connection_id = %id, "outbound queue full, broadcast dropped");
            }
        }
        self.metrics
            .increment_by(MESSAGES_OUT_TOTAL, delivered as u64, &[]);
        self.metrics.increment_by(BROADCAST_DROPS_TOTAL, dropped, &[]);
        debug!(?target, delivered, dropped, "broadcast");
        Ok(delivered)
    }

    fn encode(&self, message: &Message) -> Result<Arc<str>> {
        Ok(Arc::from(self.codec.encode_text(message)?))
    }

    fn live(&self, id: &ConnectionId) -> Result<Arc<Connection>> {
        self.get(id)
            .filter(|c| c.state() == ConnectionState::Active)
            .ok_or_else(|| TetherError::ConnectionNotFound(id.clone()))
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Decode and handle one inbound frame.
    ///
    /// Control messages (`ping`, `pong`) are answered or fed to the
    /// heartbeat here and yield `None`. Application messages are returned.
    /// A malformed frame is answered with an `error` message; too many in a
    /// row close the connection with `PROTOCOL_VIOLATION`.
    #[instrument(skip(self, bytes), fields(connection_id = %id, correlation_id = tracing::field::Empty))]
    pub async fn handle_inbound(&self, id: &ConnectionId, bytes: &[u8]) -> Result<Option<Message>> {
        let conn = self.live(id)?;

        let message = match self.codec.decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                let reason = e.reason_code();
                self.metrics
                    .increment(PROTOCOL_ERRORS_TOTAL, &[("reason", reason)]);
                let streak = conn.record_malformed();
                warn!(reason, streak, error = %e, "malformed inbound frame");

                if let Ok(text) = self.encode(&Message::error(reason, e.to_string(), None)) {
                    if conn.try_send(text) {
                        self.metrics.increment(MESSAGES_OUT_TOTAL, &[]);
                    }
                }
                if streak >= self.config.max_consecutive_malformed {
                    let _ = self.disconnect(id, CloseReason::ProtocolViolation).await;
                }
                return Ok(None);
            }
        };

        if let Some(corr) = &message.correlation_id {
            let _ = tracing::Span::current().record("correlation_id", corr.as_str());
        }
        conn.reset_malformed();
        let kind = if message.message_type.is_generic() {
            "generic"
        } else {
            message.message_type.as_str()
        };
        self.metrics.increment(MESSAGES_IN_TOTAL, &[("type", kind)]);
        self.touch_if_due(&conn).await;

        match &message.message_type {
            MessageType::Ping => {
                self.send(id, &Message::pong(message.correlation_id.clone()))
                    .await?;
                Ok(None)
            }
            MessageType::Pong => {
                self.on_pong(id);
                Ok(None)
            }
            MessageType::PresenceUpdate => {
                let presence = message.payload.clone();
                if let Err(e) = self
                    .update_state(conn.session_id(), |state| set_field(state, "presence", presence))
                    .await
                {
                    debug!(error = %e, "presence not persisted");
                }
                Ok(Some(message))
            }
            _ => Ok(Some(message)),
        }
    }

    /// Record a heartbeat answer (application `pong` or transport pong).
    pub fn on_pong(&self, id: &ConnectionId) {
        if self.heartbeat.on_pong(id) {
            if let Some(conn) = self.get(id) {
                conn.mark_heartbeat();
            }
        }
    }

    async fn touch_if_due(&self, conn: &Connection) {
        if conn.is_local_only() || !conn.touch_due(self.config.touch_interval, Instant::now()) {
            return;
        }
        let session_id = conn.session_id();
        match self.store.touch(session_id).await {
            Ok(()) => {
                if let Some(mut local) = self.sessions.get_mut(session_id) {
                    local.session.last_active_at = Utc::now();
                }
            }
            Err(StoreError::NotFound(_)) => {
                // TTL lapsed under us; write the record back
                if let Some(local) = self.sessions.get(session_id).map(|l| l.clone()) {
                    let _ = self.persist(local).await;
                }
            }
            Err(e) if e.is_outage() => {
                warn!(%session_id, error = %e, "session touch failed");
                self.metrics
                    .increment(SESSION_STORE_DEGRADED_TOTAL, &[("op", "touch")]);
            }
            Err(e) => warn!(%session_id, error = %e, "session touch failed"),
        }
    }

    // ── Session state ───────────────────────────────────────────────

    /// Mutate a locally attached session's persisted state and write it
    /// through under the session's epoch.
    pub async fn update_state(
        &self,
        session_id: &SessionId,
        update: impl FnOnce(&mut Value),
    ) -> Result<()> {
        let snapshot = {
            let mut local = self.sessions.get_mut(session_id).ok_or_else(|| {
                TetherError::Internal(format!("session {session_id} is not attached here"))
            })?;
            update(&mut local.session.persisted_state);
            local.session.last_active_at = Utc::now();
            local.clone()
        };
        self.persist(snapshot).await
    }

    async fn persist(&self, local: LocalSession) -> Result<()> {
        if local.local_only {
            return Ok(());
        }
        let session_id = local.session.session_id.clone();
        match self.store.save(&local.session).await {
            Ok(()) => Ok(()),
            Err(e @ StoreError::Fenced { .. }) => {
                warn!(%session_id, error = %e, "session owned elsewhere");
                self.replace_session(&session_id);
                Err(e.into())
            }
            Err(e) if e.is_outage() => {
                warn!(%session_id, error = %e, "session write skipped, store unavailable");
                self.metrics
                    .increment(SESSION_STORE_DEGRADED_TOTAL, &[("op", "save")]);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close every local connection of `session_id` with `SESSION_REPLACED`
    /// and forget the local copy. Nothing is written.
    fn replace_session(&self, session_id: &SessionId) {
        let _ = self.sessions.remove(session_id);
        let ids: Vec<ConnectionId> = self
            .by_session
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            let _ = self.evict(&id, CloseReason::SessionReplaced);
        }
    }

    // ── Disconnect ──────────────────────────────────────────────────

    /// Close a connection.
    ///
    /// Cancels its tasks (the transport flushes what is queued, then sends
    /// a close frame with `reason`) and detaches it from its session. If it
    /// was the session's last connection and `reason` allows resume, the
    /// session enters its grace window.
    #[instrument(skip(self), fields(connection_id = %id, reason = %reason))]
    pub async fn disconnect(&self, id: &ConnectionId, reason: CloseReason) -> Result<()> {
        let conn = self
            .evict(id, reason)
            .ok_or_else(|| TetherError::ConnectionNotFound(id.clone()))?;
        if reason != CloseReason::SessionReplaced {
            self.detach_session(&conn, reason).await;
        }
        conn.set_state(ConnectionState::Closed);
        Ok(())
    }

    /// Remove from the registry and indexes, synchronously.
    fn evict(&self, id: &ConnectionId, reason: CloseReason) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        let _ = conn.begin_close(reason);
        let _ = self.heartbeat.stop(id);
        self.unindex(&conn);
        let _ = self.admitted.fetch_sub(1, Ordering::AcqRel);

        self.metrics
            .increment(DISCONNECTIONS_TOTAL, &[("reason", reason.as_str())]);
        self.observe_counts(&conn.tenant_id);
        info!(
            connection_id = %id,
            session_id = %conn.session_id(),
            reason = %reason,
            dropped = conn.drop_count(),
            "connection closed"
        );
        Some(conn)
    }

    async fn detach_session(&self, conn: &Connection, reason: CloseReason) {
        let session_id = conn.session_id();
        let now = Utc::now();
        let snapshot = self.sessions.get_mut(session_id).map(|mut local| {
            let _ = local.session.connection_ids.remove(&conn.id);
            local.session.last_active_at = now;
            local.clone()
        });
        let Some(snapshot) = snapshot else { return };

        if !snapshot.session.connection_ids.is_empty() {
            let _ = self.persist(snapshot).await;
            return;
        }

        let Some((_, last)) = self
            .sessions
            .remove_if(session_id, |_, l| l.session.connection_ids.is_empty())
        else {
            // someone joined in between
            return;
        };

        if reason.allows_resume() {
            if let Err(e) = self.reconnect.begin_grace(last.session, last.local_only).await {
                debug!(%session_id, error = %e, "no grace window");
            }
        } else {
            self.finalize_session(last, reason).await;
        }
    }

    /// Drop a session whose last connection closed for a terminal reason, so
    /// its resume tokens stop working. A newer epoch in the store belongs to
    /// another owner and is left alone.
    async fn finalize_session(&self, local: LocalSession, reason: CloseReason) {
        let session_id = &local.session.session_id;
        let _ = self.reconnect.cancel(session_id);
        if local.local_only {
            return;
        }
        match self.store.load(session_id).await {
            Ok(stored) if stored.fencing_epoch > local.session.fencing_epoch => {
                debug!(%session_id, epoch = stored.fencing_epoch, "session owned elsewhere, not finalizing");
                return;
            }
            Err(StoreError::NotFound(_)) => return,
            Ok(_) | Err(_) => {}
        }
        match self.store.remove(session_id).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {
                info!(%session_id, %reason, "session finalized");
            }
            Err(e) => {
                // the store TTL sweep evicts it eventually
                warn!(%session_id, error = %e, "could not finalize session");
                self.metrics
                    .increment(SESSION_STORE_DEGRADED_TOTAL, &[("op", "remove")]);
            }
        }
    }

    /// Close every connection with `SERVER_SHUTDOWN`.
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        info!(connections = ids.len(), "closing all connections");
        for id in ids {
            let _ = self.disconnect(&id, CloseReason::ServerShutdown).await;
        }
    }

    // ── Background work ─────────────────────────────────────────────

    /// Process one wheel tick: probe stale connections, evict dead ones.
    pub async fn heartbeat_sweep(&self) {
        let outcome = self.heartbeat.tick();
        if outcome.missed > 0 {
            self.metrics
                .increment_by(HEARTBEAT_MISSES_TOTAL, outcome.missed as u64, &[]);
        }
        if !outcome.probes.is_empty() {
            if let Ok(ping) = self.encode(&Message::ping()) {
                for id in &outcome.probes {
                    if let Some(conn) = self.get(id) {
                        if conn.try_send(Arc::clone(&ping)) {
                            self.metrics.increment(MESSAGES_OUT_TOTAL, &[]);
                        }
                    }
                }
            }
        }
        for id in &outcome.expired {
            warn!(connection_id = %id, "heartbeat timeout");
            let _ = self.disconnect(id, CloseReason::HeartbeatTimeout).await;
        }
    }

    /// Drive the heartbeat wheel until shutdown.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_sweep().await,
            }
        }
        debug!("heartbeat sweeper stopped");
    }

    /// Finalize lapsed grace windows and sweep expired store records until
    /// shutdown.
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut finalize = tokio::time::interval(self.config.finalize_interval);
        let mut sweep = tokio::time::interval(self.config.store_sweep_interval);
        finalize.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = finalize.tick() => {
                    let done = self.reconnect.finalize_expired().await;
                    if !done.is_empty() {
                        debug!(count = done.len(), "grace windows finalized");
                    }
                }
                _ = sweep.tick() => match self.store.expire_sweep().await {
                    Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "expired sessions swept"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "session sweep failed"),
                },
            }
        }
        debug!("maintenance stopped");
    }

    /// Spawn the heartbeat and maintenance tasks.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_heartbeat()),
            tokio::spawn(Arc::clone(self).run_maintenance()),
        ]
    }

    // ── Indexes ─────────────────────────────────────────────────────

    fn index(&self, conn: &Connection) {
        let _ = self
            .by_session
            .entry(conn.session_id().clone())
            .or_default()
            .insert(conn.id.clone());
        let _ = self
            .by_user
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.id.clone());
        *self.per_tenant.entry(conn.tenant_id.clone()).or_insert(0) += 1;
    }

    fn unindex(&self, conn: &Connection) {
        if let Some(mut set) = self.by_session.get_mut(conn.session_id()) {
            let _ = set.remove(&conn.id);
        }
        let _ = self
            .by_session
            .remove_if(conn.session_id(), |_, set| set.is_empty());

        if let Some(mut set) = self.by_user.get_mut(&conn.user_id) {
            let _ = set.remove(&conn.id);
        }
        let _ = self.by_user.remove_if(&conn.user_id, |_, set| set.is_empty());

        if let Some(mut n) = self.per_tenant.get_mut(&conn.tenant_id) {
            *n = n.saturating_sub(1);
        }
        let _ = self.per_tenant.remove_if(&conn.tenant_id, |_, n| *n == 0);
    }

    fn observe_counts(&self, tenant_id: &TenantId) {
        self.metrics
            .observe(ACTIVE_CONNECTIONS, self.connections.len() as f64, &[]);
        let n = self.per_tenant.get(tenant_id).map_or(0, |n| *n);
        self.metrics.observe(
            CONNECTIONS_PER_TENANT,
            n as f64,
            &[("tenant", tenant_id.as_str())],
        );
    }
}

fn session_of_other_user() -> TetherError {
    TetherError::Auth(AuthError::Rejected("session belongs to another user".into()))
}

fn set_field(state: &mut Value, key: &str, value: Value) {
    match state {
        Value::Object(map) => {
            let _ = map.insert(key.to_owned(), value);
        }
        other => *other = json!({ key: value }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tether_store::{MemorySessionStore, SessionStatus};

    /// Accepts `user:tenant[:hint]`.
    struct TestGate;

    #[async_trait]
    impl AuthGate for TestGate {
        async fn validate(&self, token: &str) -> std::result::Result<AuthClaims, AuthError> {
            let mut parts = token.split(':');
            match (parts.next(), parts.next()) {
                (Some(user), Some(tenant)) if !user.is_empty() && !tenant.is_empty() => {
                    Ok(AuthClaims {
                        user_id: user.into(),
                        tenant_id: tenant.into(),
                        roles: vec![],
                        session_hint: parts.next().map(str::to_owned),
                    })
                }
                _ => Err(AuthError::Rejected("bad token".into())),
            }
        }
    }

    /// Fails every call as an outage.
    struct DownStore;

    #[async_trait]
    impl SessionStore for DownStore {
        async fn save(&self, _: &Session) -> tether_store::Result<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn load(&self, _: &SessionId) -> tether_store::Result<Session> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn claim(
            &self,
            _: &SessionId,
            _: &InstanceId,
            _: u64,
        ) -> tether_store::Result<ClaimOutcome> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn touch(&self, _: &SessionId) -> tether_store::Result<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn expire_sweep(&self) -> tether_store::Result<Vec<SessionId>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn remove(&self, _: &SessionId) -> tether_store::Result<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn config(instance: &str) -> ManagerConfig {
        ManagerConfig {
            instance_id: instance.into(),
            max_connections: 100,
            outbound_queue_capacity: 8,
            max_consecutive_malformed: 3,
            ..ManagerConfig::default()
        }
    }

    fn manager_with(store: Arc<dyn SessionStore>, config: ManagerConfig) -> ConnectionManager {
        let signer = ResumeTokenSigner::new(b"k", Duration::from_secs(3600)).unwrap();
        ConnectionManager::new(
            config,
            Arc::new(TestGate),
            store,
            signer,
            CancellationToken::new(),
        )
    }

    fn manager() -> (ConnectionManager, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        (manager_with(store.clone(), config("inst_a")), store)
    }

    fn decode(text: &str) -> Message {
        ProtocolCodec::default().decode(text.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn register_activates_and_persists_session() {
        let (m, store) = manager();
        let reg = m.register("u1:t1:device-1").await.unwrap();

        assert_eq!(reg.connection.state(), ConnectionState::Active);
        assert_eq!(reg.session_id().as_str(), "device-1");
        assert!(!reg.resumed);
        assert_eq!(m.len(), 1);
        assert_eq!(m.heartbeat().len(), 1);

        let stored = store.load(&"device-1".into()).await.unwrap();
        assert_eq!(stored.fencing_epoch, 1);
        assert!(stored.connection_ids.contains(reg.connection_id()));
        assert_eq!(m.metrics().get(ACTIVE_CONNECTIONS), Some(1.0));
        assert_eq!(
            m.metrics().get("connections_per_tenant{tenant=\"t1\"}"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let (m, _) = manager();
        let mut seen = HashSet::new();
        let mut regs = Vec::new();
        for i in 0..50 {
            let reg = m.register(&format!("u{i}:t1")).await.unwrap();
            assert!(seen.insert(reg.connection_id().clone()));
            regs.push(reg);
        }
        assert_eq!(m.len(), 50);
    }

    #[tokio::test]
    async fn bad_token_is_auth_error() {
        let (m, _) = manager();
        assert_matches!(m.register("nope").await, Err(TetherError::Auth(_)));
        assert_matches!(
            m.register("").await,
            Err(TetherError::Auth(AuthError::MissingToken))
        );
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn admission_limit_rejects_and_frees_slots() {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        let m = manager_with(
            store,
            ManagerConfig {
                max_connections: 2,
                ..config("inst_a")
            },
        );
        let a = m.register("u1:t1").await.unwrap();
        let _b = m.register("u2:t1").await.unwrap();
        assert_matches!(
            m.register("u3:t1").await,
            Err(TetherError::CapacityExceeded(2))
        );
        // a failed auth does not leak a slot either
        assert!(m.register("bad").await.is_err());

        m.disconnect(a.connection_id(), CloseReason::Normal)
            .await
            .unwrap();
        assert!(m.register("u3:t1").await.is_ok());
    }

    #[tokio::test]
    async fn send_is_ordered_and_missing_target_errors() {
        let (m, _) = manager();
        let mut reg = m.register("u1:t1").await.unwrap();
        let id = reg.connection_id().clone();

        for i in 0..3 {
            m.send(&id, &Message::notification("tick", json!({"n": i})))
                .await
                .unwrap();
        }
        for i in 0..3 {
            let msg = decode(&reg.outbound.recv().await.unwrap());
            assert_eq!(msg.payload["n"], i);
        }

        assert_matches!(
            m.send(&"conn_ghost".into(), &Message::ping()).await,
            Err(TetherError::ConnectionNotFound(_))
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_session_and_user() {
        let (m, _) = manager();
        let mut a = m.register("u1:t1:phone").await.unwrap();
        let mut b = m.register("u1:t1:phone").await.unwrap();
        let mut c = m.register("u1:t1:laptop").await.unwrap();
        let mut other = m.register("u2:t1").await.unwrap();
        assert_eq!(a.session_id(), b.session_id());

        let msg = Message::notification("hello", Value::Null);
        let n = m
            .broadcast(&BroadcastTarget::Session("phone".into()), &msg)
            .unwrap();
        assert_eq!(n, 2);
        assert!(a.outbound.try_recv().is_ok());
        assert!(b.outbound.try_recv().is_ok());
        assert!(c.outbound.try_recv().is_err());

        let n = m
            .broadcast(&BroadcastTarget::User("u1".into()), &msg)
            .unwrap();
        assert_eq!(n, 3);
        assert!(other.outbound.try_recv().is_err());

        let none = m
            .broadcast(&BroadcastTarget::User("nobody".into()), &msg)
            .unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn broadcast_counts_drops_on_full_queue() {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        let m = manager_with(
            store,
            ManagerConfig {
                outbound_queue_capacity: 1,
                ..config("inst_a")
            },
        );
        let reg = m.register("u1:t1").await.unwrap();
        let msg = Message::notification("x", Value::Null);
        let target = BroadcastTarget::User("u1".into());
        assert_eq!(m.broadcast(&target, &msg).unwrap(), 1);
        assert_eq!(m.broadcast(&target, &msg).unwrap(), 0);
        assert_eq!(reg.connection.drop_count(), 1);
        assert_eq!(m.metrics().get(BROADCAST_DROPS_TOTAL), Some(1.0));
    }

    #[tokio::test]
    async fn list_filters() {
        let (m, _) = manager();
        let _a = m.register("u1:acme").await.unwrap();
        let _b = m.register("u2:acme").await.unwrap();
        let _c = m.register("u3:globex").await.unwrap();
        assert_eq!(m.list(|c| c.tenant_id.as_str() == "acme").len(), 2);
        assert_eq!(m.list(|_| true).len(), 3);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (m, _) = manager();
        let mut reg = m.register("u1:t1").await.unwrap();
        let out = m
            .handle_inbound(
                reg.connection_id(),
                br#"{"type":"ping","payload":null,"correlation_id":"c-9"}"#,
            )
            .await
            .unwrap();
        assert!(out.is_none());
        let pong = decode(&reg.outbound.recv().await.unwrap());
        assert_eq!(pong.message_type, MessageType::Pong);
        assert_eq!(pong.correlation_id.as_deref(), Some("c-9"));
    }

    #[tokio::test]
    async fn pong_feeds_heartbeat() {
        let (m, _) = manager();
        let reg = m.register("u1:t1").await.unwrap();
        let out = m
            .handle_inbound(reg.connection_id(), br#"{"type":"pong"}"#)
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(
            m.heartbeat()
                .record(reg.connection_id())
                .unwrap()
                .missed_count,
            0
        );
    }

    #[tokio::test]
    async fn unknown_type_is_generic_not_error() {
        let (m, _) = manager();
        let mut reg = m.register("u1:t1").await.unwrap();
        let out = m
            .handle_inbound(reg.connection_id(), br#"{"type":"bogus"}"#)
            .await
            .unwrap()
            .unwrap();
        assert!(out.message_type.is_generic());
        assert_eq!(out.message_type.as_str(), "bogus");
        assert!(reg.outbound.try_recv().is_err());
        assert_eq!(
            m.metrics().get("messages_in_total{type=\"generic\"}"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply_and_stays_open() {
        let (m, _) = manager();
        let mut reg = m.register("u1:t1").await.unwrap();
        let out = m
            .handle_inbound(reg.connection_id(), b"{not json")
            .await
            .unwrap();
        assert!(out.is_none());

        let reply = decode(&reg.outbound.recv().await.unwrap());
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.payload["code"], "MALFORMED_JSON");
        assert_eq!(reg.connection.state(), ConnectionState::Active);
        assert_eq!(
            m.metrics()
                .get("protocol_errors_total{reason=\"MALFORMED_JSON\"}"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn malformed_streak_closes_with_protocol_violation() {
        let (m, _) = manager();
        let reg = m.register("u1:t1").await.unwrap();
        let id = reg.connection_id().clone();

        // a valid frame in between resets the streak
        let _ = m.handle_inbound(&id, b"x").await.unwrap();
        let _ = m.handle_inbound(&id, b"x").await.unwrap();
        let _ = m.handle_inbound(&id, br#"{"type":"typing_indicator"}"#).await.unwrap();
        let _ = m.handle_inbound(&id, b"x").await.unwrap();
        let _ = m.handle_inbound(&id, b"x").await.unwrap();
        assert!(m.get(&id).is_some());

        let _ = m.handle_inbound(&id, b"x").await.unwrap();
        assert!(m.get(&id).is_none());
        assert_eq!(
            reg.connection.close_reason(),
            Some(CloseReason::ProtocolViolation)
        );
        assert!(reg.connection.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn presence_update_is_persisted() {
        let (m, store) = manager();
        let reg = m.register("u1:t1:dev").await.unwrap();
        let _ = m
            .handle_inbound(
                reg.connection_id(),
                br#"{"type":"presence_update","payload":{"status":"away"}}"#,
            )
            .await
            .unwrap();
        let stored = store.load(&"dev".into()).await.unwrap();
        assert_eq!(stored.persisted_state["presence"]["status"], "away");
    }

    #[tokio::test]
    async fn involuntary_drop_enters_grace_and_normal_close_finalizes() {
        let (m, store) = manager();
        let a = m.register("u1:t1:s-a").await.unwrap();
        let b = m.register("u2:t1:s-b").await.unwrap();
        let b_token = b.resume_token.clone();

        m.disconnect(a.connection_id(), CloseReason::GoingAway)
            .await
            .unwrap();
        m.disconnect(b.connection_id(), CloseReason::Normal)
            .await
            .unwrap();

        assert_eq!(
            store.load(&"s-a".into()).await.unwrap().status,
            SessionStatus::PendingReconnect
        );
        assert!(m.reconnect().deadline(&"s-a".into()).is_some());
        assert_matches!(store.load(&"s-b".into()).await, Err(StoreError::NotFound(_)));
        assert!(m.reconnect().deadline(&"s-b".into()).is_none());
        assert_eq!(m.session_count(), 0);
        assert_eq!(a.connection.state(), ConnectionState::Closed);

        assert_matches!(
            m.resume("u2:t1", None, &b_token).await,
            Err(TetherError::ReconnectionWindowExpired(_))
        );
    }

    #[tokio::test]
    async fn protocol_violation_close_cannot_be_resumed() {
        let (m, store) = manager();
        let reg = m.register("u1:t1:dev").await.unwrap();
        let token = reg.resume_token.clone();
        let id = reg.connection_id().clone();

        while m.get(&id).is_some() {
            let _ = m.handle_inbound(&id, b"{broken").await.unwrap();
        }
        assert_eq!(
            reg.connection.close_reason(),
            Some(CloseReason::ProtocolViolation)
        );
        assert_matches!(store.load(&"dev".into()).await, Err(StoreError::NotFound(_)));
        assert_matches!(
            m.resume("u1:t1", None, &token).await,
            Err(TetherError::ReconnectionWindowExpired(_))
        );
        assert_eq!(m.len(), 0);
    }

    #[tokio::test]
    async fn terminal_close_keeps_session_taken_over_elsewhere() {
        let (m, store) = manager();
        let reg = m.register("u1:t1:dev").await.unwrap();
        assert_eq!(
            store.claim(&"dev".into(), &"inst_b".into(), 2).await.unwrap(),
            ClaimOutcome::Accepted
        );

        m.disconnect(reg.connection_id(), CloseReason::Normal)
            .await
            .unwrap();
        let stored = store.load(&"dev".into()).await.unwrap();
        assert_eq!(stored.fencing_epoch, 2);
        assert_eq!(stored.owner_instance_id.as_str(), "inst_b");
    }

    #[tokio::test]
    async fn disconnect_twice_is_not_found() {
        let (m, _) = manager();
        let reg = m.register("u1:t1").await.unwrap();
        m.disconnect(reg.connection_id(), CloseReason::Normal)
            .await
            .unwrap();
        assert_matches!(
            m.disconnect(reg.connection_id(), CloseReason::Normal).await,
            Err(TetherError::ConnectionNotFound(_))
        );
        assert_eq!(
            m.metrics()
                .get("disconnections_total{reason=\"NORMAL_CLOSURE\"}"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn resume_restores_session_and_state() {
        let (m, _) = manager();
        let reg = m.register("u1:t1:dev").await.unwrap();
        m.update_state(reg.session_id(), |s| {
            set_field(s, "subscriptions", json!(["room:1", "room:2"]));
        })
        .await
        .unwrap();
        let token = reg.resume_token.clone();
        m.disconnect(reg.connection_id(), CloseReason::GoingAway)
            .await
            .unwrap();

        let resumed = m.resume("u1:t1", None, &token).await.unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.session_id().as_str(), "dev");
        assert_eq!(resumed.state["subscriptions"], json!(["room:1", "room:2"]));
        assert_eq!(resumed.connection.epoch(), 2);
        assert_ne!(resumed.resume_token, token);
        assert_eq!(m.metrics().get("reconnection_success_total"), Some(1.0));
    }

    #[tokio::test]
    async fn resume_takes_over_stale_local_connection() {
        let (m, _) = manager();
        let old = m.register("u1:t1:dev").await.unwrap();
        // half-open socket: never disconnected
        let new = m.resume("u1:t1", None, &old.resume_token).await.unwrap();
        assert_eq!(
            old.connection.close_reason(),
            Some(CloseReason::SessionReplaced)
        );
        assert!(m.get(old.connection_id()).is_none());
        assert_eq!(m.session(new.session_id()).unwrap().fencing_epoch, 2);
    }

    #[tokio::test]
    async fn second_instance_takes_over_and_first_is_fenced() {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        let a = manager_with(store.clone(), config("inst_a"));
        let b = manager_with(store.clone(), config("inst_b"));

        let on_a = a.register("u1:t1:dev").await.unwrap();
        let on_b = b.register("u1:t1:dev").await.unwrap();
        assert_eq!(on_b.connection.epoch(), 2);

        // A's next write is fenced and its connection replaced
        let result = a
            .update_state(on_a.session_id(), |s| set_field(s, "k", json!(1)))
            .await;
        assert_matches!(
            result,
            Err(TetherError::SessionOwnershipConflict {
                current_epoch: 2,
                ..
            })
        );
        assert_eq!(
            on_a.connection.close_reason(),
            Some(CloseReason::SessionReplaced)
        );
        assert!(a.is_empty());
        assert_eq!(
            store.load(&"dev".into()).await.unwrap().owner_instance_id.as_str(),
            "inst_b"
        );
    }

    #[tokio::test]
    async fn other_users_session_is_refused() {
        let (m, _) = manager();
        let _a = m.register("u1:t1:shared").await.unwrap();
        assert_matches!(
            m.register("u2:t1:shared").await,
            Err(TetherError::Auth(AuthError::Rejected(_)))
        );
    }

    #[tokio::test]
    async fn store_outage_degrades_to_local_only() {
        let m = manager_with(Arc::new(DownStore), config("inst_a"));
        let mut reg = m.register("u1:t1:dev").await.unwrap();
        assert!(reg.connection.is_local_only());
        assert_eq!(reg.connection.state(), ConnectionState::Active);
        assert_eq!(
            m.metrics()
                .get("session_store_degraded_total{op=\"attach\"}"),
            Some(1.0)
        );

        // traffic still flows
        let _ = m
            .handle_inbound(reg.connection_id(), br#"{"type":"ping"}"#)
            .await
            .unwrap();
        assert!(reg.outbound.recv().await.is_some());

        // and the session can be resumed from local state
        let token = reg.resume_token.clone();
        m.disconnect(reg.connection_id(), CloseReason::GoingAway)
            .await
            .unwrap();
        let resumed = m.resume("u1:t1", None, &token).await.unwrap();
        assert!(resumed.connection.is_local_only());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_evicted_with_heartbeat_timeout() {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        let m = manager_with(
            store,
            ManagerConfig {
                heartbeat_interval: Duration::from_secs(3),
                heartbeat_tick: Duration::from_secs(1),
                heartbeat_missed_threshold: 3,
                ..config("inst_a")
            },
        );
        let mut reg = m.register("u1:t1").await.unwrap();

        let mut pings = 0;
        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
            m.heartbeat_sweep().await;
            while let Ok(text) = reg.outbound.try_recv() {
                if decode(&text).message_type == MessageType::Ping {
                    pings += 1;
                }
            }
            if m.get(reg.connection_id()).is_none() {
                break;
            }
        }
        assert_eq!(pings, 3);
        assert_eq!(
            reg.connection.close_reason(),
            Some(CloseReason::HeartbeatTimeout)
        );
        assert_eq!(m.metrics().get(HEARTBEAT_MISSES_TOTAL), Some(3.0));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (m, _) = manager();
        let a = m.register("u1:t1").await.unwrap();
        let _b = m.register("u2:t1").await.unwrap();
        m.shutdown().await;
        assert!(m.is_empty());
        assert_eq!(a.connection.close_reason(), Some(CloseReason::ServerShutdown));
    }
}

//! Per-connection state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::{ConnectionId, SessionId, TenantId, UserId};
use tether_protocol::CloseReason;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle.
///
/// `Connecting → Authenticated → Active → Closing → Closed`; any state may
/// jump to `Closing`. Closed connections are already out of the registry.
///
/// `Connecting` covers the HTTP handshake, before the auth gate answers. No
/// [`Connection`] exists yet in that phase, so a registered connection never
/// reports it; the variant names the phase in the shared vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Handshake received, not yet validated. Transport-side only.
    Connecting,
    /// Auth gate accepted the token.
    Authenticated,
    /// Attached to a session; traffic flows.
    Active,
    /// Close decided; outbound queue draining.
    Closing,
    /// Gone.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "CONNECTING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Active => "ACTIVE",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// A registered client connection.
pub struct Connection {
    /// Unique (per instance) connection ID.
    pub id: ConnectionId,
    /// Authenticated user.
    pub user_id: UserId,
    /// User's tenant.
    pub tenant_id: TenantId,
    /// Roles from the auth gate.
    pub roles: Vec<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    session_id: SessionId,
    state: Mutex<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    last_heartbeat_at: Mutex<DateTime<Utc>>,
    last_touch: Mutex<Option<Instant>>,
    metadata: Mutex<HashMap<String, String>>,
    epoch: AtomicU64,
    local_only: AtomicBool,
    malformed_streak: AtomicU32,
    dropped_messages: AtomicU64,
    tx: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// New connection in `Authenticated` state.
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        tenant_id: TenantId,
        roles: Vec<String>,
        session_id: SessionId,
        tx: mpsc::Sender<Arc<str>>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            tenant_id,
            roles,
            created_at: now,
            session_id,
            state: Mutex::new(ConnectionState::Authenticated),
            close_reason: Mutex::new(None),
            last_heartbeat_at: Mutex::new(now),
            last_touch: Mutex::new(None),
            metadata: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            local_only: AtomicBool::new(false),
            malformed_streak: AtomicU32::new(0),
            dropped_messages: AtomicU64::new(0),
            tx,
            cancel,
        }
    }

    /// Session this connection is attached to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Move to `Closing` with `reason` and cancel the connection's tasks.
    ///
    /// Returns `false` if the connection was already closing.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            *state = ConnectionState::Closing;
        }
        *self.close_reason.lock() = Some(reason);
        self.cancel.cancel();
        true
    }

    /// Why the connection is closing, once decided.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Cancellation shared with the transport tasks.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fencing epoch the connection's writes carry.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Whether the session store was unreachable when this connection attached.
    pub fn is_local_only(&self) -> bool {
        self.local_only.load(Ordering::Relaxed)
    }

    pub(crate) fn set_local_only(&self, local_only: bool) {
        self.local_only.store(local_only, Ordering::Relaxed);
    }

    /// Last accepted pong.
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        *self.last_heartbeat_at.lock()
    }

    pub(crate) fn mark_heartbeat(&self) {
        *self.last_heartbeat_at.lock() = Utc::now();
    }

    /// Returns `true` (and records `now`) when at least `every` has passed
    /// since the previous touch.
    pub(crate) fn touch_due(&self, every: std::time::Duration, now: Instant) -> bool {
        let mut last = self.last_touch.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < every => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Count a malformed frame; returns the current streak.
    pub(crate) fn record_malformed(&self) -> u32 {
        self.malformed_streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_malformed(&self) {
        self.malformed_streak.store(0, Ordering::Relaxed);
    }

    /// Consecutive malformed frames.
    pub fn malformed_streak(&self) -> u32 {
        self.malformed_streak.load(Ordering::Relaxed)
    }

    /// Total outbound messages dropped on a full queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Set a metadata entry.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.metadata.lock().insert(key.into(), value.into());
    }

    /// Copy of the metadata map.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.metadata.lock().clone()
    }

    /// Enqueue without waiting. Counts a drop on a full or closed queue.
    pub(crate) fn try_send(&self, text: Arc<str>) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Enqueue, waiting for room. Returns `false` if the connection closed first.
    pub(crate) async fn send(&self, text: Arc<str>) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(text) => sent.is_ok(),
        }
    }
}

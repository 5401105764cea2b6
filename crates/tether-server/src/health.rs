//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;
use tether_core::InstanceId;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has begun.
    pub status: String,
    /// This instance.
    pub instance_id: InstanceId,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Sessions with a live connection here.
    pub active_sessions: usize,
    /// Sessions waiting in their grace window.
    pub pending_reconnects: usize,
}

/// Live counters behind a [`HealthResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCounts {
    /// Registered connections.
    pub connections: usize,
    /// Sessions with a live connection here.
    pub sessions: usize,
    /// Sessions in their grace window.
    pub pending: usize,
}

/// Build a health response.
pub fn health_check(
    instance_id: &InstanceId,
    start_time: Instant,
    counts: HealthCounts,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        instance_id: instance_id.clone(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: counts.connections,
        active_sessions: counts.sessions,
        pending_reconnects: counts.pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_draining() {
        let id = InstanceId::from("inst_a");
        assert_eq!(health_check(&id, Instant::now(), HealthCounts::default(), false).status, "ok");
        assert_eq!(health_check(&id, Instant::now(), HealthCounts::default(), true).status, "draining");
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(&"inst_a".into(), start, HealthCounts::default(), false);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let counts = HealthCounts {
            connections: 5,
            sessions: 3,
            pending: 1,
        };
        let resp = health_check(&"inst_a".into(), Instant::now(), counts, false);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["instance_id"], "inst_a");
        assert_eq!(parsed["connections"], 5);
        assert_eq!(parsed["active_sessions"], 3);
        assert_eq!(parsed["pending_reconnects"], 1);
        assert!(parsed["uptime_secs"].is_number());
    }
}

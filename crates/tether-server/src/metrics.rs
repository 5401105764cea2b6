//! Connection/session metrics.
//!
//! [`MetricsCollector`] keeps its own pull-based snapshot and forwards every
//! recording to the `metrics` facade, so an installed Prometheus recorder
//! sees the same series for `/metrics`.

use std::collections::BTreeMap;

use dashmap::DashMap;
use metrics::{Label, counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

// Metric name constants to avoid typos across modules.

/// Currently registered connections (gauge).
pub const ACTIVE_CONNECTIONS: &str = "active_connections";
/// Registered connections per tenant (gauge, labels: tenant).
pub const CONNECTIONS_PER_TENANT: &str = "connections_per_tenant";
/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "connections_total";
/// Connections closed (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "disconnections_total";
/// Heartbeat probes that went unanswered (counter).
pub const HEARTBEAT_MISSES_TOTAL: &str = "heartbeat_misses_total";
/// Sessions resumed onto a new connection (counter).
pub const RECONNECTION_SUCCESS_TOTAL: &str = "reconnection_success_total";
/// Resume attempts that lost the fencing race (counter).
pub const RECONNECTION_CONFLICT_TOTAL: &str = "reconnection_conflict_total";
/// Resume attempts after the grace window, plus sessions finalized unresumed (counter).
pub const RECONNECTION_EXPIRED_TOTAL: &str = "reconnection_expired_total";
/// Inbound messages accepted (counter, labels: type).
pub const MESSAGES_IN_TOTAL: &str = "messages_in_total";
/// Outbound messages queued (counter).
pub const MESSAGES_OUT_TOTAL: &str = "messages_out_total";
/// Inbound frames that failed to decode (counter, labels: reason).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Store operations that fell back to local-only behavior (counter, labels: op).
pub const SESSION_STORE_DEGRADED_TOTAL: &str = "session_store_degraded_total";
/// Broadcast deliveries dropped on a full queue (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns `None` when another recorder is already installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics recorder installed");
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    }
}

/// Labels as `(key, value)` pairs.
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Named counters and gauges with a pull-based snapshot.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
}

impl MetricsCollector {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to a counter.
    pub fn increment(&self, name: &'static str, labels: Labels<'_>) {
        self.increment_by(name, 1, labels);
    }

    /// Add `n` to a counter.
    pub fn increment_by(&self, name: &'static str, n: u64, labels: Labels<'_>) {
        if n == 0 {
            return;
        }
        *self.counters.entry(series_key(name, labels)).or_insert(0) += n;
        counter!(name, facade_labels(labels)).increment(n);
    }

    /// Set a gauge.
    pub fn observe(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        let _ = self.gauges.insert(series_key(name, labels), value);
        gauge!(name, facade_labels(labels)).set(value);
    }

    /// Current value of one series, by snapshot key.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.counters
            .get(key)
            .map(|v| *v as f64)
            .or_else(|| self.gauges.get(key).map(|v| *v))
    }

    /// All series, keyed `name` or `name{k="v",...}`.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut out: BTreeMap<String, f64> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value() as f64))
            .collect();
        out.extend(self.gauges.iter().map(|e| (e.key().clone(), *e.value())));
        out
    }

    /// Snapshot as `key value` lines, for when no Prometheus recorder is installed.
    pub fn render_text(&self) -> String {
        self.snapshot()
            .into_iter()
            .map(|(k, v)| format!("{k} {v}\n"))
            .collect()
    }
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_owned();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable_by_key(|(k, _)| *k);
    let body = sorted
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{body}}}")
}

/// Prometheus text-format escaping for label values.
fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn facade_labels(labels: Labels<'_>) -> Vec<Label> {
    labels
        .iter()
        .map(|(k, v)| Label::new(*k, (*v).to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let m = MetricsCollector::new();
        m.increment(DISCONNECTIONS_TOTAL, &[("reason", "NORMAL_CLOSURE")]);
        m.increment(DISCONNECTIONS_TOTAL, &[("reason", "NORMAL_CLOSURE")]);
        m.increment(DISCONNECTIONS_TOTAL, &[("reason", "HEARTBEAT_TIMEOUT")]);
        m.increment(CONNECTIONS_TOTAL, &[]);

        let snap = m.snapshot();
        assert_eq!(snap["disconnections_total{reason=\"NORMAL_CLOSURE\"}"], 2.0);
        assert_eq!(snap["disconnections_total{reason=\"HEARTBEAT_TIMEOUT\"}"], 1.0);
        assert_eq!(snap["connections_total"], 1.0);
    }

    #[test]
    fn labels_are_sorted_in_keys() {
        let m = MetricsCollector::new();
        m.increment(MESSAGES_IN_TOTAL, &[("type", "ping"), ("tenant", "acme")]);
        assert_eq!(m.get("messages_in_total{tenant=\"acme\",type=\"ping\"}"), Some(1.0));
    }

    #[test]
    fn label_values_are_escaped() {
        let m = MetricsCollector::new();
        m.increment(CONNECTIONS_TOTAL, &[("tenant", r#"a",b="c"#)]);
        m.increment(CONNECTIONS_TOTAL, &[("tenant", "a"), ("b", "c")]);
        assert_eq!(
            m.get(r#"connections_total{tenant="a\",b=\"c"}"#),
            Some(1.0)
        );
        assert_eq!(m.get(r#"connections_total{b="c",tenant="a"}"#), Some(1.0));
        m.increment(CONNECTIONS_TOTAL, &[("tenant", "x\\y\nz")]);
        assert_eq!(m.get(r#"connections_total{tenant="x\\y\nz"}"#), Some(1.0));
    }

    #[test]
    fn gauges_take_latest_value() {
        let m = MetricsCollector::new();
        m.observe(ACTIVE_CONNECTIONS, 3.0, &[]);
        m.observe(ACTIVE_CONNECTIONS, 1.0, &[]);
        assert_eq!(m.get(ACTIVE_CONNECTIONS), Some(1.0));
    }

    #[test]
    fn unknown_series_is_none() {
        assert_eq!(MetricsCollector::new().get("nope"), None);
    }

    #[test]
    fn render_text_lists_series() {
        let m = MetricsCollector::new();
        m.increment_by(BROADCAST_DROPS_TOTAL, 4, &[]);
        assert_eq!(m.render_text(), "broadcast_drops_total 4\n");
    }

    #[test]
    fn prometheus_handle_renders() {
        // no global install, to keep tests independent
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let _ = handle.render();
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            ACTIVE_CONNECTIONS,
            CONNECTIONS_PER_TENANT,
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            HEARTBEAT_MISSES_TOTAL,
            RECONNECTION_SUCCESS_TOTAL,
            RECONNECTION_CONFLICT_TOTAL,
            RECONNECTION_EXPIRED_TOTAL,
            MESSAGES_IN_TOTAL,
            MESSAGES_OUT_TOTAL,
            PROTOCOL_ERRORS_TOTAL,
            SESSION_STORE_DEGRADED_TOTAL,
            BROADCAST_DROPS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}

//! Liveness probing on a shared time-wheel.
//!
//! The wheel has `ceil(interval / tick)` buckets, so one revolution takes one
//! heartbeat interval. Each connection lands in a random bucket at
//! [`HeartbeatMonitor::start`] and is examined once per revolution at that
//! offset. One sweep task calls [`HeartbeatMonitor::tick`] every `tick` and
//! acts on the returned [`SweepOutcome`]; no per-connection timers exist.
//!
//! On examination a record that already reached the threshold and is still
//! silent expires. Otherwise, if its last pong is at least one interval old,
//! it is probed and its missed count goes up. A pong resets the count.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::ConnectionId;
use tokio::time::Instant;

/// Liveness state for one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// Connection being probed.
    pub connection_id: ConnectionId,
    /// Last probe sent, if any.
    pub last_ping_sent_at: Option<Instant>,
    /// Last pong (or the start time).
    pub last_pong_received_at: Instant,
    /// Probes sent since the last pong.
    pub missed_count: u32,
    /// Wheel bucket.
    pub slot: usize,
}

/// What one tick of the wheel decided.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Connections to send a `ping` to.
    pub probes: Vec<ConnectionId>,
    /// Connections that exhausted their probes; already untracked.
    pub expired: Vec<ConnectionId>,
    /// Earlier probes found unanswered during this tick.
    pub missed: usize,
}

impl SweepOutcome {
    /// Nothing to do.
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty() && self.expired.is_empty()
    }
}

#[derive(Debug)]
struct Wheel {
    buckets: Vec<HashSet<ConnectionId>>,
    records: HashMap<ConnectionId, HeartbeatRecord>,
    cursor: usize,
}

/// Time-wheel heartbeat tracker shared by all connections.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    tick: Duration,
    threshold: u32,
    wheel: Mutex<Wheel>,
}

impl HeartbeatMonitor {
    /// Monitor probing every `interval`, advancing one bucket per `tick`,
    /// and expiring after `threshold` unanswered probes.
    pub fn new(interval: Duration, tick: Duration, threshold: u32) -> Self {
        let tick = tick.max(Duration::from_millis(1)).min(interval.max(Duration::from_millis(1)));
        let buckets = interval.as_nanos().div_ceil(tick.as_nanos()).max(1);
        let buckets = usize::try_from(buckets).unwrap_or(usize::MAX).min(1 << 16);
        Self {
            interval,
            tick,
            threshold: threshold.max(1),
            wheel: Mutex::new(Wheel {
                buckets: vec![HashSet::new(); buckets],
                records: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    /// Probe interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweep cadence.
    pub fn tick_period(&self) -> Duration {
        self.tick
    }

    /// Number of wheel buckets.
    pub fn bucket_count(&self) -> usize {
        self.wheel.lock().buckets.len()
    }

    /// Tracked connections.
    pub fn len(&self) -> usize {
        self.wheel.lock().records.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of one record.
    pub fn record(&self, id: &ConnectionId) -> Option<HeartbeatRecord> {
        self.wheel.lock().records.get(id).cloned()
    }

    /// Start tracking `id` in a randomly chosen bucket.
    pub fn start(&self, id: ConnectionId) {
        self.start_at(id, Instant::now());
    }

    /// [`start`](Self::start) at an explicit time.
    pub fn start_at(&self, id: ConnectionId, now: Instant) {
        let slot = rand::random_range(0..self.bucket_count());
        self.start_in_slot(id, slot, now);
    }

    fn start_in_slot(&self, id: ConnectionId, slot: usize, now: Instant) {
        let mut wheel = self.wheel.lock();
        let slot = slot % wheel.buckets.len();
        if let Some(old) = wheel.records.get(&id).map(|r| r.slot) {
            let _ = wheel.buckets[old].remove(&id);
        }
        let _ = wheel.buckets[slot].insert(id.clone());
        let _ = wheel.records.insert(
            id.clone(),
            HeartbeatRecord {
                connection_id: id,
                last_ping_sent_at: None,
                last_pong_received_at: now,
                missed_count: 0,
                slot,
            },
        );
    }

    /// Record a pong. Returns `false` if `id` is not tracked.
    pub fn on_pong(&self, id: &ConnectionId) -> bool {
        self.on_pong_at(id, Instant::now())
    }

    /// [`on_pong`](Self::on_pong) at an explicit time.
    pub fn on_pong_at(&self, id: &ConnectionId, now: Instant) -> bool {
        let mut wheel = self.wheel.lock();
        match wheel.records.get_mut(id) {
            Some(record) => {
                record.missed_count = 0;
                record.last_pong_received_at = now;
                true
            }
            None => false,
        }
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn stop(&self, id: &ConnectionId) -> bool {
        let mut wheel = self.wheel.lock();
        match wheel.records.remove(id) {
            Some(record) => {
                let _ = wheel.buckets[record.slot].remove(id);
                true
            }
            None => false,
        }
    }

    /// Examine the next bucket.
    pub fn tick(&self) -> SweepOutcome {
        self.tick_at(Instant::now())
    }

    /// [`tick`](Self::tick) at an explicit time.
    pub fn tick_at(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut wheel = self.wheel.lock();
        let Wheel {
            buckets,
            records,
            cursor,
        } = &mut *wheel;

        let slot = *cursor;
        *cursor = (*cursor + 1) % buckets.len();

        let bucket = &mut buckets[slot];
        bucket.retain(|id| {
            let Some(record) = records.get_mut(id) else {
                return false;
            };
            let silent = now.saturating_duration_since(record.last_pong_received_at) >= self.interval;
            if silent && record.missed_count > 0 {
                outcome.missed += 1;
            }
            if record.missed_count >= self.threshold && silent {
                let _ = records.remove(id);
                outcome.expired.push(id.clone());
                return false;
            }
            if silent {
                record.missed_count += 1;
                record.last_ping_sent_at = Some(now);
                outcome.probes.push(id.clone());
            }
            true
        });
        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const I: Duration = Duration::from_secs(30);
    const TICK: Duration = Duration::from_secs(1);

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(I, TICK, 3)
    }

    /// Run one full revolution starting at `at`, one tick apart.
    fn revolution(m: &HeartbeatMonitor, at: Instant) -> SweepOutcome {
        let mut total = SweepOutcome::default();
        for k in 0..m.bucket_count() {
            let out = m.tick_at(at + TICK * u32::try_from(k).unwrap());
            total.probes.extend(out.probes);
            total.expired.extend(out.expired);
            total.missed += out.missed;
        }
        total
    }

    #[test]
    fn bucket_count_covers_interval() {
        assert_eq!(monitor().bucket_count(), 30);
        assert_eq!(HeartbeatMonitor::new(Duration::from_millis(2500), TICK, 3).bucket_count(), 3);
        assert_eq!(HeartbeatMonitor::new(TICK, Duration::from_secs(5), 3).bucket_count(), 1);
    }

    #[test]
    fn silent_connection_gets_three_probes_then_expires() {
        let m = monitor();
        let t0 = Instant::now();
        let id = ConnectionId::from("c1");
        m.start_in_slot(id.clone(), 0, t0);

        let mut probes = 0;
        let mut missed = 0;
        let mut expired_at = None;
        for rev in 1..=5u32 {
            let out = revolution(&m, t0 + I * rev);
            probes += out.probes.len();
            missed += out.missed;
            if !out.expired.is_empty() {
                expired_at = Some(rev);
                break;
            }
        }
        assert_eq!(probes, 3);
        assert_eq!(missed, 3);
        // three silent intervals, evicted on the next sweep
        assert_eq!(expired_at, Some(4));
        assert!(m.record(&id).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn pong_resets_missed_count() {
        let m = monitor();
        let t0 = Instant::now();
        let id = ConnectionId::from("c1");
        m.start_in_slot(id.clone(), 0, t0);

        let _ = revolution(&m, t0 + I);
        let _ = revolution(&m, t0 + I * 2);
        assert_eq!(m.record(&id).unwrap().missed_count, 2);

        assert!(m.on_pong_at(&id, t0 + I * 2 + TICK));
        let rec = m.record(&id).unwrap();
        assert_eq!(rec.missed_count, 0);
        assert_eq!(rec.last_pong_received_at, t0 + I * 2 + TICK);
    }

    #[test]
    fn responsive_connection_never_expires() {
        let m = monitor();
        let t0 = Instant::now();
        let id = ConnectionId::from("c1");
        m.start_in_slot(id.clone(), 3, t0);

        for rev in 1..=20u32 {
            let at = t0 + I * rev;
            let out = revolution(&m, at);
            assert!(out.expired.is_empty());
            if out.probes.contains(&id) {
                assert!(m.on_pong_at(&id, at + TICK * 4));
            }
        }
        assert!(m.record(&id).is_some());
    }

    #[test]
    fn fresh_connection_is_not_probed() {
        let m = monitor();
        let t0 = Instant::now();
        m.start_in_slot("c1".into(), 0, t0);
        assert!(m.tick_at(t0 + TICK).is_empty());
    }

    #[test]
    fn each_connection_examined_once_per_revolution() {
        let m = monitor();
        let t0 = Instant::now();
        for i in 0..100 {
            m.start_at(ConnectionId::from(format!("c{i}")), t0);
        }
        let out = revolution(&m, t0 + I);
        assert_eq!(out.probes.len(), 100);
        let unique: HashSet<_> = out.probes.iter().collect();
        assert_eq!(unique.len(), 100);
    }

    #[test]
    fn stop_untracks() {
        let m = monitor();
        let t0 = Instant::now();
        m.start_at("c1".into(), t0);
        assert!(m.stop(&"c1".into()));
        assert!(!m.stop(&"c1".into()));
        assert!(!m.on_pong_at(&"c1".into(), t0));
        assert!(revolution(&m, t0 + I * 5).is_empty());
    }

    #[test]
    fn restart_moves_record() {
        let m = monitor();
        let t0 = Instant::now();
        m.start_in_slot("c1".into(), 1, t0);
        m.start_in_slot("c1".into(), 2, t0);
        assert_eq!(m.len(), 1);
        assert_eq!(revolution(&m, t0 + I).probes.len(), 1);
    }
}

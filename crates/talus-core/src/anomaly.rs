//! Warning accumulation: per-kind statistics plus a bounded in-memory ring.
//!
//! Physical anomalies never abort the run. Each kind logs through `tracing`
//! on its first occurrence; every occurrence bumps the per-kind counter and
//! lands in the ring, which callers can drain on demand.

use std::collections::VecDeque;
use std::sync::Mutex;

use talus_types::{Warning, WarningStat, NUM_WARNINGS};

/// Capacity of the warning ring.
const RING_CAPACITY: usize = 256;

/// One recorded anomaly.
#[derive(Debug, Clone)]
pub struct Anomaly {
    /// The warning kind.
    pub kind: Warning,
    /// Human-readable description with the offending entity.
    pub message: String,
}

/// Thread-shared warning sink.
#[derive(Debug, Default)]
pub struct AnomalyLog {
    inner: Mutex<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    stats: [WarningStat; NUM_WARNINGS],
    ring: VecDeque<Anomaly>,
}

impl Default for LogInner {
    fn default() -> Self {
        Self {
            stats: [WarningStat::default(); NUM_WARNINGS],
            ring: VecDeque::new(),
        }
    }
}

impl AnomalyLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a warning; logs via `tracing` on the first occurrence of its
    /// kind.
    pub fn record(&self, kind: Warning, info: i64, message: impl Into<String>) {
        let message = message.into();
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let stat = &mut inner.stats[kind as usize];
        if stat.count == 0 {
            tracing::warn!("{message}");
        }
        stat.count += 1;
        stat.last_info = info;
        if inner.ring.len() == RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(Anomaly { kind, message });
    }

    /// Per-kind statistics since the last clear.
    #[must_use]
    pub fn stats(&self) -> [WarningStat; NUM_WARNINGS] {
        self.inner
            .lock()
            .map(|g| g.stats)
            .unwrap_or([WarningStat::default(); NUM_WARNINGS])
    }

    /// Snapshot of the ring, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<Anomaly> {
        self.inner
            .lock()
            .map(|g| g.ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total warnings recorded since the last clear.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner
            .lock()
            .map(|g| g.stats.iter().map(|s| s.count).sum())
            .unwrap_or(0)
    }

    /// Clears statistics and the ring.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stats = [WarningStat::default(); NUM_WARNINGS];
            inner.ring.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_counts() {
        let log = AnomalyLog::new();
        log.record(Warning::ZeroRadius, 3, "zero radius on component 3");
        log.record(Warning::ZeroRadius, 5, "zero radius on component 5");
        let stats = log.stats();
        assert_eq!(stats[Warning::ZeroRadius as usize].count, 2);
        assert_eq!(stats[Warning::ZeroRadius as usize].last_info, 5);
        assert_eq!(log.recent().len(), 2);
    }

    #[test]
    fn clear_resets_everything() {
        let log = AnomalyLog::new();
        log.record(Warning::EmptyMesh, 0, "mesh 0 has no facets");
        log.clear();
        assert_eq!(log.total(), 0);
        assert!(log.recent().is_empty());
    }

    #[test]
    fn ring_is_bounded() {
        let log = AnomalyLog::new();
        for i in 0..400 {
            log.record(Warning::DefaultedFamily, i, format!("clump {i}"));
        }
        assert_eq!(log.recent().len(), RING_CAPACITY);
        assert_eq!(log.total(), 400);
    }
}

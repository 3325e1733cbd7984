//! The cross-worker handshake: single-slot fresh-flag buffers, drift
//! accounting, and the main-thread/worker gates.
//!
//! Two buffers, one per direction:
//!
//! - dT → kT: the most recent snapshot of owner positions, orientations,
//!   velocities, and family tags, stamped with the dT step it was taken at;
//! - kT → dT: the most recent candidate pair list, tagged with the step of
//!   the snapshot it was computed from and its sort discipline.
//!
//! Each buffer carries a *fresh* flag toggled under the slot mutex; workers
//! block on the slot condvar when their input is stale. Publishing
//! overwrites: a consumer always sees the most recent value, and the
//! stamps it sees are strictly monotonic. Cooperative cancellation goes
//! through `dynamic_done` and the per-worker break flags; both notify the
//! slot condvars so no wait outlives a shutdown request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use nalgebra::{UnitQuaternion, Vector3};
use talus_types::{FamilyId, SortDiscipline, VoxelId};

use crate::broad::ContactPair;

/// Snapshot of owner state handed from dT to kT.
#[derive(Debug, Clone, Default)]
pub struct OwnerSnapshot {
    /// Packed voxel ids.
    pub voxel: Vec<VoxelId>,
    /// Sub-voxel offsets.
    pub sub: Vec<Vector3<f64>>,
    /// Orientations.
    pub quat: Vec<UnitQuaternion<f64>>,
    /// Linear velocities.
    pub vel: Vec<Vector3<f64>>,
    /// Angular velocities (owner-local).
    pub ang_vel: Vec<Vector3<f64>>,
    /// Internal family tags.
    pub family: Vec<FamilyId>,
    /// dT step the snapshot was taken at.
    pub step: u64,
}

/// Pair list handed from kT to dT.
#[derive(Debug, Clone, Default)]
pub struct PairList {
    /// Candidate pairs (geometry ids).
    pub pairs: Vec<ContactPair>,
    /// Ordering guarantee.
    pub discipline: SortDiscipline,
    /// dT step of the owner snapshot this list was computed from.
    pub based_on_step: u64,
}

/// A single-entry exchange slot with a fresh flag.
#[derive(Debug)]
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cv: Condvar,
}

#[derive(Debug)]
struct SlotState<T> {
    data: Option<T>,
    fresh: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                data: None,
                fresh: false,
            }),
            cv: Condvar::new(),
        }
    }
}

impl<T> Slot<T> {
    /// Overwrites the slot and marks it fresh.
    fn publish(&self, value: T) {
        if let Ok(mut s) = self.state.lock() {
            s.data = Some(value);
            s.fresh = true;
        }
        self.cv.notify_all();
    }

    /// Takes the value if fresh, clearing the flag.
    fn try_take(&self) -> Option<T> {
        let mut s = self.state.lock().ok()?;
        if s.fresh {
            s.fresh = false;
            s.data.take()
        } else {
            None
        }
    }

    fn is_fresh(&self) -> bool {
        self.state.lock().map(|s| s.fresh).unwrap_or(false)
    }

    /// Blocks until the slot is fresh or `stop()` turns true; returns the
    /// value when fresh won.
    fn wait_take(&self, stop: impl Fn() -> bool) -> Option<T> {
        let mut s = self.state.lock().ok()?;
        loop {
            if s.fresh {
                s.fresh = false;
                return s.data.take();
            }
            if stop() {
                return None;
            }
            s = self.cv.wait(s).ok()?;
        }
    }

    fn drain(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.data = None;
            s.fresh = false;
        }
        self.cv.notify_all();
    }

    fn notify(&self) {
        self.cv.notify_all();
    }
}

/// Scheduling statistics of one co-simulation run, queryable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollaborationStats {
    /// Integrator steps executed.
    pub dynamic_updates: u64,
    /// Broad-phase rounds completed.
    pub kinematic_updates: u64,
    /// Times dT blocked on the drift bound.
    pub dynamic_held_back: u64,
    /// Times kT outpaced dT (published before the previous list was
    /// consumed).
    pub kinematic_held_back: u64,
    /// Mean of the recent drift window.
    pub average_recent_drift: f64,
    /// Largest drift ever observed (steps between a consumed pair list's
    /// state stamp and the consuming step).
    pub max_observed_drift: u64,
}

impl std::fmt::Display for CollaborationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "~~ kT--dT co-op statistics ~~")?;
        writeln!(f, "dynamic updates:        {}", self.dynamic_updates)?;
        writeln!(f, "kinematic updates:      {}", self.kinematic_updates)?;
        writeln!(f, "dynamic held back:      {}", self.dynamic_held_back)?;
        writeln!(f, "kinematic held back:    {}", self.kinematic_held_back)?;
        writeln!(f, "average recent drift:   {:.2}", self.average_recent_drift)?;
        write!(f, "max observed drift:     {}", self.max_observed_drift)
    }
}

const DRIFT_WINDOW: usize = 64;

/// The shared handshake state between the coordinator and the two workers.
#[derive(Debug, Default)]
pub struct SyncHub {
    state_slot: Slot<OwnerSnapshot>,
    pairs_slot: Slot<PairList>,
    /// Set by dT before publishing its final state of a run; releases a kT
    /// blocked waiting for fresh state.
    dynamic_done: AtomicBool,
    /// Break-waiting signals, one per worker.
    kt_break: AtomicBool,
    dt_break: AtomicBool,
    /// Largest tolerated `dT_step − snapshot_step` before dT must wait.
    max_drift: AtomicU64,

    n_dynamic_updates: AtomicU64,
    n_kinematic_updates: AtomicU64,
    n_dynamic_held_back: AtomicU64,
    n_kinematic_held_back: AtomicU64,
    max_observed_drift: AtomicU64,
    drift_window: Mutex<VecDeque<u64>>,
}

impl SyncHub {
    /// A hub with the given drift bound.
    #[must_use]
    pub fn new(max_drift: u64) -> Self {
        let hub = Self::default();
        hub.max_drift.store(max_drift.max(1), Ordering::Relaxed);
        hub
    }

    // ==================== dT side ====================

    /// Publishes the owner snapshot (overwrite semantics).
    pub fn publish_state(&self, snapshot: OwnerSnapshot) {
        self.state_slot.publish(snapshot);
    }

    /// Whether the dT → kT slot still holds an unconsumed snapshot.
    #[must_use]
    pub fn state_is_fresh(&self) -> bool {
        self.state_slot.is_fresh()
    }

    /// Takes a fresh pair list if one is available.
    pub fn try_take_pairs(&self) -> Option<PairList> {
        self.pairs_slot.try_take()
    }

    /// Blocks dT until a fresh pair list arrives or its break flag fires.
    pub fn wait_take_pairs(&self) -> Option<PairList> {
        self.pairs_slot
            .wait_take(|| self.dt_break.load(Ordering::Acquire))
    }

    /// Marks the end of the requested dynamic run.
    pub fn set_dynamic_done(&self, done: bool) {
        self.dynamic_done.store(done, Ordering::Release);
        self.state_slot.notify();
        self.pairs_slot.notify();
    }

    /// Whether the dynamic run has finished.
    #[must_use]
    pub fn dynamic_done(&self) -> bool {
        self.dynamic_done.load(Ordering::Acquire)
    }

    // ==================== kT side ====================

    /// Blocks kT until fresh state arrives; `None` means the run ended or
    /// the break flag fired.
    pub fn wait_take_state(&self) -> Option<OwnerSnapshot> {
        self.state_slot.wait_take(|| {
            self.dynamic_done.load(Ordering::Acquire) || self.kt_break.load(Ordering::Acquire)
        })
    }

    /// Publishes a pair list; counts kT as held back when the previous list
    /// was never consumed.
    pub fn publish_pairs(&self, pairs: PairList) {
        if self.pairs_slot.is_fresh() {
            self.n_kinematic_held_back.fetch_add(1, Ordering::Relaxed);
        }
        self.pairs_slot.publish(pairs);
    }

    // ==================== break / reset ====================

    /// Raises a worker's break-waiting signal.
    pub fn break_waiting(&self, kinematic: bool) {
        if kinematic {
            self.kt_break.store(true, Ordering::Release);
        } else {
            self.dt_break.store(true, Ordering::Release);
        }
        self.state_slot.notify();
        self.pairs_slot.notify();
    }

    /// Clears both break signals.
    pub fn clear_breaks(&self) {
        self.kt_break.store(false, Ordering::Release);
        self.dt_break.store(false, Ordering::Release);
    }

    /// Whether dT's break signal is raised.
    #[must_use]
    pub fn dt_break_raised(&self) -> bool {
        self.dt_break.load(Ordering::Acquire)
    }

    /// Whether kT's break signal is raised.
    #[must_use]
    pub fn kt_break_raised(&self) -> bool {
        self.kt_break.load(Ordering::Acquire)
    }

    /// Drains both buffers and clears per-call flags. The collaboration
    /// statistics survive: only [`clear_stats`](Self::clear_stats) resets
    /// them.
    pub fn drain(&self) {
        self.state_slot.drain();
        self.pairs_slot.drain();
        self.dynamic_done.store(false, Ordering::Release);
    }

    // ==================== drift / stats ====================

    /// The configured drift bound.
    #[must_use]
    pub fn max_drift(&self) -> u64 {
        self.max_drift.load(Ordering::Relaxed)
    }

    /// Reconfigures the drift bound.
    pub fn set_max_drift(&self, max_drift: u64) {
        self.max_drift.store(max_drift.max(1), Ordering::Relaxed);
    }

    /// Records one integrator step at the given drift.
    pub fn record_dynamic_step(&self, drift: u64) {
        self.n_dynamic_updates.fetch_add(1, Ordering::Relaxed);
        self.max_observed_drift.fetch_max(drift, Ordering::Relaxed);
        if let Ok(mut w) = self.drift_window.lock() {
            if w.len() == DRIFT_WINDOW {
                w.pop_front();
            }
            w.push_back(drift);
        }
    }

    /// Records one completed broad-phase round.
    pub fn record_kinematic_update(&self) {
        self.n_kinematic_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records dT blocking on the drift bound.
    pub fn record_dynamic_held_back(&self) {
        self.n_dynamic_held_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the collaboration statistics.
    #[must_use]
    pub fn stats(&self) -> CollaborationStats {
        let avg = self
            .drift_window
            .lock()
            .map(|w| {
                if w.is_empty() {
                    0.0
                } else {
                    w.iter().sum::<u64>() as f64 / w.len() as f64
                }
            })
            .unwrap_or(0.0);
        CollaborationStats {
            dynamic_updates: self.n_dynamic_updates.load(Ordering::Relaxed),
            kinematic_updates: self.n_kinematic_updates.load(Ordering::Relaxed),
            dynamic_held_back: self.n_dynamic_held_back.load(Ordering::Relaxed),
            kinematic_held_back: self.n_kinematic_held_back.load(Ordering::Relaxed),
            average_recent_drift: avg,
            max_observed_drift: self.max_observed_drift.load(Ordering::Relaxed),
        }
    }

    /// Resets the collaboration statistics (and the drift window).
    pub fn clear_stats(&self) {
        self.n_dynamic_updates.store(0, Ordering::Relaxed);
        self.n_kinematic_updates.store(0, Ordering::Relaxed);
        self.n_dynamic_held_back.store(0, Ordering::Relaxed);
        self.n_kinematic_held_back.store(0, Ordering::Relaxed);
        self.max_observed_drift.store(0, Ordering::Relaxed);
        if let Ok(mut w) = self.drift_window.lock() {
            w.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn slot_fresh_flag_round_trip() {
        let hub = SyncHub::new(4);
        assert!(hub.try_take_pairs().is_none());
        hub.publish_pairs(PairList {
            based_on_step: 7,
            ..Default::default()
        });
        let got = hub.try_take_pairs().unwrap();
        assert_eq!(got.based_on_step, 7);
        // Consuming clears the flag.
        assert!(hub.try_take_pairs().is_none());
    }

    #[test]
    fn publish_overwrites_with_most_recent() {
        let hub = SyncHub::new(4);
        hub.publish_state(OwnerSnapshot {
            step: 1,
            ..Default::default()
        });
        hub.publish_state(OwnerSnapshot {
            step: 5,
            ..Default::default()
        });
        let got = hub.wait_take_state().unwrap();
        assert_eq!(got.step, 5);
    }

    #[test]
    fn dynamic_done_releases_blocked_kinematic_wait() {
        let hub = Arc::new(SyncHub::new(4));
        let h = Arc::clone(&hub);
        let waiter = thread::spawn(move || h.wait_take_state());
        thread::sleep(Duration::from_millis(30));
        hub.set_dynamic_done(true);
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn break_releases_blocked_dynamic_wait() {
        let hub = Arc::new(SyncHub::new(4));
        let h = Arc::clone(&hub);
        let waiter = thread::spawn(move || h.wait_take_pairs());
        thread::sleep(Duration::from_millis(30));
        hub.break_waiting(false);
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn cross_thread_handoff_delivers_fresh_data() {
        let hub = Arc::new(SyncHub::new(4));
        let h = Arc::clone(&hub);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            h.publish_pairs(PairList {
                based_on_step: 42,
                ..Default::default()
            });
        });
        let got = hub.wait_take_pairs().unwrap();
        assert_eq!(got.based_on_step, 42);
        producer.join().unwrap();
    }

    #[test]
    fn stats_track_drift_window_and_max() {
        let hub = SyncHub::new(8);
        for d in [0, 2, 4, 6] {
            hub.record_dynamic_step(d);
        }
        hub.record_kinematic_update();
        let s = hub.stats();
        assert_eq!(s.dynamic_updates, 4);
        assert_eq!(s.kinematic_updates, 1);
        assert_eq!(s.max_observed_drift, 6);
        assert!((s.average_recent_drift - 3.0).abs() < 1e-12);
        hub.clear_stats();
        assert_eq!(hub.stats().dynamic_updates, 0);
    }

    #[test]
    fn drain_clears_buffers_but_not_stats() {
        let hub = SyncHub::new(4);
        hub.record_dynamic_step(3);
        hub.publish_pairs(PairList::default());
        hub.set_dynamic_done(true);
        hub.drain();
        assert!(!hub.dynamic_done());
        assert!(hub.try_take_pairs().is_none());
        assert_eq!(hub.stats().dynamic_updates, 1);
    }
}

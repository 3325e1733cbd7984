//! The two worker threads and their command gates.
//!
//! Both workers are spawned when the solver is constructed and live until
//! it drops. The coordinator talks to each through a [`Gate`]: a one-deep
//! command slot with completion signalling. Worker loops follow the
//! handshake contract: dT consumes the freshest pair list, integrates, and
//! publishes state at the configured cadence, blocking only when its drift
//! bound is hit; kT blocks until fresh state arrives, runs the broad phase,
//! and publishes the pair list stamped with the state's step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use nalgebra::Vector3;
use rayon::ThreadPool;

use crate::broad::{self, BroadConfig, BroadInput};
use crate::error::DemError;
use crate::handshake::{PairList, SyncHub};
use crate::state::{
    DynamicState, EngineShared, KinematicState, DT_TIMER_FORCE, DT_TIMER_INTEGRATE,
    KT_TIMER_DETECT, KT_TIMER_TRANSFORM,
};
use crate::world::BinGrid;

/// Commands the coordinator sends a worker.
pub(crate) enum Command {
    /// Adopt a new shared engine context (after (re-)initialization).
    Install(Arc<EngineShared>),
    /// Participate in a dynamic run (dT: `cycles` integrator steps; kT:
    /// serve until the run completes).
    Run {
        /// Integrator steps for dT; ignored by kT.
        cycles: u64,
    },
    /// Terminate the worker thread.
    Exit,
}

/// One-deep command slot with completion signalling.
#[derive(Default)]
pub(crate) struct Gate {
    inner: Mutex<GateInner>,
    cv_cmd: Condvar,
    cv_done: Condvar,
}

#[derive(Default)]
struct GateInner {
    cmd: Option<Command>,
    busy: bool,
}

impl Gate {
    /// Queues a command; blocks while the previous one is still pending.
    pub(crate) fn send(&self, cmd: Command) {
        let Ok(mut g) = self.inner.lock() else {
            return;
        };
        while g.cmd.is_some() {
            let Ok(next) = self.cv_done.wait(g) else {
                return;
            };
            g = next;
        }
        g.cmd = Some(cmd);
        g.busy = true;
        self.cv_cmd.notify_one();
    }

    /// Worker side: blocks for the next command.
    fn recv(&self) -> Option<Command> {
        let mut g = self.inner.lock().ok()?;
        loop {
            if let Some(cmd) = g.cmd.take() {
                self.cv_done.notify_all();
                return Some(cmd);
            }
            g = self.cv_cmd.wait(g).ok()?;
        }
    }

    /// Worker side: marks the current command complete.
    fn finish(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.busy = false;
        }
        self.cv_done.notify_all();
    }

    /// Blocks until the worker has consumed every queued command and gone
    /// idle.
    pub(crate) fn wait_idle(&self) {
        let Ok(mut g) = self.inner.lock() else {
            return;
        };
        while g.cmd.is_some() || g.busy {
            let Ok(next) = self.cv_done.wait(g) else {
                return;
            };
            g = next;
        }
    }
}

/// A spawned worker thread plus its gate.
pub(crate) struct WorkerHandle {
    pub(crate) gate: Arc<Gate>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Sends a command without waiting for completion.
    pub(crate) fn send(&self, cmd: Command) {
        self.gate.send(cmd);
    }

    /// Blocks until the worker is idle.
    pub(crate) fn wait_idle(&self) {
        self.gate.wait_idle();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.gate.send(Command::Exit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn build_pool(threads: usize, name: &'static str) -> ThreadPool {
    #[allow(clippy::unwrap_used)] // builder only fails on invalid config
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{name}-{i}"))
        .build()
        .unwrap()
}

/// Spawns the dynamic worker (dT).
pub(crate) fn spawn_dynamic(
    hub: Arc<SyncHub>,
    state: Arc<Mutex<DynamicState>>,
    abort: Arc<AtomicBool>,
    threads: usize,
) -> WorkerHandle {
    let gate = Arc::new(Gate::default());
    let worker_gate = Arc::clone(&gate);
    let join = std::thread::Builder::new()
        .name("talus-dT".into())
        .spawn(move || {
            let mut pool = build_pool(threads, "talus-dT-pool");
            let mut shared: Option<Arc<EngineShared>> = None;
            while let Some(cmd) = worker_gate.recv() {
                match cmd {
                    Command::Install(ctx) => {
                        if ctx.worker_threads != pool.current_num_threads() {
                            pool = build_pool(ctx.worker_threads, "talus-dT-pool");
                        }
                        shared = Some(ctx);
                    }
                    Command::Run { cycles } => {
                        if let Some(ctx) = &shared {
                            if let Ok(mut guard) = state.lock() {
                                // Reborrow past the guard so the closure
                                // moved onto the pool is Send.
                                let st: &mut DynamicState = &mut guard;
                                let hub = &hub;
                                let abort = &abort;
                                pool.install(move || {
                                    dynamic_run(hub, ctx, st, abort, cycles);
                                });
                            }
                        }
                    }
                    Command::Exit => {
                        worker_gate.finish();
                        return;
                    }
                }
                worker_gate.finish();
            }
        })
        .ok();
    WorkerHandle {
        gate,
        join,
    }
}

/// The dT loop: one iteration per integrator step.
fn dynamic_run(
    hub: &SyncHub,
    shared: &EngineShared,
    st: &mut DynamicState,
    abort: &AtomicBool,
    cycles: u64,
) {
    let mut last_publish_step = st.step;

    for cycle in 0..cycles {
        // The governor may retune the drift bound between rounds; read it
        // per iteration.
        let max_drift = hub.max_drift();
        let cadence = max_drift;

        // Swap in fresh pair data when available.
        if let Some(pl) = hub.try_take_pairs() {
            st.adopt_pairs(pl);
        }

        let t0 = Instant::now();
        if let Err(e) = st.compute_forces(shared) {
            tracing::error!("force pass failed, aborting the dynamic run: {e}");
            abort.store(true, Ordering::Release);
            // Release a kT blocked waiting for fresh state.
            hub.break_waiting(true);
            break;
        }
        st.timers.add(DT_TIMER_FORCE, t0.elapsed().as_secs_f64());

        let t1 = Instant::now();
        st.integrate(shared);
        st.timers.add(DT_TIMER_INTEGRATE, t1.elapsed().as_secs_f64());

        hub.record_dynamic_step(st.drift());

        let last = cycle + 1 == cycles;
        if last {
            // Release a kT blocked on state before the final publish.
            hub.set_dynamic_done(true);
            hub.publish_state(st.snapshot());
            break;
        }

        if st.drift() >= max_drift {
            // Bounded staleness: hand the freshest state over, then hold
            // this worker until pair data new enough arrives.
            hub.record_dynamic_held_back();
            while st.drift() >= max_drift {
                if !hub.state_is_fresh() {
                    hub.publish_state(st.snapshot());
                    last_publish_step = st.step;
                }
                match hub.wait_take_pairs() {
                    Some(pl) => st.adopt_pairs(pl),
                    None => break, // break signal
                }
            }
        } else if st.step.saturating_sub(last_publish_step) >= cadence && !hub.state_is_fresh() {
            // Opportunistic publish: kT is idle and the cadence elapsed.
            hub.publish_state(st.snapshot());
            last_publish_step = st.step;
        }

        if hub.dt_break_raised() || abort.load(Ordering::Acquire) {
            break;
        }
    }
}

/// Spawns the kinematic worker (kT).
pub(crate) fn spawn_kinematic(
    hub: Arc<SyncHub>,
    state: Arc<Mutex<KinematicState>>,
    abort: Arc<AtomicBool>,
    threads: usize,
) -> WorkerHandle {
    let gate = Arc::new(Gate::default());
    let worker_gate = Arc::clone(&gate);
    let join = std::thread::Builder::new()
        .name("talus-kT".into())
        .spawn(move || {
            let mut pool = build_pool(threads, "talus-kT-pool");
            let mut shared: Option<Arc<EngineShared>> = None;
            while let Some(cmd) = worker_gate.recv() {
                match cmd {
                    Command::Install(ctx) => {
                        if ctx.worker_threads != pool.current_num_threads() {
                            pool = build_pool(ctx.worker_threads, "talus-kT-pool");
                        }
                        shared = Some(ctx);
                    }
                    Command::Run { .. } => {
                        if let Some(ctx) = &shared {
                            if let Ok(mut guard) = state.lock() {
                                let st: &mut KinematicState = &mut guard;
                                let hub = &hub;
                                let abort = &abort;
                                pool.install(move || {
                                    kinematic_run(hub, ctx, st, abort);
                                });
                            }
                        }
                    }
                    Command::Exit => {
                        worker_gate.finish();
                        return;
                    }
                }
                worker_gate.finish();
            }
        })
        .ok();
    WorkerHandle {
        gate,
        join,
    }
}

/// One broad-phase round over an owner snapshot: geometry transform,
/// binning, sweep, adaptive retune. Shared by the worker loop and the
/// initialization preload.
pub(crate) fn broad_phase_round(
    hub: &SyncHub,
    shared: &EngineShared,
    st: &mut KinematicState,
    snapshot: &crate::handshake::OwnerSnapshot,
) -> Result<PairList, DemError> {
    let model = &shared.model;
    let codec = &shared.world.codec;

    let t0 = Instant::now();
    // Owner world positions from the snapshot.
    let world_pos: Vec<Vector3<f64>> = (0..model.n_owners)
        .map(|i| codec.decode(snapshot.voxel[i], snapshot.sub[i]))
        .collect();
    let sphere_pos: Vec<Vector3<f64>> = (0..model.n_spheres)
        .map(|s| {
            let o = model.sphere_owner[s] as usize;
            world_pos[o] + snapshot.quat[o] * model.sphere_rel_pos[s]
        })
        .collect();
    let tri_world: Vec<[Vector3<f64>; 3]> = (0..model.n_tri)
        .map(|t| {
            let o = model.tri_owner[t] as usize;
            let v = model.tri_vertices[t];
            [
                world_pos[o] + snapshot.quat[o] * v[0],
                world_pos[o] + snapshot.quat[o] * v[1],
                world_pos[o] + snapshot.quat[o] * v[2],
            ]
        })
        .collect();
    let anal_pos_w: Vec<Vector3<f64>> = (0..model.n_anal)
        .map(|a| {
            let o = model.anal_owner[a] as usize;
            world_pos[o] + snapshot.quat[o] * model.anal_pos[a]
        })
        .collect();
    let anal_dir_w: Vec<Vector3<f64>> = (0..model.n_anal)
        .map(|a| {
            let o = model.anal_owner[a] as usize;
            snapshot.quat[o] * model.anal_rot[a]
        })
        .collect();
    st.timers.add(KT_TIMER_TRANSFORM, t0.elapsed().as_secs_f64());

    let cfg = BroadConfig {
        grid: st.grid,
        origin: codec.origin,
        margin: st.governor.beta(),
        max_per_bin: shared.max_per_bin,
        sort_pairs: shared.sort_pairs,
        cycle: snapshot.step,
    };
    let input = BroadInput {
        sphere_pos: &sphere_pos,
        sphere_radius: &model.sphere_radius,
        sphere_owner: &model.sphere_owner,
        tri_vertices: &tri_world,
        tri_owner: &model.tri_owner,
        anal_pos: &anal_pos_w,
        anal_dir: &anal_dir_w,
        anal_kind: &model.anal_kind,
        anal_size1: &model.anal_size1,
        anal_size2: &model.anal_size2,
        anal_normal: &model.anal_normal,
        anal_owner: &model.anal_owner,
        owner_family: &snapshot.family,
    };

    let t1 = Instant::now();
    let (pairs, stats) = broad::detect_pairs(&cfg, &input, shared.family.as_ref())?;
    st.timers.add(KT_TIMER_DETECT, t1.elapsed().as_secs_f64());
    st.last_stats = stats;

    // Adaptive cadence: retune bin size (and possibly the drift bound)
    // toward the target occupancy, bounded by the configured rates.
    if let Some(retune) = st.governor.maybe_retune(
        st.grid.bin_size,
        hub.max_drift(),
        shared.max_drift(),
        stats.avg_geometries_per_bin,
    ) {
        if let Some(new_size) = retune.bin_size {
            match BinGrid::derive(codec, new_size) {
                Ok(grid) => st.grid = grid,
                Err(e) => {
                    tracing::warn!("adaptive bin retune rejected: {e}");
                }
            }
        }
        if let Some(new_drift) = retune.max_drift {
            tracing::debug!(new_drift, "adaptive drift-bound retune");
            hub.set_max_drift(new_drift);
        }
    }

    Ok(PairList {
        pairs,
        discipline: st.sort_discipline,
        based_on_step: snapshot.step,
    })
}

/// The kT loop: block for fresh state, bin, sweep, publish.
fn kinematic_run(
    hub: &SyncHub,
    shared: &EngineShared,
    st: &mut KinematicState,
    abort: &AtomicBool,
) {
    let mut last_seen_step = 0u64;

    while let Some(snapshot) = hub.wait_take_state() {
        // State publications are strictly monotonic.
        debug_assert!(snapshot.step >= last_seen_step);
        last_seen_step = snapshot.step;

        match broad_phase_round(hub, shared, st, &snapshot) {
            Ok(pairs) => {
                hub.publish_pairs(pairs);
                hub.record_kinematic_update();
            }
            Err(e) => {
                tracing::error!("broad phase failed, aborting the cycle: {e}");
                st.last_error = Some(e);
                abort.store(true, Ordering::Release);
                // Release a dT blocked waiting for pairs.
                hub.break_waiting(false);
                break;
            }
        }

        if hub.kt_break_raised() || abort.load(Ordering::Acquire) {
            break;
        }
    }
}

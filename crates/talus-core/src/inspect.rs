//! Inspector queries: lazy reductions over the dynamic worker's state.
//!
//! An inspector couples an element quantity (built-in, or a custom
//! expression over per-owner locals) with a reduction flavour. Nothing is
//! precomputed between calls; `get_value` locks the (synchronized) dynamic
//! state, evaluates the quantity per owner, and reduces.

use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use talus_compile::{Program, Scope};

use crate::error::DemError;
use crate::flatten::OwnerKind;
use crate::state::{DynamicState, EngineShared};

/// Reduction flavour applied over the per-element quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Largest element value.
    Max,
    /// Smallest element value.
    Min,
    /// Sum of element values.
    Sum,
}

/// What an inspector measures.
#[derive(Debug, Clone)]
pub enum InspectorQuantity {
    /// Largest clump CoM z-coordinate.
    ClumpMaxZ,
    /// Smallest clump CoM z-coordinate.
    ClumpMinZ,
    /// Largest clump absolute velocity.
    ClumpMaxAbsVel,
    /// Total kinetic energy of all clumps.
    TotalKineticEnergy,
    /// Custom per-owner expression (locals: `X`, `Y`, `Z`, `vX`, `vY`,
    /// `vZ`, `absv`, `family`, `mass`) with an explicit reduction.
    Custom {
        /// The element-quantity expression.
        predicate: String,
        /// How elements reduce to the scalar.
        reduce: Reduction,
    },
}

/// A reusable inspector handle. Values are computed on demand from the
/// state arrays of a synchronized dynamic worker.
pub struct Inspector {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) state: Arc<Mutex<DynamicState>>,
    pub(crate) quantity: InspectorQuantity,
    pub(crate) program: Option<Arc<Program>>,
}

impl Inspector {
    /// Evaluates the quantity now.
    pub fn get_value(&self) -> Result<f64, DemError> {
        let st = self
            .state
            .lock()
            .map_err(|_| DemError::config("dynamic state mutex poisoned"))?;
        let shared = &self.shared;
        let model = &shared.model;

        let clumps: Vec<usize> = (0..st.n_owners)
            .filter(|&i| st.active[i] && matches!(model.owner_kind[i], OwnerKind::Clump(_)))
            .collect();

        match &self.quantity {
            InspectorQuantity::ClumpMaxZ => reduce(
                Reduction::Max,
                clumps
                    .par_iter()
                    .map(|&i| st.world_pos(shared, i).z)
                    .collect(),
            ),
            InspectorQuantity::ClumpMinZ => reduce(
                Reduction::Min,
                clumps
                    .par_iter()
                    .map(|&i| st.world_pos(shared, i).z)
                    .collect(),
            ),
            InspectorQuantity::ClumpMaxAbsVel => reduce(
                Reduction::Max,
                clumps.par_iter().map(|&i| st.vel[i].norm()).collect(),
            ),
            InspectorQuantity::TotalKineticEnergy => Ok(st.kinetic_energy(shared)),
            InspectorQuantity::Custom { reduce: flavour, .. } => {
                let program = self
                    .program
                    .as_ref()
                    .ok_or_else(|| DemError::config("custom inspector has no compiled predicate"))?;
                let values: Vec<f64> = clumps
                    .par_iter()
                    .map(|&i| {
                        let p = st.world_pos(shared, i);
                        let mut scope = Scope::new();
                        scope.set("X", p.x);
                        scope.set("Y", p.y);
                        scope.set("Z", p.z);
                        scope.set("vX", st.vel[i].x);
                        scope.set("vY", st.vel[i].y);
                        scope.set("vZ", st.vel[i].z);
                        scope.set("absv", st.vel[i].norm());
                        scope.set("family", f64::from(st.family[i]));
                        scope.set(
                            "mass",
                            model.prop_mass[model.owner_prop[i] as usize],
                        );
                        scope.set("value", 0.0);
                        let _ = program.run(&mut scope);
                        scope.get("value").unwrap_or(0.0)
                    })
                    .collect();
                reduce(*flavour, values)
            }
        }
    }
}

fn reduce(flavour: Reduction, values: Vec<f64>) -> Result<f64, DemError> {
    if values.is_empty() {
        return Err(DemError::config(
            "inspector has no elements to reduce over (no active clumps)",
        ));
    }
    Ok(match flavour {
        Reduction::Max => values.into_iter().fold(f64::NEG_INFINITY, f64::max),
        Reduction::Min => values.into_iter().fold(f64::INFINITY, f64::min),
        Reduction::Sum => values.into_iter().sum(),
    })
}

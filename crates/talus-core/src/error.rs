//! The engine error taxonomy.
//!
//! Fatal conditions are values, not panics: configuration errors surface at
//! initialization, capacity errors carry the offending count and the width
//! ceiling with a remediation hint, runtime saturation carries the cycle it
//! happened on. Physical anomalies are *not* here: they are warnings (see
//! [`crate::AnomalyLog`]).

use talus_compile::CompileError;
use thiserror::Error;

/// Errors surfaced by the solver API.
#[derive(Debug, Error)]
pub enum DemError {
    /// Invalid or incomplete configuration, fatal at initialization.
    #[error("configuration error: {0}")]
    Config(String),

    /// A derived count does not fit its index type. Widen the type (or take
    /// the hinted remedy) and rebuild.
    #[error("{what} count {count} exceeds the {max} its index type can address; {hint}")]
    Capacity {
        /// Which count overflowed.
        what: &'static str,
        /// The offending count.
        count: usize,
        /// The width ceiling.
        max: usize,
        /// Remediation hint.
        hint: &'static str,
    },

    /// Kernel specialization or compilation failed.
    #[error("kernel compilation failed: {source}\nsubstitution map at failure:\n{snapshot}")]
    Compile {
        /// The underlying compiler diagnostic.
        #[source]
        source: CompileError,
        /// Rendering of the substitution map for diagnosis.
        snapshot: String,
    },

    /// A broad-phase bin exceeded the per-bin geometry ceiling.
    #[error(
        "bin {bin} holds {count} geometries at cycle {cycle}, over the configured limit {max}; \
         enlarge the bin size or raise the limit"
    )]
    BinOverflow {
        /// Linearized bin id.
        bin: u64,
        /// Geometries that landed in the bin.
        count: usize,
        /// The configured ceiling.
        max: usize,
        /// dT step counter when the overflow was detected.
        cycle: u64,
    },

    /// The operation needs a ready (initialized) solver.
    #[error("solver is not initialized; call initialize() first")]
    NotInitialized,

    /// An owner id outside the allocated range.
    #[error("owner id {id} is out of range (owner count is {count})")]
    OwnerOutOfRange {
        /// The id passed in.
        id: u32,
        /// Number of owners allocated.
        count: usize,
    },

    /// A family number that never appeared in the configuration.
    #[error("family {family} was never declared in the configuration")]
    UnknownFamily {
        /// The user-level family number.
        family: u32,
    },

    /// Mismatched argument array lengths.
    #[error("argument arrays must have equal lengths: {0}")]
    LengthMismatch(String),

    /// Dump/checkpoint I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed checkpoint file.
    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),
}

impl DemError {
    /// Builds a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Builds a compile error with the substitution snapshot attached.
    #[must_use]
    pub fn compile(source: CompileError, snapshot: String) -> Self {
        Self::Compile { source, snapshot }
    }
}

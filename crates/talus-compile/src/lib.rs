//! Kernel specialization pipeline for the Talus DEM engine.
//!
//! Several kernel classes are parameterized by the registry snapshot and by
//! user-authored code snippets: family motion prescriptions, conditional
//! family-change rules, custom contact force models, and custom inspector
//! predicates. At initialization the engine:
//!
//! 1. serializes dense registry data (mask matrices, radii, material tuples,
//!    counts, world geometry) into literal text and assembles a
//!    [`SubstitutionMap`],
//! 2. expands a kernel template text by one-pass placeholder replacement
//!    ([`specialize`]),
//! 3. hands the expanded source to the compile-and-cache layer
//!    ([`KernelCache`]), which parses it into an executable [`Program`].
//!
//! Placeholders are underscore-delimited tokens (`_nbX_`, `_familyMasks_`,
//! `_forceModel_`, ...). When line-number preservation is requested, each
//! substitution is compacted to a single line first so that compile errors
//! point at the emission site rather than somewhere inside a multi-line
//! splice.
//!
//! The kernel statement language is deliberately small: assignments,
//! `if`/`else`, `switch`/`case`, `break`, and arithmetic/boolean expressions
//! over `f64` scalars with the usual math functions. It is exactly the shape
//! of text the registry emits plus what user snippets are documented to
//! contain; programs evaluate against a [`Scope`] of named bindings.

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]

mod cache;
mod error;
mod lexer;
mod parser;
mod program;
mod subst;
pub mod templates;

pub use cache::KernelCache;
pub use error::CompileError;
pub use program::{Program, Scope};
pub use subst::{compact_code, csv_literals, specialize, SubstitutionMap};

//! Factor graph optimization for the landmark mapper.
//!
//! Measurements become [`Factor`]s over platform states and landmark poses. The factors and the
//! variables they connect live in a [`FactorGraph`], an arena of index-stable records. An
//! [`IncrementalSolver`] takes new factors in batches; the provided [`LmSmoother`] re-optimizes
//! only the neighborhood of the new factors with Levenberg-Marquardt and leaves itself untouched
//! when an update fails.

mod error;
mod factor;
mod graph;
mod smoother;

pub use error::*;
pub use factor::*;
pub use graph::*;
pub use smoother::*;

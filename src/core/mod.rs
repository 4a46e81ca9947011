//! Core error types and the evaluation-argument contract shared by the engine.

use thiserror::Error;

use crate::math::grid::GridError;
use crate::math::linear_solver::LinearSolverError;

pub mod types;

pub use types::*;

/// Invalid problem configuration, detected by the builder before any computation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Expiry is zero, negative or NaN.
    #[error("expiry must be positive, got {0}")]
    NonPositiveExpiry(f64),
    /// A finite horizon was requested with zero timesteps.
    #[error("number of timesteps must be positive for a finite-horizon problem")]
    NonPositiveTimesteps,
    /// Infinite-horizon problems need an implicit treatment of both controls.
    #[error("only a fully implicit handling can be used for infinite-horizon problems")]
    InfiniteHorizonRequiresImplicit,
    /// Adaptive timestepping was combined with an infinite horizon or explicit events.
    #[error(
        "adaptive timestepping can only be used on finite-horizon problems with a fully implicit handling"
    )]
    AdaptiveTimesteppingUnsupported,
    /// Iterated optimal stopping was combined with an unsupported option.
    #[error("iterated optimal stopping does not support {0}")]
    IteratedOptimalStoppingUnsupported(&'static str),
    /// A per-dimension coefficient or boundary routine was registered out of range.
    #[error("{what} registered for dimension {index}, but the spatial grid has {dimensions}")]
    DimensionOutOfRange {
        what: &'static str,
        index: usize,
        dimensions: usize,
    },
    /// A query point does not match the spatial dimension.
    #[error("point has {actual} coordinates, but the spatial grid has {expected} dimensions")]
    PointDimension { expected: usize, actual: usize },
    /// A required builder input was never supplied.
    #[error("missing required input: {0}")]
    MissingField(&'static str),
    /// A numerical tolerance or scaling parameter is not a positive finite number.
    #[error("{name} must be finite and > 0, got {value}")]
    InvalidTolerance { name: &'static str, value: f64 },
    /// An iteration cap of zero was configured.
    #[error("{0} must be at least 1")]
    ZeroIterationCap(&'static str),
    /// `2^refinement` timesteps do not fit in a `usize`.
    #[error("refinement level {0} is too large")]
    RefinementTooLarge(usize),
    /// A convergence study was requested with `min > max`.
    #[error("refinement range is empty: min {min} > max {max}")]
    InvalidRefinementRange { min: usize, max: usize },
    /// One of the grids is malformed.
    #[error("invalid grid: {0}")]
    Grid(#[from] GridError),
    /// A serialized configuration could not be decoded.
    #[error("invalid solver configuration: {0}")]
    Parse(String),
}

/// Fixed-point loop that failed to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStage {
    /// Per-timestep policy and/or penalty iteration.
    Inner,
    /// Trajectory sweeps of iterated optimal stopping.
    Trajectory,
    /// Adaptive time stepping, capped in the number of steps.
    Timestep,
}

impl std::fmt::Display for IterationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inner => f.write_str("inner policy/penalty"),
            Self::Trajectory => f.write_str("iterated optimal stopping"),
            Self::Timestep => f.write_str("adaptive timestepping"),
        }
    }
}

/// Errors surfaced by problem construction and by [`crate::Hjbqvi::solve`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HjbqviError {
    /// The problem configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The linear solver failed to factor or to converge.
    #[error("linear solver diverged at timestep {timestep} after {iterations} iterations: {source}")]
    SolverDivergence {
        timestep: usize,
        iterations: usize,
        #[source]
        source: LinearSolverError,
    },
    /// A fixed-point loop hit its iteration cap.
    ///
    /// `error` is the last relative change, or the fraction of the horizon still left for
    /// [`IterationStage::Timestep`].
    #[error(
        "{stage} iteration failed to converge at timestep {timestep} within {iterations} iterations (error {error:e})"
    )]
    ConvergenceFailure {
        stage: IterationStage,
        timestep: usize,
        iterations: usize,
        error: f64,
    },
    /// A transition or a semi-Lagrangian foot point produced a non-finite state.
    #[error("non-finite state at timestep {timestep}: {source}")]
    NonFiniteState {
        timestep: usize,
        #[source]
        source: GridError,
    },
}

impl HjbqviError {
    pub(crate) fn divergence(timestep: usize, source: LinearSolverError) -> Self {
        Self::SolverDivergence {
            timestep,
            iterations: source.iterations(),
            source,
        }
    }

    pub(crate) fn non_finite(timestep: usize, source: GridError) -> Self {
        Self::NonFiniteState { timestep, source }
    }
}

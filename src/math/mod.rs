//! Numerical building blocks: grids, interpolation and sparse linear solvers.

pub mod grid;
pub mod interpolation;
pub mod linear_solver;

pub use grid::{Axis, GridError, RectilinearGrid};
pub use interpolation::{InterpolationStencil, PiecewiseLinear};
pub use linear_solver::{
    BiCgStabSolver, LinearSolver, LinearSolverError, LinearSolverKind, LuSolver,
};

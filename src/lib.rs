//! `qvi-pde` solves Hamilton-Jacobi-Bellman quasi-variational inequalities (HJB-QVI):
//! control problems that mix continuous stochastic control with discretionary impulse
//! control, posed on a rectilinear state space and marched backward from a terminal
//! condition.
//!
//! The engine discretizes the controlled generator with a monotone finite-difference
//! stencil (central differences with an upwind fallback), so every assembled system is an
//! M-matrix. Controls are resolved either implicitly, by policy iteration over a finite
//! candidate grid, or explicitly, by a semi-Lagrangian event evaluated from the previous
//! timestep. The impulse free boundary is handled either explicitly or through a
//! penalized / direct-control linear system iterated to a fixed point.
//!
//! References:
//! - Azimzadeh and Forsyth (2016), *Weakly chained matrices, policy iteration, and
//!   impulse control*, SIAM J. Numer. Anal. 54(3).
//! - Forsyth and Labahn (2007), *Numerical methods for controlled Hamilton-Jacobi-Bellman
//!   PDEs in finance*, J. Comput. Finance 11(2).
//! - Howard (1960), *Dynamic Programming and Markov Processes*.
//!
//! Numerical considerations:
//! - Each call to [`Hjbqvi::solve`] refines the spatial grid by inserting a tick between
//!   each pair, doubles the timestep count and halves the adaptive-step target, so a
//!   sweep over refinement levels exposes the empirical convergence order.
//! - Fixed-point loops are capped; hitting a cap surfaces
//!   [`HjbqviError::ConvergenceFailure`] instead of looping forever.
//!
//! # Feature Flags
//! - `parallel`: solves independent refinement levels on the Rayon pool in
//!   [`Hjbqvi::solve_levels`].
//!
//! # Quick Start
//! Price a European call by reducing the QVI to the Black-Scholes equation:
//! ```rust
//! use qvi_pde::problems::black_scholes_call;
//!
//! let problem = black_scholes_call(0.04, 0.20, 100.0, 1.0, 25)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! let result = problem.solve(1).unwrap();
//! let value = result.value_at(&[100.0]);
//! assert!(value > 9.5 && value < 10.5);
//! ```
//!
//! Build a problem from scratch:
//! ```rust
//! use qvi_pde::math::grid::Axis;
//! use qvi_pde::{ControlScheme, Handling, Hjbqvi, ImpulseScheme};
//!
//! let problem = Hjbqvi::builder()
//!     .spatial_axis(Axis::uniform(-1.0, 1.0, 21).unwrap())
//!     .stochastic_control_axis(Axis::uniform(-1.0, 1.0, 5).unwrap())
//!     .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
//!     .expiry(0.5)
//!     .timesteps(10)
//!     .discount(|_, _| 0.1)
//!     .volatility(0, |_, _| 0.3)
//!     .controlled_drift(0, |_, _, q| q[0])
//!     .controlled_flow(|_, x, q| -x[0] * x[0] - 0.1 * q[0] * q[0])
//!     .exit_function(|_, _| 0.0)
//!     .handling(Handling::new(ControlScheme::Penalty, ImpulseScheme::Implicit))
//!     .build()
//!     .unwrap();
//!
//! let result = problem.solve(0).unwrap();
//! assert_eq!(result.solution.len(), 21);
//! ```

pub mod convergence;
pub mod core;
pub mod engines;
pub mod math;
pub mod problems;

pub use crate::core::{ConfigError, HjbqviError, IterationStage};
pub use crate::engines::hjbqvi::{
    BoundaryContext, BoundarySide, BoundaryStencil, ControlScheme, Handling, Hjbqvi,
    HjbqviBuilder, HjbqviResult, ImpulseScheme, SolverConfig, TimeScheme,
};
pub use crate::math::linear_solver::LinearSolverKind;

/// Common imports for ergonomic usage.
pub mod prelude {
    pub use crate::convergence::{
        ConvergenceRow, ConvergenceTable, NodeTable, convergence_table,
    };
    pub use crate::core::*;
    pub use crate::engines::hjbqvi::*;
    pub use crate::math::grid::{Axis, RectilinearGrid};
    pub use crate::math::interpolation::PiecewiseLinear;
    pub use crate::math::linear_solver::LinearSolverKind;
}

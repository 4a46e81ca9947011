//! Finite-difference engine for HJB quasi-variational inequalities.
//!
//! Each timestep solves
//!
//! ```text
//! (shift I + dt A(q)) u = history + dt b(q)
//! ```
//!
//! with `q` chosen by policy iteration (or by the explicit semi-Lagrangian event) and the
//! impulse constraint `u >= M u` enforced by penalty, direct control, obstacle rows of
//! iterated optimal stopping, or an explicit event after the solve.

pub mod boundary;
pub mod config;
pub mod event;
pub mod impulse;
pub mod iterated;
pub mod operator;
pub mod policy;
pub mod problem;
pub mod result;
mod solve;
pub mod stepper;
pub mod system;

pub use boundary::{
    BoundaryContext, BoundaryRoutine, BoundarySide, BoundaryStencil, linear_boundary,
    zero_diffusion_right_boundary,
};
pub use config::{ControlScheme, Handling, ImpulseScheme, SolverConfig, TimeScheme};
pub use event::{EventDecisions, ExplicitEvent, combine};
pub use impulse::{ConstraintMode, ImpulseOperator, PenaltyMethod};
pub use iterated::{TrajectoryBuffers, sweep_converged};
pub use operator::{
    ControlAssignment, ControlledOperator, GeneratorSource, monotone_coefficients,
};
pub use policy::{PolicyIteration, relative_error};
pub use problem::{Hjbqvi, HjbqviBuilder};
pub use result::HjbqviResult;
pub use stepper::{ReverseStepper, Step, StepperState};
pub use system::StepCoefficients;

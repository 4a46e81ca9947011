//! Numerical handling and solver settings.

use serde::{Deserialize, Serialize};

use crate::core::ConfigError;
use crate::math::linear_solver::LinearSolverKind;

/// How the stochastic control is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlScheme {
    /// Explicit semi-Lagrangian event: the drift moves the foot point, the flow is paid
    /// over the step, and the generator keeps only diffusion and discounting.
    SemiLagrangian,
    /// Policy iteration with the impulse constraint added as a penalty.
    Penalty,
    /// Policy iteration with constrained rows replaced by impulse rows.
    DirectControl,
    /// Outer trajectory iteration over a sequence of coupled optimal-stopping problems.
    IteratedOptimalStopping,
}

/// How the impulse free boundary is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpulseScheme {
    /// Intervention decided after each solve from the computed values.
    Explicit,
    /// Intervention coupled into the linear system and iterated to a fixed point.
    Implicit,
}

/// Numerical handling: the pair (stochastic control, impulse).
///
/// Semi-Lagrangian control with implicit impulse uses the penalty formulation for the
/// impulse constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handling {
    pub control: ControlScheme,
    pub impulse: ImpulseScheme,
}

impl Handling {
    pub const PENALTY: Self = Self::new(ControlScheme::Penalty, ImpulseScheme::Implicit);
    pub const DIRECT_CONTROL: Self =
        Self::new(ControlScheme::DirectControl, ImpulseScheme::Implicit);
    pub const SEMI_LAGRANGIAN: Self =
        Self::new(ControlScheme::SemiLagrangian, ImpulseScheme::Explicit);
    pub const ITERATED_OPTIMAL_STOPPING: Self = Self::new(
        ControlScheme::IteratedOptimalStopping,
        ImpulseScheme::Implicit,
    );

    pub const fn new(control: ControlScheme, impulse: ImpulseScheme) -> Self {
        Self { control, impulse }
    }

    #[inline]
    pub fn semi_lagrangian(self) -> bool {
        self.control == ControlScheme::SemiLagrangian
    }

    #[inline]
    pub fn explicit_impulse(self) -> bool {
        self.impulse == ImpulseScheme::Explicit
    }

    /// Both controls resolved inside the linear system: no explicit event is applied.
    #[inline]
    pub fn fully_implicit(self) -> bool {
        !self.semi_lagrangian() && !self.explicit_impulse()
    }

    /// Both controls resolved by the explicit event: one linear solve per step.
    #[inline]
    pub fn fully_explicit(self) -> bool {
        self.semi_lagrangian() && self.explicit_impulse()
    }

    /// Constrained rows are replaced by impulse (or obstacle) rows instead of penalized.
    #[inline]
    pub fn direct(self) -> bool {
        matches!(
            self.control,
            ControlScheme::DirectControl | ControlScheme::IteratedOptimalStopping
        )
    }

    #[inline]
    pub fn iterated_optimal_stopping(self) -> bool {
        self.control == ControlScheme::IteratedOptimalStopping
    }
}

impl Default for Handling {
    fn default() -> Self {
        Self::PENALTY
    }
}

/// Time discretization of the backward march.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeScheme {
    /// Fully implicit first-order stepping.
    #[default]
    BackwardEuler,
    /// Variable-step second-order backward differentiation, started with backward Euler.
    Bdf2,
}

/// Solver settings that do not depend on the problem data.
///
/// Serializable so a convergence study can be driven from a JSON file:
///
/// ```
/// use qvi_pde::{ControlScheme, SolverConfig};
///
/// let config = SolverConfig::from_json(
///     r#"{ "handling": { "control": "direct_control", "impulse": "implicit" },
///          "time_scheme": "bdf2" }"#,
/// )
/// .unwrap();
/// assert_eq!(config.handling.control, ControlScheme::DirectControl);
/// assert_eq!(config.iteration_tolerance, 1e-6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub handling: Handling,
    pub linear_solver: LinearSolverKind,
    pub time_scheme: TimeScheme,
    /// Penalty weight is `1 / (scaling_factor * dt)` (`1 / scaling_factor` without time).
    pub scaling_factor: f64,
    /// Relative-change tolerance of the policy/penalty and trajectory iterations.
    pub iteration_tolerance: f64,
    /// Enables adaptive timestepping with this target relative change per step.
    pub target_timestep_relative_error: Option<f64>,
    /// Cap on the number of adaptive steps.
    pub max_timesteps: usize,
    pub max_inner_iterations: usize,
    pub max_outer_iterations: usize,
    /// Relative residual tolerance of the iterative linear solver.
    pub solver_tolerance: f64,
    pub max_solver_iterations: usize,
    pub refine_stochastic_control_grid: bool,
    pub refine_impulse_control_grid: bool,
    /// Allows caching the generator under semi-Lagrangian handling.
    pub time_independent_coefficients: bool,
    /// Skips semi-Lagrangian candidates whose foot point leaves the spatial grid.
    pub drop_off_grid_foot_points: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            handling: Handling::default(),
            linear_solver: LinearSolverKind::default(),
            time_scheme: TimeScheme::default(),
            scaling_factor: 1e-2,
            iteration_tolerance: 1e-6,
            target_timestep_relative_error: None,
            max_timesteps: 100_000,
            max_inner_iterations: 500,
            max_outer_iterations: 200,
            solver_tolerance: 1e-10,
            max_solver_iterations: 1_000,
            refine_stochastic_control_grid: true,
            refine_impulse_control_grid: true,
            time_independent_coefficients: false,
            drop_off_grid_foot_points: false,
        }
    }
}

impl SolverConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    #[inline]
    pub fn adaptive(&self) -> bool {
        self.target_timestep_relative_error.is_some()
    }

    /// Checks the numerical parameters in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::InvalidTolerance { name, value })
            }
        };
        positive("scaling_factor", self.scaling_factor)?;
        positive("iteration_tolerance", self.iteration_tolerance)?;
        positive("solver_tolerance", self.solver_tolerance)?;
        if let Some(target) = self.target_timestep_relative_error {
            positive("target_timestep_relative_error", target)?;
        }
        if self.max_inner_iterations == 0 {
            return Err(ConfigError::ZeroIterationCap("max_inner_iterations"));
        }
        if self.max_outer_iterations == 0 {
            return Err(ConfigError::ZeroIterationCap("max_outer_iterations"));
        }
        if self.max_solver_iterations == 0 {
            return Err(ConfigError::ZeroIterationCap("max_solver_iterations"));
        }
        if self.max_timesteps == 0 {
            return Err(ConfigError::ZeroIterationCap("max_timesteps"));
        }
        Ok(())
    }
}

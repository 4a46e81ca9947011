use nalgebra::DVector;

use crate::math::grid::RectilinearGrid;
use crate::math::interpolation::PiecewiseLinear;

/// Output of [`crate::Hjbqvi::solve`] at one refinement level.
///
/// Controls are reported per control dimension, one value per spatial node. Inside the
/// intervention region the stochastic controls are `NaN`; outside it the impulse controls
/// are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct HjbqviResult {
    /// Refined spatial grid the solution lives on.
    pub spatial_grid: RectilinearGrid,
    pub stochastic_control_grid: RectilinearGrid,
    pub impulse_control_grid: RectilinearGrid,
    /// Value function at time zero.
    pub solution: DVector<f64>,
    pub stochastic_controls: Vec<DVector<f64>>,
    pub impulse_controls: Vec<DVector<f64>>,
    /// Nodes where intervening is optimal at time zero.
    pub intervention: Vec<bool>,
    /// Timesteps actually taken; zero for a stationary problem.
    pub timesteps: usize,
    /// `scaling_factor * dt`; `NaN` when the impulse is explicit and no penalty is coupled.
    pub scaling_factor: f64,
    /// `NaN` when the impulse is explicit.
    pub iteration_tolerance: f64,
    /// Mean fixed-point iterations per timestep (number of sweeps for iterated optimal
    /// stopping); `NaN` under fully explicit handling.
    pub mean_inner_iterations: f64,
    /// Mean iterations per linear solve; `NaN` for the direct solver.
    pub mean_solver_iterations: f64,
    pub execution_time_seconds: f64,
}

impl HjbqviResult {
    /// Solution interpolated at `point`, clamped to the grid; `NaN` when a coordinate is
    /// not finite.
    pub fn value_at(&self, point: &[f64]) -> f64 {
        PiecewiseLinear::new(&self.spatial_grid, &self.solution)
            .interpolate(point)
            .unwrap_or(f64::NAN)
    }

    pub fn nodes(&self) -> usize {
        self.spatial_grid.size()
    }

    /// Number of nodes in the intervention region.
    pub fn intervention_count(&self) -> usize {
        self.intervention.iter().filter(|&&m| m).count()
    }
}

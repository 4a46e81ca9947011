//! Iterated optimal stopping: the QVI is solved as a sequence of optimal-stopping
//! problems, each using the previous trajectory to freeze the intervention obstacle.
//!
//! Every sweep marches the whole time grid. The first sweep ignores the impulse; later
//! sweeps replace constrained rows with `u_i = M u_prev`, where `u_prev` is the previous
//! sweep's solution at the same time. Sweeps stop once every time slice moved by less than
//! the tolerance.

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::core::{HjbqviError, IterationStage};
use crate::engines::hjbqvi::policy::relative_error;
use crate::engines::hjbqvi::solve::Engine;
use crate::engines::hjbqvi::system::StepCoefficients;

/// Two full trajectories, one being written and one from the previous sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryBuffers {
    /// Sweep in progress; slice 0 is the payoff at expiry.
    pub current: Vec<DVector<f64>>,
    pub previous: Vec<DVector<f64>>,
}

impl TrajectoryBuffers {
    /// `timesteps + 1` slices in each buffer, all set to `initial`.
    pub fn new(timesteps: usize, initial: &DVector<f64>) -> Self {
        Self {
            current: vec![initial.clone(); timesteps + 1],
            previous: vec![initial.clone(); timesteps + 1],
        }
    }

    pub fn swap_roles(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
    }
}

/// The first sweep never counts as converged; later sweeps converge when every slice
/// error is within `tolerance`.
pub fn sweep_converged(first: bool, slice_errors: &[f64], tolerance: f64) -> bool {
    !first && slice_errors.iter().all(|&e| e <= tolerance)
}

impl Engine<'_> {
    /// Runs trajectory sweeps until convergence and returns the time-zero slice.
    pub(super) fn iterate_trajectories(
        &mut self,
        expiry: f64,
        timesteps: usize,
        initial: DVector<f64>,
    ) -> Result<DVector<f64>, HjbqviError> {
        let dt = expiry / timesteps as f64;
        self.set_step_weight(dt);
        let coefficients = StepCoefficients::backward_euler(dt);
        let mut buffers = TrajectoryBuffers::new(timesteps, &initial);

        let mut first = true;
        let mut sweeps = 0;
        loop {
            sweeps += 1;
            buffers.current[0] = initial.clone();
            let mut errors = Vec::with_capacity(timesteps);

            for n in 1..=timesteps {
                let time = if n == timesteps {
                    0.0
                } else {
                    expiry * (1.0 - n as f64 / timesteps as f64)
                };
                let iterand = if first {
                    &buffers.current[n - 1]
                } else {
                    &buffers.previous[n]
                };
                let solved = self.solve_once(
                    time,
                    coefficients,
                    &buffers.current[n - 1],
                    iterand,
                    !first,
                    n - 1,
                )?;
                if !first {
                    errors.push(relative_error(&solved, &buffers.previous[n]));
                }
                buffers.current[n] = solved;
            }

            let converged = sweep_converged(first, &errors, self.tolerance);
            let error = errors.iter().copied().fold(0.0, f64::max);
            debug!(sweep = sweeps, error, "trajectory sweep finished");
            first = false;
            buffers.swap_roles();

            if converged {
                self.inner_iterations.push(sweeps);
                return Ok(buffers.previous.swap_remove(timesteps));
            }
            if sweeps >= self.max_outer {
                warn!(sweeps, error, "iterated optimal stopping hit its cap");
                return Err(HjbqviError::ConvergenceFailure {
                    stage: IterationStage::Trajectory,
                    timestep: timesteps,
                    iterations: sweeps,
                    error,
                });
            }
        }
    }
}

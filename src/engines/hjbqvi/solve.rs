//! Solve driver: refinement, time marching, inner fixed-point iteration and result
//! extraction.

use std::time::Instant;

use nalgebra::DVector;
use tracing::{debug, trace, warn};

use crate::core::{ConfigError, HjbqviError, IterationStage, mean_count};
use crate::engines::hjbqvi::event::ExplicitEvent;
use crate::engines::hjbqvi::impulse::{ConstraintMode, ImpulseOperator, PenaltyMethod};
use crate::engines::hjbqvi::operator::{ControlAssignment, ControlledOperator, GeneratorSource};
use crate::engines::hjbqvi::policy::{PolicyIteration, relative_error};
use crate::engines::hjbqvi::problem::Hjbqvi;
use crate::engines::hjbqvi::result::HjbqviResult;
use crate::engines::hjbqvi::stepper::{ReverseStepper, StepperState};
use crate::engines::hjbqvi::system::{Constraint, StepCoefficients, assemble, pde_residual};
use crate::math::grid::RectilinearGrid;
use crate::math::linear_solver::LinearSolver;

/// Impulse constraint coupled into the linear system.
pub(super) struct ImplicitImpulse<'a> {
    pub impulse: ImpulseOperator<'a>,
    pub penalty: PenaltyMethod,
}

/// Controls and intervention region reported by a finished solve.
struct Decisions {
    stochastic: Vec<DVector<f64>>,
    impulse: Vec<DVector<f64>>,
    intervention: Vec<bool>,
}

/// State of one solve on fixed grids.
pub(super) struct Engine<'a> {
    pub problem: &'a Hjbqvi,
    pub grid: &'a RectilinearGrid,
    operator: ControlledOperator<'a>,
    generator: GeneratorSource<'a>,
    policy: Option<PolicyIteration>,
    implicit_impulse: Option<ImplicitImpulse<'a>>,
    event: Option<ExplicitEvent<'a>>,
    solver: Box<dyn LinearSolver>,
    zero_controls: ControlAssignment,
    pub inner_iterations: Vec<usize>,
    pub tolerance: f64,
    pub max_outer: usize,
    max_inner: usize,
}

impl<'a> Engine<'a> {
    pub fn new(
        problem: &'a Hjbqvi,
        grid: &'a RectilinearGrid,
        stochastic_grid: &'a RectilinearGrid,
        impulse_grid: &'a RectilinearGrid,
        penalty_weight: f64,
    ) -> Self {
        let config = problem.config();
        let handling = config.handling;
        let n = grid.size();

        let policy = (!handling.semi_lagrangian()).then(|| PolicyIteration::new(stochastic_grid, n));
        let implicit_impulse = (!handling.explicit_impulse()).then(|| {
            let mode = if handling.iterated_optimal_stopping() {
                ConstraintMode::Obstacle
            } else if handling.direct() {
                ConstraintMode::Direct
            } else {
                ConstraintMode::Penalty
            };
            ImplicitImpulse {
                impulse: ImpulseOperator::new(problem, grid, impulse_grid),
                penalty: PenaltyMethod::new(mode, penalty_weight, n),
            }
        });
        let event = (!handling.fully_implicit())
            .then(|| ExplicitEvent::new(problem, grid, stochastic_grid, impulse_grid));

        Self {
            problem,
            grid,
            operator: ControlledOperator::new(problem, grid),
            generator: GeneratorSource::new(problem, grid),
            policy,
            implicit_impulse,
            event,
            solver: config
                .linear_solver
                .build(config.solver_tolerance, config.max_solver_iterations),
            zero_controls: ControlAssignment::zeros(n, stochastic_grid.dimension()),
            inner_iterations: Vec::new(),
            tolerance: config.iteration_tolerance,
            max_outer: config.max_outer_iterations,
            max_inner: config.max_inner_iterations,
        }
    }

    /// Penalty weight `1 / (scaling_factor * dt)` for the coming step.
    pub fn set_step_weight(&mut self, dt: f64) {
        let scaling = self.problem.config().scaling_factor;
        if let Some(implicit) = self.implicit_impulse.as_mut() {
            implicit.penalty.set_weight(1.0 / (scaling * dt));
        }
    }

    /// One policy/penalty update followed by one linear solve.
    ///
    /// `coupled = false` solves without the impulse constraint.
    pub fn solve_once(
        &mut self,
        time: f64,
        coefficients: StepCoefficients,
        history: &DVector<f64>,
        iterate: &DVector<f64>,
        coupled: bool,
        timestep: usize,
    ) -> Result<DVector<f64>, HjbqviError> {
        if let Some(policy) = self.policy.as_mut() {
            policy.improve(&self.operator, time, iterate);
        }

        let (matrix, rhs) = {
            let controls = self
                .policy
                .as_ref()
                .map_or(&self.zero_controls, PolicyIteration::controls);
            let generator = self.generator.generator(time, controls);
            let source = self.operator.source(time, controls);
            let constraint = match self.implicit_impulse.as_mut() {
                Some(implicit) if coupled => {
                    implicit
                        .impulse
                        .improve(time, iterate)
                        .map_err(|e| HjbqviError::non_finite(timestep, e))?;
                    let residual =
                        pde_residual(&generator, &source, coefficients, history, iterate);
                    implicit
                        .penalty
                        .update_mask(&implicit.impulse, iterate, &residual);
                    Some(Constraint {
                        penalty: &implicit.penalty,
                        impulse: &implicit.impulse,
                    })
                }
                _ => None,
            };
            assemble(&generator, &source, coefficients, history, constraint)
        };

        self.solver
            .initialize(matrix)
            .map_err(|e| HjbqviError::divergence(timestep, e))?;
        self.solver
            .solve(&rhs, iterate)
            .map_err(|e| HjbqviError::divergence(timestep, e))
    }

    /// Repeats [`Self::solve_once`] until the relative change drops below tolerance.
    ///
    /// Fully explicit handling solves once: nothing inside the system depends on the
    /// iterate.
    pub fn inner_solve(
        &mut self,
        time: f64,
        coefficients: StepCoefficients,
        history: &DVector<f64>,
        guess: DVector<f64>,
        timestep: usize,
    ) -> Result<DVector<f64>, HjbqviError> {
        if self.problem.handling().fully_explicit() {
            return self.solve_once(time, coefficients, history, &guess, true, timestep);
        }

        let mut iterate = guess;
        let mut error = f64::INFINITY;
        for iteration in 1..=self.max_inner {
            let next = self.solve_once(time, coefficients, history, &iterate, true, timestep)?;
            error = relative_error(&next, &iterate);
            iterate = next;
            if error <= self.tolerance {
                trace!(timestep, iteration, error, "inner iteration converged");
                self.inner_iterations.push(iteration);
                return Ok(iterate);
            }
        }

        warn!(
            timestep,
            iterations = self.max_inner,
            error,
            "inner iteration hit its cap"
        );
        Err(HjbqviError::ConvergenceFailure {
            stage: IterationStage::Inner,
            timestep,
            iterations: self.max_inner,
            error,
        })
    }

    /// Marches backward from `initial` at expiry down to time zero.
    ///
    /// An adaptive march that runs out of steps before time zero is a
    /// [`IterationStage::Timestep`] convergence failure; `error` is the time left
    /// as a fraction of the horizon.
    pub fn march(
        &mut self,
        mut stepper: ReverseStepper,
        initial: DVector<f64>,
    ) -> Result<(DVector<f64>, usize), HjbqviError> {
        let scheme = self.problem.config().time_scheme;
        let mut current = initial;
        let mut older: Option<(DVector<f64>, f64)> = None;

        while let Some(step) = stepper.advance() {
            self.set_step_weight(step.dt);
            let coefficients =
                StepCoefficients::for_scheme(scheme, step.dt, older.as_ref().map(|o| o.1));
            let history = coefficients.history(&current, older.as_ref().map(|o| &o.0));
            let solved =
                self.inner_solve(step.to, coefficients, &history, current.clone(), step.index)?;
            let next = match self.event.as_mut() {
                Some(event) => event
                    .apply(&solved, step.to, step.dt)
                    .map_err(|e| HjbqviError::non_finite(step.index, e))?,
                None => solved,
            };
            stepper.accept(&current, &next);
            trace!(step = step.index, time = step.to, dt = step.dt, "timestep complete");
            older = Some((std::mem::replace(&mut current, next), step.dt));
        }

        let taken = stepper.steps_taken();
        if stepper.state() == StepperState::Exhausted {
            let error = stepper.time() / self.problem.expiry();
            warn!(steps = taken, error, "adaptive timestepping hit its cap");
            return Err(HjbqviError::ConvergenceFailure {
                stage: IterationStage::Timestep,
                timestep: taken,
                iterations: taken,
                error,
            });
        }
        Ok((current, taken))
    }

    /// Solves the stationary system `A u = b` (with the impulse constraint).
    pub fn stationary(&mut self, initial: DVector<f64>) -> Result<DVector<f64>, HjbqviError> {
        let history = self.grid.zeros();
        self.inner_solve(0.0, StepCoefficients::stationary(), &history, initial, 0)
    }

    fn decisions(&self) -> Decisions {
        let n = self.grid.size();
        let stochastic = match (&self.policy, &self.event) {
            (Some(policy), _) => policy.controls().to_vectors(),
            (None, Some(event)) => event.decisions().stochastic_controls.to_vectors(),
            (None, None) => self.zero_controls.to_vectors(),
        };
        let (impulse, intervention) = match (&self.implicit_impulse, &self.event) {
            (Some(implicit), _) => (
                implicit.impulse.controls().to_vectors(),
                implicit.penalty.mask().to_vec(),
            ),
            (None, Some(event)) => (
                event.decisions().impulse_controls.to_vectors(),
                event.decisions().intervention.clone(),
            ),
            (None, None) => (
                ControlAssignment::zeros(n, self.problem.impulse_control_grid().dimension())
                    .to_vectors(),
                vec![false; n],
            ),
        };
        Decisions {
            stochastic,
            impulse,
            intervention,
        }
    }
}

/// Blanks the control that is not in force: stochastic controls inside the intervention
/// region, impulse controls outside it.
fn mask_controls(
    stochastic: &mut [DVector<f64>],
    impulse: &mut [DVector<f64>],
    intervention: &[bool],
) {
    for (i, &intervene) in intervention.iter().enumerate() {
        let blanked = if intervene {
            &mut *stochastic
        } else {
            &mut *impulse
        };
        for control in blanked.iter_mut() {
            control[i] = f64::NAN;
        }
    }
}

impl Hjbqvi {
    /// Solves the problem at refinement level `refinement`.
    ///
    /// Level `k` inserts `k` rounds of midpoints in every spatial axis (and in the control
    /// axes unless disabled), multiplies the timestep count by `2^k` and divides the
    /// adaptive target by `2^k`.
    ///
    /// # Errors
    /// [`HjbqviError::SolverDivergence`] when a linear solve fails,
    /// [`HjbqviError::ConvergenceFailure`] when a fixed-point loop or the adaptive
    /// stepper hits its cap, [`HjbqviError::NonFiniteState`] when a transition or foot
    /// point leaves the reals, and [`ConfigError::RefinementTooLarge`] when `2^refinement`
    /// timesteps overflow.
    pub fn solve(&self, refinement: usize) -> Result<HjbqviResult, HjbqviError> {
        let start = Instant::now();
        let config = &self.config;
        let handling = config.handling;

        let factor = u32::try_from(refinement)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift))
            .ok_or(ConfigError::RefinementTooLarge(refinement))?;
        let timesteps = self
            .timesteps
            .checked_mul(factor)
            .ok_or(ConfigError::RefinementTooLarge(refinement))?;

        let spatial_grid = self.spatial_grid.refined(refinement);
        let stochastic_control_grid = if config.refine_stochastic_control_grid {
            self.stochastic_control_grid.refined(refinement)
        } else {
            self.stochastic_control_grid.clone()
        };
        let impulse_control_grid = if config.refine_impulse_control_grid {
            self.impulse_control_grid.refined(refinement)
        } else {
            self.impulse_control_grid.clone()
        };

        let finite = self.finite_horizon();
        let nominal_dt = if finite {
            self.expiry / timesteps as f64
        } else {
            1.0
        };
        let scaling_factor = config.scaling_factor * nominal_dt;

        debug!(
            refinement,
            nodes = spatial_grid.size(),
            timesteps,
            ?handling,
            "solving HJB-QVI"
        );

        let (solution, steps, decisions, inner, solver) = {
            let mut engine = Engine::new(
                self,
                &spatial_grid,
                &stochastic_control_grid,
                &impulse_control_grid,
                1.0 / scaling_factor,
            );
            let initial = spatial_grid.image(|x| self.exit_value(self.expiry, x));

            let (solution, steps) = if handling.iterated_optimal_stopping() {
                let solution = engine.iterate_trajectories(self.expiry, timesteps, initial)?;
                (solution, timesteps)
            } else if !finite {
                (engine.stationary(initial)?, 0)
            } else {
                let stepper = match config.target_timestep_relative_error {
                    Some(target) => ReverseStepper::adaptive(
                        self.expiry,
                        nominal_dt,
                        target / factor as f64,
                        config.max_timesteps,
                    ),
                    None => ReverseStepper::constant(self.expiry, timesteps),
                };
                engine.march(stepper, initial)?
            };

            let inner = if handling.fully_explicit() {
                f64::NAN
            } else {
                mean_count(&engine.inner_iterations)
            };
            let solver = mean_count(engine.solver.iterations());
            (solution, steps, engine.decisions(), inner, solver)
        };

        let Decisions {
            mut stochastic,
            mut impulse,
            intervention,
        } = decisions;
        mask_controls(&mut stochastic, &mut impulse, &intervention);

        // Neither number enters an explicit impulse.
        let explicit = handling.explicit_impulse();
        let execution_time_seconds = start.elapsed().as_secs_f64();
        debug!(
            refinement,
            steps,
            mean_inner_iterations = inner,
            mean_solver_iterations = solver,
            execution_time_seconds,
            "solve finished"
        );

        Ok(HjbqviResult {
            spatial_grid,
            stochastic_control_grid,
            impulse_control_grid,
            solution,
            stochastic_controls: stochastic,
            impulse_controls: impulse,
            intervention,
            timesteps: steps,
            scaling_factor: if explicit { f64::NAN } else { scaling_factor },
            iteration_tolerance: if explicit {
                f64::NAN
            } else {
                config.iteration_tolerance
            },
            mean_inner_iterations: inner,
            mean_solver_iterations: solver,
            execution_time_seconds,
        })
    }

    /// Solves several refinement levels, in parallel with the `parallel` feature.
    pub fn solve_levels(&self, levels: &[usize]) -> Vec<Result<HjbqviResult, HjbqviError>> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            levels.par_iter().map(|&level| self.solve(level)).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            levels.iter().map(|&level| self.solve(level)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_blanks_the_inactive_control() {
        let mut stochastic = vec![DVector::from_vec(vec![1.0, 2.0])];
        let mut impulse = vec![DVector::from_vec(vec![3.0, 4.0])];
        mask_controls(&mut stochastic, &mut impulse, &[true, false]);
        assert!(stochastic[0][0].is_nan());
        assert_eq!(stochastic[0][1], 2.0);
        assert_eq!(impulse[0][0], 3.0);
        assert!(impulse[0][1].is_nan());
    }
}
